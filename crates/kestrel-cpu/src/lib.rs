//! The Kestrel 80386 CPU core.
//!
//! One [`Cpu`] models one processor: register file, segmentation, two-level
//! paging, the table-driven instruction decoder and execution engine, and the
//! interrupt/exception/task-switch machinery. The core is single-threaded and
//! cooperative; the owning machine calls [`Cpu::step`] in a loop and services
//! the PIC between instructions.
//!
//! The core reaches the outside world through three narrow seams:
//! - physical memory via the owned [`kestrel_mem::Bus`] (devices register
//!   [`kestrel_mem::MemoryProvider`] windows there),
//! - port I/O via the [`IoPorts`] trait,
//! - the interrupt request line via [`InterruptLine`].

mod addr;
mod cpu;
mod decode;
mod descriptor;
mod exception;
mod flags;
mod interp;
mod interrupt;
mod mem;
mod paging;
mod segment;
mod snapshot;
mod state;
mod tasking;
mod transfer;

pub use addr::{LinearAddress, LogicalAddress, PhysicalAddress};
pub use cpu::{Cpu, CpuConfig, Env, InterruptLine, IoPorts, NoIrq, OpenBusIo};
pub use decode::{Instruction, ModRm, RepPrefix, RmLocation};
pub use descriptor::{
    parse_descriptor, CodeSegment, DataSegment, Descriptor, Gate, GateKind, LdtSegment, Selector,
    TssDescriptor,
};
pub use exception::{Exception, InterruptSource};
pub use paging::{MemoryAccess, PteFlags};
pub use snapshot::CpuSnapshot;
pub use state::{DescriptorTableReg, SegKind, SegmentCache, SystemSegmentReg};
pub use state::{
    OpSize, RunState, SegReg, CR0_PE, CR0_PG, CR0_TS, CR0_WP, CR4_TSD, FLAGS_IOPL, FLAG_AF,
    FLAG_CF, FLAG_DF, FLAG_IF, FLAG_NT, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_TF, FLAG_VM, FLAG_ZF,
    REG_EAX, REG_EBP, REG_EBX, REG_ECX, REG_EDI, REG_EDX, REG_ESI, REG_ESP,
};
