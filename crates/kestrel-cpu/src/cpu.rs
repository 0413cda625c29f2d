use tracing::{trace, warn};

use kestrel_mem::{Bus, MemoryProvider, PhysicalMemory, PhysicalMemoryError};

use crate::addr::LogicalAddress;
use crate::exception::{Exception, InterruptSource};
use crate::state::{
    DescriptorTableReg, LazyFlags, RunState, SegReg, SegmentCache, SystemSegmentReg, CR0_PE,
    FLAGS_ALWAYS_SET, FLAGS_IOPL, FLAG_TF, FLAG_VM,
};
use crate::transfer::JumpType;

/// Port-I/O dispatch, implemented by the owning machine.
pub trait IoPorts {
    fn io_read(&mut self, port: u16, size: crate::OpSize) -> u32;
    fn io_write(&mut self, port: u16, size: crate::OpSize, value: u32);
}

/// The IRQ line from the PIC.
///
/// [`InterruptLine::has_pending_irq`] is polled between REP iterations and by
/// the machine's main loop; [`InterruptLine::acknowledge_irq`] runs the
/// interrupt-acknowledge cycle and yields the vector.
pub trait InterruptLine {
    fn has_pending_irq(&mut self) -> bool;
    fn acknowledge_irq(&mut self) -> Option<u8>;
}

/// The narrow host interfaces one step needs, bundled so handler signatures
/// stay flat.
pub struct Env<'a> {
    pub io: &'a mut dyn IoPorts,
    pub irq: &'a mut dyn InterruptLine,
}

/// Open-bus port I/O: reads float high, writes vanish.
pub struct OpenBusIo;

impl IoPorts for OpenBusIo {
    fn io_read(&mut self, port: u16, size: crate::OpSize) -> u32 {
        trace!(target: "kestrel_cpu", port, "read from unclaimed port");
        size.mask()
    }

    fn io_write(&mut self, port: u16, _size: crate::OpSize, value: u32) {
        trace!(target: "kestrel_cpu", port, value, "write to unclaimed port");
    }
}

/// An interrupt line that never asserts.
pub struct NoIrq;

impl InterruptLine for NoIrq {
    fn has_pending_irq(&mut self) -> bool {
        false
    }

    fn acknowledge_irq(&mut self) -> Option<u8> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct CpuConfig {
    pub memory_size: u64,
    /// Enables the VKILL (0xF1) autotest opcode and the configurable entry
    /// point below.
    pub for_autotest: bool,
    pub entry: LogicalAddress,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            memory_size: kestrel_mem::DEFAULT_MEMORY_SIZE,
            for_autotest: false,
            entry: LogicalAddress::new(0xF000, 0xFFF0),
        }
    }
}

/// One emulated 80386.
pub struct Cpu {
    pub(crate) bus: Bus,

    pub(crate) gpr: [u32; 8],
    pub(crate) eip: u32,
    /// EIP of the first byte (prefixes included) of the instruction being
    /// executed; faults rewind to it.
    pub(crate) base_eip: u32,

    pub(crate) eflags: u32,
    pub(crate) lazy: LazyFlags,

    pub(crate) selectors: [u16; 6],
    pub(crate) caches: [SegmentCache; 6],
    pub(crate) cpl: u8,

    pub(crate) cr0: u32,
    pub(crate) cr2: u32,
    pub(crate) cr3: u32,
    pub(crate) cr4: u32,
    pub(crate) dr: [u32; 8],

    pub(crate) gdtr: DescriptorTableReg,
    pub(crate) idtr: DescriptorTableReg,
    pub(crate) ldtr: SystemSegmentReg,
    pub(crate) tr: SystemSegmentReg,

    pub(crate) run_state: RunState,
    /// POP SS / MOV SS / STI window: the next instruction runs with external
    /// interrupts and the single-step trap held off.
    pub(crate) next_instruction_uninterruptible: bool,
    interrupt_window_open: bool,

    /// Retired-instruction counter; RDTSC reports it.
    pub(crate) cycle: u64,
    pub(crate) for_autotest: bool,
    entry: LogicalAddress,
}

impl Cpu {
    pub fn new(config: CpuConfig) -> Result<Self, PhysicalMemoryError> {
        let ram = PhysicalMemory::new(config.memory_size)?;
        let mut cpu = Self {
            bus: Bus::new(ram),
            gpr: [0; 8],
            eip: 0,
            base_eip: 0,
            eflags: FLAGS_ALWAYS_SET,
            lazy: LazyFlags::default(),
            selectors: [0; 6],
            caches: [SegmentCache::null(); 6],
            cpl: 0,
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr: [0; 8],
            gdtr: DescriptorTableReg::default(),
            idtr: DescriptorTableReg::default(),
            ldtr: SystemSegmentReg::default(),
            tr: SystemSegmentReg::default(),
            run_state: RunState::Alive,
            next_instruction_uninterruptible: false,
            interrupt_window_open: true,
            cycle: 0,
            for_autotest: config.for_autotest,
            entry: config.entry,
        };
        cpu.reset();
        Ok(cpu)
    }

    /// Power-on / hard-reboot state. Memory contents and registered
    /// providers survive; everything architectural is cleared.
    pub fn reset(&mut self) {
        self.gpr = [0; 8];
        self.eflags = FLAGS_ALWAYS_SET;
        self.lazy = LazyFlags::default();
        self.cr0 = 0;
        self.cr2 = 0;
        self.cr3 = 0;
        self.cr4 = 0;
        self.dr = [0; 8];
        self.gdtr = DescriptorTableReg::default();
        self.idtr = DescriptorTableReg {
            base: 0,
            limit: 0xFFFF,
        };
        self.ldtr = SystemSegmentReg::default();
        self.tr = SystemSegmentReg {
            selector: 0,
            base: 0,
            limit: 0xFFFF,
            is_32bit: false,
        };
        self.selectors = [0; 6];
        self.caches = [SegmentCache::real_mode(0, false); 6];
        self.caches[SegReg::CS as usize] = SegmentCache::real_mode(0, true);
        self.cpl = 0;
        self.run_state = RunState::Alive;
        self.next_instruction_uninterruptible = false;
        self.interrupt_window_open = true;
        self.cycle = 0;
        self.bus.set_a20_enabled(false);

        let entry = if self.for_autotest {
            self.entry
        } else {
            LogicalAddress::new(0xF000, 0xFFF0)
        };
        self.far_jump_sized(entry, JumpType::Internal, false)
            .expect("reset far jump cannot fault in real mode");

        self.eflags = 0x0200 | FLAGS_ALWAYS_SET;
        self.set_iopl(3);
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    /// Devices register their sub-1MiB windows here at machine construction.
    pub fn register_memory_provider(&mut self, provider: Box<dyn MemoryProvider>) {
        self.bus.register_provider(provider);
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub(crate) fn set_run_state(&mut self, state: RunState) {
        self.run_state = state;
    }

    pub fn is_for_autotest(&self) -> bool {
        self.for_autotest
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.run_state, RunState::Halted)
    }

    pub fn retired_instructions(&self) -> u64 {
        self.cycle
    }

    /// Whether the main loop may deliver an external interrupt at this
    /// boundary (IF set, and not inside a POP SS/MOV SS/STI window).
    pub fn interrupt_window_open(&self) -> bool {
        self.interrupt_window_open && self.get_if()
    }

    // --- Register file ---------------------------------------------------

    pub fn read_reg32(&self, index: usize) -> u32 {
        self.gpr[index]
    }

    pub fn write_reg32(&mut self, index: usize, value: u32) {
        self.gpr[index] = value;
    }

    pub fn read_reg16(&self, index: usize) -> u16 {
        self.gpr[index] as u16
    }

    /// 386 semantics: a 16-bit write leaves the upper half untouched.
    pub fn write_reg16(&mut self, index: usize, value: u16) {
        self.gpr[index] = (self.gpr[index] & 0xFFFF_0000) | u32::from(value);
    }

    /// Byte registers in ModR/M encoding order: AL CL DL BL AH CH DH BH.
    pub fn read_reg8(&self, index: usize) -> u8 {
        if index < 4 {
            self.gpr[index] as u8
        } else {
            (self.gpr[index - 4] >> 8) as u8
        }
    }

    pub fn write_reg8(&mut self, index: usize, value: u8) {
        if index < 4 {
            self.gpr[index] = (self.gpr[index] & !0xFF) | u32::from(value);
        } else {
            self.gpr[index - 4] = (self.gpr[index - 4] & !0xFF00) | (u32::from(value) << 8);
        }
    }

    pub fn eax(&self) -> u32 {
        self.gpr[crate::state::REG_EAX]
    }

    pub fn set_eax(&mut self, value: u32) {
        self.gpr[crate::state::REG_EAX] = value;
    }

    pub fn al(&self) -> u8 {
        self.eax() as u8
    }

    pub fn set_al(&mut self, value: u8) {
        self.write_reg8(0, value);
    }

    pub fn ax(&self) -> u16 {
        self.eax() as u16
    }

    pub fn set_ax(&mut self, value: u16) {
        self.write_reg16(crate::state::REG_EAX, value);
    }

    pub fn ecx(&self) -> u32 {
        self.gpr[crate::state::REG_ECX]
    }

    pub fn edx(&self) -> u32 {
        self.gpr[crate::state::REG_EDX]
    }

    pub fn set_edx(&mut self, value: u32) {
        self.gpr[crate::state::REG_EDX] = value;
    }

    pub fn eip(&self) -> u32 {
        self.eip
    }

    pub fn set_eip(&mut self, eip: u32) {
        self.eip = eip;
    }

    // --- Segments and privilege ------------------------------------------

    pub fn segment(&self, seg: SegReg) -> u16 {
        self.selectors[seg as usize]
    }

    pub(crate) fn cache(&self, seg: SegReg) -> &SegmentCache {
        &self.caches[seg as usize]
    }

    pub fn segment_base(&self, seg: SegReg) -> u32 {
        self.caches[seg as usize].base
    }

    pub fn cpl(&self) -> u8 {
        self.cpl
    }

    pub(crate) fn set_cpl(&mut self, cpl: u8) {
        if self.protected_mode() && !self.v86_mode() {
            let cs = SegReg::CS as usize;
            self.selectors[cs] = (self.selectors[cs] & !0x3) | u16::from(cpl & 0x3);
            self.caches[cs].rpl = cpl & 0x3;
        }
        self.cpl = cpl & 0x3;
    }

    pub fn protected_mode(&self) -> bool {
        self.cr0 & CR0_PE != 0
    }

    pub fn v86_mode(&self) -> bool {
        self.eflags & FLAG_VM != 0
    }

    /// Real-address-mode semantics apply: real mode proper, or V86.
    pub(crate) fn real_semantics(&self) -> bool {
        !self.protected_mode() || self.v86_mode()
    }

    pub fn iopl(&self) -> u8 {
        ((self.eflags & FLAGS_IOPL) >> 12) as u8
    }

    pub fn set_iopl(&mut self, iopl: u8) {
        self.eflags = (self.eflags & !FLAGS_IOPL) | (u32::from(iopl & 0x3) << 12);
    }

    /// Default operand/address size of the current code segment.
    pub(crate) fn cs_default_32(&self) -> bool {
        self.caches[SegReg::CS as usize].default_big
    }

    pub(crate) fn stack_32(&self) -> bool {
        self.caches[SegReg::SS as usize].default_big
    }

    pub fn gdtr(&self) -> DescriptorTableReg {
        self.gdtr
    }

    pub fn idtr(&self) -> DescriptorTableReg {
        self.idtr
    }

    pub fn control_register(&self, index: usize) -> Option<u32> {
        match index {
            0 => Some(self.cr0),
            2 => Some(self.cr2),
            3 => Some(self.cr3),
            4 => Some(self.cr4),
            _ => None,
        }
    }

    pub(crate) fn set_cr(&mut self, index: usize, value: u32) -> Result<(), Exception> {
        match index {
            // ET is hardwired on a 386DX-class part.
            0 => self.cr0 = value | 1 << 4,
            2 => self.cr2 = value,
            3 => self.cr3 = value & 0xFFFF_F000,
            4 => self.cr4 = value,
            _ => return Err(Exception::InvalidOpcode),
        }
        Ok(())
    }

    pub fn debug_register(&self, index: usize) -> u32 {
        self.dr[index & 7]
    }

    pub(crate) fn set_debug_register(&mut self, index: usize, value: u32) {
        self.dr[index & 7] = value;
    }

    pub fn ldtr_selector(&self) -> u16 {
        self.ldtr.selector
    }

    pub fn tr_selector(&self) -> u16 {
        self.tr.selector
    }

    pub fn set_gdtr(&mut self, base: u32, limit: u16) {
        self.gdtr = DescriptorTableReg { base, limit };
    }

    pub fn set_idtr(&mut self, base: u32, limit: u16) {
        self.idtr = DescriptorTableReg { base, limit };
    }

    /// Host-side control register write (snapshot restore, test setup).
    /// Guest writes go through MOV CRn which layers privilege checks on
    /// top.
    pub fn set_control_register(&mut self, index: usize, value: u32) -> Result<(), Exception> {
        self.set_cr(index, value)
    }

    /// Host-side segment register write. In real/V86 mode this mirrors what
    /// a MOV to the register would do; in protected mode it performs the
    /// full descriptor load (CS is only reachable through far transfers and
    /// is rejected here).
    pub fn write_segment(&mut self, seg: SegReg, selector: u16) -> Result<(), Exception> {
        if seg == SegReg::CS {
            if self.real_semantics() {
                self.set_segment_real(seg, selector);
                return Ok(());
            }
            return Err(Exception::InvalidOpcode);
        }
        self.load_segment(seg, selector)
    }

    pub(crate) fn make_next_instruction_uninterruptible(&mut self) {
        self.next_instruction_uninterruptible = true;
    }

    /// REP loops park EIP back on the first prefix byte when an IRQ preempts
    /// them.
    pub(crate) fn rewind_to_instruction_start(&mut self) {
        self.eip = self.base_eip;
    }

    /// After a task switch, the incoming EIP is the restart point; a fault
    /// raised while the switch finishes must not rewind into the old task.
    pub(crate) fn sync_instruction_start(&mut self) {
        self.base_eip = self.eip;
    }

    // --- Stepping ---------------------------------------------------------

    /// Execute one instruction (or deliver one pending fault chain).
    ///
    /// The caller is responsible for servicing the PIC between steps when
    /// [`Cpu::interrupt_window_open`] allows it, and for handling
    /// [`RunState::Halted`].
    pub fn step(&mut self, env: &mut Env<'_>) {
        if !matches!(self.run_state, RunState::Alive) {
            return;
        }

        self.base_eip = self.eip;
        let result = crate::interp::execute_one(self, env);
        self.cycle = self.cycle.wrapping_add(1);

        match result {
            Ok(()) => {
                if self.next_instruction_uninterruptible {
                    self.next_instruction_uninterruptible = false;
                    self.interrupt_window_open = false;
                    return;
                }
                self.interrupt_window_open = true;
                if self.eflags & FLAG_TF != 0 {
                    // Single-step: #DB as a trap after the instruction.
                    self.deliver_exception_chain(Exception::Debug);
                }
            }
            Err(exception) => {
                self.interrupt_window_open = true;
                self.raise_exception(exception);
            }
        }
    }

    /// Deliver an external (PIC) interrupt. Wakes a halted CPU.
    pub fn deliver_external_interrupt(&mut self, vector: u8) {
        if matches!(self.run_state, RunState::Halted) {
            self.run_state = RunState::Alive;
        }
        self.base_eip = self.eip;
        if let Err(exception) =
            crate::interrupt::interrupt(self, vector, InterruptSource::External, None)
        {
            self.raise_exception(exception);
        }
    }

    pub(crate) fn raise_exception(&mut self, exception: Exception) {
        trace!(target: "kestrel_cpu", %exception, eip = self.base_eip, "raising exception");
        if !exception.is_trap() {
            self.eip = self.base_eip;
        }
        self.deliver_exception_chain(exception);
    }

    fn deliver_exception_chain(&mut self, first: Exception) {
        let mut current = first;
        let mut delivering_df = matches!(first, Exception::DoubleFault);
        // A bounded chain: at most one serial retry, then #DF, then shutdown.
        for _ in 0..3 {
            match crate::interrupt::interrupt(
                self,
                current.vector(),
                InterruptSource::Internal,
                current.error_code(),
            ) {
                Ok(()) => return,
                Err(second) => {
                    if delivering_df {
                        warn!(target: "kestrel_cpu", "fault during #DF delivery, entering shutdown");
                        self.run_state = RunState::Shutdown;
                        return;
                    }
                    if current.promotes_to_double_fault(&second) {
                        current = Exception::DoubleFault;
                        delivering_df = true;
                    } else {
                        current = second;
                    }
                }
            }
        }
        warn!(target: "kestrel_cpu", "unresolvable exception cascade, entering shutdown");
        self.run_state = RunState::Shutdown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FLAG_IF;

    #[test]
    fn reset_state_matches_architecture() {
        let cpu = Cpu::new(CpuConfig::default()).unwrap();
        assert_eq!(cpu.segment(SegReg::CS), 0xF000);
        assert_eq!(cpu.eip(), 0xFFF0);
        assert_eq!(cpu.segment_base(SegReg::CS), 0xF_0000);
        assert_eq!(cpu.cpl(), 0);
        assert_eq!(cpu.iopl(), 3);
        assert!(cpu.eflags & FLAG_IF != 0);
        assert!(!cpu.protected_mode());
        assert!(!cpu.bus().a20_enabled());
    }

    #[test]
    fn byte_register_aliasing() {
        let mut cpu = Cpu::new(CpuConfig::default()).unwrap();
        cpu.set_eax(0xAABB_CCDD);
        assert_eq!(cpu.read_reg8(0), 0xDD); // AL
        assert_eq!(cpu.read_reg8(4), 0xCC); // AH
        cpu.write_reg8(4, 0x11);
        assert_eq!(cpu.eax(), 0xAABB_11DD);
        cpu.write_reg16(0, 0x2233);
        assert_eq!(cpu.eax(), 0xAABB_2233);
    }
}
