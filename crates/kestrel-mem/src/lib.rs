//! Guest physical memory for the Kestrel PC emulator.
//!
//! The [`Bus`] is the only way the CPU core touches physical memory. It owns
//! a flat RAM allocation and a table of [`MemoryProvider`]s that claim
//! block-aligned windows below 1 MiB (ROM shadows, video memory, MMIO), and
//! it applies the A20 gate mask before every access.

mod bus;
mod phys;
mod provider;

pub use bus::Bus;
pub use phys::{PhysicalMemory, PhysicalMemoryError, DEFAULT_MEMORY_SIZE};
pub use provider::{MemoryProvider, RomProvider, PROVIDER_BLOCK_SIZE, PROVIDER_WINDOW_END};
