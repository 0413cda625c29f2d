//! Two-level 32-bit page translation.
//!
//! There is no TLB: every access walks the tables, so CR3 loads and page
//! table edits take effect immediately. Accessed/Dirty bits are written back
//! during the walk, before any fault from a later check can fire on the same
//! entry level.

use crate::cpu::Cpu;
use crate::exception::Exception;
use crate::state::{CR0_PE, CR0_PG, CR0_WP};

bitflags::bitflags! {
    /// Page directory / table entry bits the walk cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
    }
}

/// Page-fault error code bits.
pub const PFEC_PRESENT: u16 = 1 << 0;
pub const PFEC_WRITE: u16 = 1 << 1;
pub const PFEC_USER: u16 = 1 << 2;
pub const PFEC_IFETCH: u16 = 1 << 4;

const ENTRY_ADDR_MASK: u32 = 0xFFFF_F000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccess {
    Read,
    Write,
    Execute,
}

impl MemoryAccess {
    pub fn is_write(self) -> bool {
        matches!(self, MemoryAccess::Write)
    }

    pub fn is_execute(self) -> bool {
        matches!(self, MemoryAccess::Execute)
    }
}

fn fault_code(access: MemoryAccess, user: bool, present: bool) -> u16 {
    let mut code = 0;
    if present {
        code |= PFEC_PRESENT;
    }
    if access.is_write() {
        code |= PFEC_WRITE;
    }
    if user {
        code |= PFEC_USER;
    }
    if access.is_execute() {
        code |= PFEC_IFETCH;
    }
    code
}

impl Cpu {
    pub(crate) fn paging_enabled(&self) -> bool {
        self.cr0 & CR0_PG != 0 && self.cr0 & CR0_PE != 0
    }

    /// Translate a linear address, honoring user/write protection for the
    /// given effective privilege, and writing back Accessed/Dirty bits.
    ///
    /// CR2 is loaded with the faulting linear address before #PF is
    /// returned.
    pub(crate) fn translate(
        &mut self,
        laddr: u32,
        access: MemoryAccess,
        effective_cpl: u8,
    ) -> Result<u32, Exception> {
        if !self.paging_enabled() {
            return Ok(laddr);
        }

        let user = effective_cpl == 3;
        let fault = |cpu: &mut Cpu, present: bool| {
            cpu.cr2 = laddr;
            Exception::PageFault {
                error_code: fault_code(access, user, present),
                address: laddr,
            }
        };

        let dir_index = laddr >> 22;
        let table_index = (laddr >> 12) & 0x3FF;
        let offset = laddr & 0xFFF;

        let pde_addr = (self.cr3 & ENTRY_ADDR_MASK) + dir_index * 4;
        let pde_raw = self.read_physical_u32(pde_addr);
        let pde = PteFlags::from_bits_retain(pde_raw);
        if !pde.contains(PteFlags::PRESENT) {
            return Err(fault(self, false));
        }

        let pte_addr = (pde_raw & ENTRY_ADDR_MASK) + table_index * 4;
        let pte_raw = self.read_physical_u32(pte_addr);
        let pte = PteFlags::from_bits_retain(pte_raw);
        if !pte.contains(PteFlags::PRESENT) {
            return Err(fault(self, false));
        }

        if user && (!pde.contains(PteFlags::USER) || !pte.contains(PteFlags::USER)) {
            return Err(fault(self, true));
        }

        if (user || self.cr0 & CR0_WP != 0)
            && access.is_write()
            && (!pde.contains(PteFlags::WRITABLE) || !pte.contains(PteFlags::WRITABLE))
        {
            return Err(fault(self, true));
        }

        if !pde.contains(PteFlags::ACCESSED) {
            self.write_physical_u32(pde_addr, pde_raw | PteFlags::ACCESSED.bits());
        }
        let mut pte_update = PteFlags::ACCESSED;
        if access.is_write() {
            pte_update |= PteFlags::DIRTY;
        }
        if !pte.contains(pte_update) {
            self.write_physical_u32(pte_addr, pte_raw | pte_update.bits());
        }

        Ok((pte_raw & ENTRY_ADDR_MASK) | offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{Cpu, CpuConfig};
    use crate::state::SegReg;

    const PDE_BASE: u32 = 0x0001_0000;
    const PT_BASE: u32 = 0x0001_1000;

    /// PDE 0 -> page table; PTE 1 maps linear 0x1000 to physical 0x40_0000
    /// as user-writable. Linear 0x2000 stays unmapped.
    fn paging_cpu(user: bool, writable: bool) -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::default()).unwrap();
        let flags = PteFlags::PRESENT.bits()
            | if writable { PteFlags::WRITABLE.bits() } else { 0 }
            | if user { PteFlags::USER.bits() } else { 0 };

        cpu.bus_mut()
            .load(PDE_BASE, &(PT_BASE | flags).to_le_bytes());
        cpu.bus_mut()
            .load(PT_BASE + 4, &(0x0040_0000 | flags).to_le_bytes());

        cpu.cr3 = PDE_BASE;
        cpu.cr0 |= CR0_PE | CR0_PG;
        assert!(cpu.paging_enabled());
        cpu
    }

    #[test]
    fn identity_when_paging_off() {
        let mut cpu = Cpu::new(CpuConfig::default()).unwrap();
        assert_eq!(
            cpu.translate(0x1234_5678, MemoryAccess::Read, 0).unwrap(),
            0x1234_5678
        );
    }

    #[test]
    fn user_write_sets_accessed_and_dirty() {
        let mut cpu = paging_cpu(true, true);
        let paddr = cpu.translate(0x1000, MemoryAccess::Write, 3).unwrap();
        assert_eq!(paddr, 0x0040_0000);

        let pde = cpu.read_physical_u32(PDE_BASE);
        let pte = cpu.read_physical_u32(PT_BASE + 4);
        assert!(pde & PteFlags::ACCESSED.bits() != 0);
        assert!(pte & PteFlags::ACCESSED.bits() != 0);
        assert!(pte & PteFlags::DIRTY.bits() != 0);
        assert!(pde & PteFlags::DIRTY.bits() == 0, "dirty only on the PTE");
    }

    #[test]
    fn unmapped_pte_faults_with_user_write_code() {
        let mut cpu = paging_cpu(true, true);
        let err = cpu.translate(0x2000, MemoryAccess::Write, 3).unwrap_err();
        assert_eq!(
            err,
            Exception::PageFault {
                error_code: PFEC_WRITE | PFEC_USER,
                address: 0x2000
            }
        );
        assert_eq!(cpu.cr2, 0x2000, "CR2 latches the faulting linear address");
    }

    #[test]
    fn supervisor_page_rejects_user_access() {
        let mut cpu = paging_cpu(false, true);
        let err = cpu.translate(0x1000, MemoryAccess::Read, 3).unwrap_err();
        assert_eq!(
            err,
            Exception::PageFault {
                error_code: PFEC_PRESENT | PFEC_USER,
                address: 0x1000
            }
        );
        // Supervisor access to the same page is fine.
        assert!(cpu.translate(0x1000, MemoryAccess::Read, 0).is_ok());
    }

    #[test]
    fn read_only_page_rejects_user_write_but_not_supervisor() {
        let mut cpu = paging_cpu(true, false);
        assert!(cpu.translate(0x1000, MemoryAccess::Write, 3).is_err());
        // Without CR0.WP, ring 0 may write through a read-only PTE.
        assert!(cpu.translate(0x1000, MemoryAccess::Write, 0).is_ok());
        cpu.cr0 |= CR0_WP;
        assert!(cpu.translate(0x1000, MemoryAccess::Write, 0).is_err());
    }

    #[test]
    fn ifetch_fault_carries_instruction_bit() {
        let mut cpu = paging_cpu(true, true);
        let err = cpu.translate(0x2000, MemoryAccess::Execute, 3).unwrap_err();
        assert_eq!(
            err,
            Exception::PageFault {
                error_code: PFEC_USER | PFEC_IFETCH,
                address: 0x2000
            }
        );
    }

    /// A write straddling a mapped and an unmapped page must leave the
    /// mapped page untouched.
    #[test]
    fn page_crossing_write_is_restartable() {
        let mut cpu = paging_cpu(true, true);
        cpu.bus_mut().load(0x0040_0FFE, &[0xAA, 0xBB, 0xCC, 0xDD]);

        let err = cpu
            .write_memory32(SegReg::DS, 0x1FFE, 0x1122_3344)
            .unwrap_err();
        assert!(matches!(err, Exception::PageFault { .. }));

        let mut untouched = [0u8; 4];
        untouched.copy_from_slice(cpu.bus().ram().slice(0x0040_0FFE, 4).unwrap());
        assert_eq!(untouched, [0xAA, 0xBB, 0xCC, 0xDD]);
    }
}
