//! Host-facing snapshot of the architectural register state.
//!
//! RAM is not part of this image; the host snapshots it separately through
//! `kestrel_mem`.

use serde::{Deserialize, Serialize};

use crate::cpu::Cpu;
use crate::state::{DescriptorTableReg, LazyFlags, SegmentCache, SystemSegmentReg};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub gpr: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    pub selectors: [u16; 6],
    pub caches: [SegmentCache; 6],
    pub cpl: u8,
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub dr: [u32; 8],
    pub gdtr: DescriptorTableReg,
    pub idtr: DescriptorTableReg,
    pub ldtr: SystemSegmentReg,
    pub tr: SystemSegmentReg,
    pub a20_enabled: bool,
    pub retired_instructions: u64,
}

impl Cpu {
    pub fn snapshot(&mut self) -> CpuSnapshot {
        // Force the lazy flags so the image is self-contained.
        let eflags = self.get_eflags();
        CpuSnapshot {
            gpr: self.gpr,
            eip: self.eip,
            eflags,
            selectors: self.selectors,
            caches: self.caches,
            cpl: self.cpl,
            cr0: self.cr0,
            cr2: self.cr2,
            cr3: self.cr3,
            cr4: self.cr4,
            dr: self.dr,
            gdtr: self.gdtr,
            idtr: self.idtr,
            ldtr: self.ldtr,
            tr: self.tr,
            a20_enabled: self.bus.a20_enabled(),
            retired_instructions: self.cycle,
        }
    }

    pub fn restore(&mut self, snapshot: &CpuSnapshot) {
        self.gpr = snapshot.gpr;
        self.eip = snapshot.eip;
        self.base_eip = snapshot.eip;
        self.eflags = snapshot.eflags;
        self.lazy = LazyFlags::default();
        self.selectors = snapshot.selectors;
        self.caches = snapshot.caches;
        self.cpl = snapshot.cpl;
        self.cr0 = snapshot.cr0;
        self.cr2 = snapshot.cr2;
        self.cr3 = snapshot.cr3;
        self.cr4 = snapshot.cr4;
        self.dr = snapshot.dr;
        self.gdtr = snapshot.gdtr;
        self.idtr = snapshot.idtr;
        self.ldtr = snapshot.ldtr;
        self.tr = snapshot.tr;
        self.bus.set_a20_enabled(snapshot.a20_enabled);
        self.cycle = snapshot.retired_instructions;
    }
}

#[cfg(test)]
mod tests {
    use crate::cpu::{Cpu, CpuConfig};

    #[test]
    fn snapshot_round_trip() {
        let mut cpu = Cpu::new(CpuConfig::default()).unwrap();
        cpu.set_eax(0x1234_5678);
        cpu.set_eip(0x4000);
        let image = cpu.snapshot();

        let mut other = Cpu::new(CpuConfig::default()).unwrap();
        other.restore(&image);
        assert_eq!(other.eax(), 0x1234_5678);
        assert_eq!(other.eip(), 0x4000);
        assert_eq!(other.segment(crate::SegReg::CS), cpu.segment(crate::SegReg::CS));
    }
}
