//! The segmented memory access layer.
//!
//! Every ordinary access flows offset → segment check → paging → A20 → bus.
//! Accesses that cross a page boundary are decomposed into byte-granular
//! translations, and for writes every page is translated before the first
//! byte is stored, so a #PF on the second page leaves architectural state
//! untouched and the instruction restarts cleanly.
//!
//! The `*_linear` ("metal") accessors skip segment validation — the core
//! uses them for descriptor tables, the IVT and TSS images — but still go
//! through paging (as supervisor accesses) and the A20 mask.

use crate::cpu::Cpu;
use crate::exception::Exception;
use crate::paging::MemoryAccess;
use crate::state::{SegReg, REG_ESP};

impl Cpu {
    // --- Physical ---------------------------------------------------------

    pub(crate) fn read_physical_u32(&mut self, paddr: u32) -> u32 {
        self.bus.read_u32(paddr)
    }

    pub(crate) fn write_physical_u32(&mut self, paddr: u32, value: u32) {
        self.bus.write_u32(paddr, value)
    }

    // --- Linear ("metal") -------------------------------------------------

    fn linear_read<const N: usize>(
        &mut self,
        laddr: u32,
        access: MemoryAccess,
        effective_cpl: u8,
    ) -> Result<[u8; N], Exception> {
        let mut out = [0u8; N];
        if !crosses_page(laddr, N as u32) {
            let paddr = self.translate(laddr, access, effective_cpl)?;
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = self.bus.read_u8(paddr.wrapping_add(i as u32));
            }
        } else {
            for (i, slot) in out.iter_mut().enumerate() {
                let paddr = self.translate(laddr.wrapping_add(i as u32), access, effective_cpl)?;
                *slot = self.bus.read_u8(paddr);
            }
        }
        Ok(out)
    }

    fn linear_write<const N: usize>(
        &mut self,
        laddr: u32,
        bytes: [u8; N],
        effective_cpl: u8,
    ) -> Result<(), Exception> {
        if !crosses_page(laddr, N as u32) {
            let paddr = self.translate(laddr, MemoryAccess::Write, effective_cpl)?;
            for (i, byte) in bytes.iter().enumerate() {
                self.bus.write_u8(paddr.wrapping_add(i as u32), *byte);
            }
            return Ok(());
        }
        // Translate every page before storing anything: restartability.
        let mut paddrs = [0u32; N];
        for (i, paddr) in paddrs.iter_mut().enumerate() {
            *paddr =
                self.translate(laddr.wrapping_add(i as u32), MemoryAccess::Write, effective_cpl)?;
        }
        for (paddr, byte) in paddrs.iter().zip(bytes.iter()) {
            self.bus.write_u8(*paddr, *byte);
        }
        Ok(())
    }

    pub(crate) fn read_linear_u8(&mut self, laddr: u32) -> Result<u8, Exception> {
        Ok(self.linear_read::<1>(laddr, MemoryAccess::Read, 0)?[0])
    }

    pub(crate) fn read_linear_u16(&mut self, laddr: u32) -> Result<u16, Exception> {
        Ok(u16::from_le_bytes(self.linear_read::<2>(
            laddr,
            MemoryAccess::Read,
            0,
        )?))
    }

    pub(crate) fn read_linear_u32(&mut self, laddr: u32) -> Result<u32, Exception> {
        Ok(u32::from_le_bytes(self.linear_read::<4>(
            laddr,
            MemoryAccess::Read,
            0,
        )?))
    }

    pub(crate) fn read_linear_u64(&mut self, laddr: u32) -> Result<u64, Exception> {
        Ok(u64::from_le_bytes(self.linear_read::<8>(
            laddr,
            MemoryAccess::Read,
            0,
        )?))
    }

    pub(crate) fn write_linear_u16(&mut self, laddr: u32, value: u16) -> Result<(), Exception> {
        self.linear_write(laddr, value.to_le_bytes(), 0)
    }

    pub(crate) fn write_linear_u32(&mut self, laddr: u32, value: u32) -> Result<(), Exception> {
        self.linear_write(laddr, value.to_le_bytes(), 0)
    }

    pub(crate) fn write_linear_u64(&mut self, laddr: u32, value: u64) -> Result<(), Exception> {
        self.linear_write(laddr, value.to_le_bytes(), 0)
    }

    // --- Segmented --------------------------------------------------------

    /// Rights + limit check against the cached descriptor. Real mode and V86
    /// skip this (their caches carry the fixed 64 KiB data image).
    pub(crate) fn validate_segment_access(
        &self,
        seg: SegReg,
        offset: u32,
        len: u32,
        access: MemoryAccess,
    ) -> Result<(), Exception> {
        if self.real_semantics() {
            return Ok(());
        }

        let fault = || {
            if seg == SegReg::SS {
                Exception::StackFault(0)
            } else {
                Exception::GeneralProtection(0)
            }
        };

        let cache = self.cache(seg);
        if cache.is_null() || !cache.present {
            return Err(fault());
        }

        let allowed = match access {
            MemoryAccess::Read => cache.readable(),
            MemoryAccess::Write => cache.writable(),
            MemoryAccess::Execute => cache.is_code(),
        };
        if !allowed {
            return Err(fault());
        }

        let Some(last) = offset.checked_add(len - 1) else {
            return Err(fault());
        };

        if cache.expand_down() {
            // Valid offsets live *above* the limit, up to the D/B ceiling.
            let ceiling = if cache.default_big { 0xFFFF_FFFF } else { 0xFFFF };
            if offset <= cache.limit || last > ceiling {
                return Err(fault());
            }
        } else if last > cache.limit {
            return Err(fault());
        }
        Ok(())
    }

    fn segmented_read<const N: usize>(
        &mut self,
        seg: SegReg,
        offset: u32,
    ) -> Result<[u8; N], Exception> {
        self.validate_segment_access(seg, offset, N as u32, MemoryAccess::Read)?;
        let laddr = self.cache(seg).base.wrapping_add(offset);
        self.linear_read(laddr, MemoryAccess::Read, self.cpl)
    }

    fn segmented_write<const N: usize>(
        &mut self,
        seg: SegReg,
        offset: u32,
        bytes: [u8; N],
    ) -> Result<(), Exception> {
        self.validate_segment_access(seg, offset, N as u32, MemoryAccess::Write)?;
        let laddr = self.cache(seg).base.wrapping_add(offset);
        self.linear_write(laddr, bytes, self.cpl)
    }

    pub fn read_memory8(&mut self, seg: SegReg, offset: u32) -> Result<u8, Exception> {
        Ok(self.segmented_read::<1>(seg, offset)?[0])
    }

    pub fn read_memory16(&mut self, seg: SegReg, offset: u32) -> Result<u16, Exception> {
        Ok(u16::from_le_bytes(self.segmented_read::<2>(seg, offset)?))
    }

    pub fn read_memory32(&mut self, seg: SegReg, offset: u32) -> Result<u32, Exception> {
        Ok(u32::from_le_bytes(self.segmented_read::<4>(seg, offset)?))
    }

    pub fn write_memory8(&mut self, seg: SegReg, offset: u32, value: u8) -> Result<(), Exception> {
        self.segmented_write(seg, offset, [value])
    }

    pub fn write_memory16(
        &mut self,
        seg: SegReg,
        offset: u32,
        value: u16,
    ) -> Result<(), Exception> {
        self.segmented_write(seg, offset, value.to_le_bytes())
    }

    pub fn write_memory32(
        &mut self,
        seg: SegReg,
        offset: u32,
        value: u32,
    ) -> Result<(), Exception> {
        self.segmented_write(seg, offset, value.to_le_bytes())
    }

    /// Operand-sized read: 16 or 32 bits widened to u32.
    pub(crate) fn read_memory_osize(
        &mut self,
        seg: SegReg,
        offset: u32,
        o32: bool,
    ) -> Result<u32, Exception> {
        if o32 {
            self.read_memory32(seg, offset)
        } else {
            Ok(u32::from(self.read_memory16(seg, offset)?))
        }
    }

    pub(crate) fn write_memory_osize(
        &mut self,
        seg: SegReg,
        offset: u32,
        o32: bool,
        value: u32,
    ) -> Result<(), Exception> {
        if o32 {
            self.write_memory32(seg, offset, value)
        } else {
            self.write_memory16(seg, offset, value as u16)
        }
    }

    // --- Instruction fetch ------------------------------------------------

    pub(crate) fn fetch_u8(&mut self) -> Result<u8, Exception> {
        self.validate_segment_access(SegReg::CS, self.eip, 1, MemoryAccess::Execute)?;
        let laddr = self.cache(SegReg::CS).base.wrapping_add(self.eip);
        let byte = self.linear_read::<1>(laddr, MemoryAccess::Execute, self.cpl)?[0];
        self.eip = self.eip.wrapping_add(1);
        Ok(byte)
    }

    pub(crate) fn fetch_u16(&mut self) -> Result<u16, Exception> {
        let lo = self.fetch_u8()?;
        let hi = self.fetch_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    pub(crate) fn fetch_u32(&mut self) -> Result<u32, Exception> {
        let lo = self.fetch_u16()?;
        let hi = self.fetch_u16()?;
        Ok(u32::from(lo) | (u32::from(hi) << 16))
    }

    // --- Stack ------------------------------------------------------------

    pub(crate) fn stack_ptr(&self) -> u32 {
        if self.stack_32() {
            self.gpr[REG_ESP]
        } else {
            self.gpr[REG_ESP] & 0xFFFF
        }
    }

    pub(crate) fn set_stack_ptr(&mut self, value: u32) {
        if self.stack_32() {
            self.gpr[REG_ESP] = value;
        } else {
            self.gpr[REG_ESP] = (self.gpr[REG_ESP] & 0xFFFF_0000) | (value & 0xFFFF);
        }
    }

    pub(crate) fn adjust_stack_pointer(&mut self, delta: i32) {
        self.set_stack_ptr(self.stack_ptr().wrapping_add(delta as u32));
    }

    pub(crate) fn stack_mask(&self) -> u32 {
        if self.stack_32() {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }

    pub(crate) fn push16(&mut self, value: u16) -> Result<(), Exception> {
        let sp = self.stack_ptr().wrapping_sub(2) & self.stack_mask();
        self.write_memory16(SegReg::SS, sp, value)?;
        self.set_stack_ptr(sp);
        Ok(())
    }

    pub(crate) fn push32(&mut self, value: u32) -> Result<(), Exception> {
        let sp = self.stack_ptr().wrapping_sub(4) & self.stack_mask();
        self.write_memory32(SegReg::SS, sp, value)?;
        self.set_stack_ptr(sp);
        Ok(())
    }

    pub(crate) fn pop16(&mut self) -> Result<u16, Exception> {
        let value = self.read_memory16(SegReg::SS, self.stack_ptr())?;
        self.adjust_stack_pointer(2);
        Ok(value)
    }

    pub(crate) fn pop32(&mut self) -> Result<u32, Exception> {
        let value = self.read_memory32(SegReg::SS, self.stack_ptr())?;
        self.adjust_stack_pointer(4);
        Ok(value)
    }

    pub(crate) fn push_osize(&mut self, value: u32, o32: bool) -> Result<(), Exception> {
        if o32 {
            self.push32(value)
        } else {
            self.push16(value as u16)
        }
    }

    pub(crate) fn pop_osize(&mut self, o32: bool) -> Result<u32, Exception> {
        if o32 {
            self.pop32()
        } else {
            Ok(u32::from(self.pop16()?))
        }
    }
}

fn crosses_page(laddr: u32, len: u32) -> bool {
    len > 1 && (laddr & 0xFFF) + len - 1 > 0xFFF
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{Cpu, CpuConfig};

    fn cpu() -> Cpu {
        Cpu::new(CpuConfig::default()).unwrap()
    }

    #[test]
    fn page_cross_detection() {
        assert!(!crosses_page(0x0FFC, 4));
        assert!(crosses_page(0x0FFD, 4));
        assert!(crosses_page(0x0FFF, 2));
        assert!(!crosses_page(0x0FFF, 1));
    }

    #[test]
    fn real_mode_read_write_round_trip() {
        let mut cpu = cpu();
        cpu.write_memory32(SegReg::DS, 0x100, 0xDEAD_BEEF).unwrap();
        assert_eq!(cpu.read_memory32(SegReg::DS, 0x100).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn stack_pushes_grow_down_16bit() {
        let mut cpu = cpu();
        cpu.gpr[REG_ESP] = 0x0100;
        cpu.push16(0xBEEF).unwrap();
        assert_eq!(cpu.stack_ptr(), 0x00FE);
        assert_eq!(cpu.read_memory16(SegReg::SS, 0x00FE).unwrap(), 0xBEEF);
        assert_eq!(cpu.pop16().unwrap(), 0xBEEF);
        assert_eq!(cpu.stack_ptr(), 0x0100);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn write_read_round_trip(offset in 0u32..0xFFFC, value: u32) {
                let mut cpu = cpu();
                cpu.write_memory32(SegReg::DS, offset, value).unwrap();
                prop_assert_eq!(cpu.read_memory32(SegReg::DS, offset).unwrap(), value);
            }

            #[test]
            fn byte_assembly_is_little_endian(offset in 0u32..0xFFF0, value: u32) {
                let mut cpu = cpu();
                cpu.write_memory32(SegReg::DS, offset, value).unwrap();
                for (i, expected) in value.to_le_bytes().iter().enumerate() {
                    prop_assert_eq!(
                        cpu.read_memory8(SegReg::DS, offset + i as u32).unwrap(),
                        *expected
                    );
                }
            }
        }
    }
}
