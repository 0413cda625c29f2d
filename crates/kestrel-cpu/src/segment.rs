//! Selector loads and the descriptor caches behind the segment registers.

use tracing::trace;

use crate::cpu::Cpu;
use crate::descriptor::{parse_descriptor, with_tss_busy, CodeSegment, DataSegment, Descriptor, Selector};
use crate::exception::Exception;
use crate::state::{SegKind, SegReg, SegmentCache, SystemSegmentReg};

impl Cpu {
    /// Fetch and parse a descriptor-table entry.
    ///
    /// Faults only on a page fault during the table read; a selector past the
    /// table limit comes back as [`Descriptor::OutsideTableLimits`] so each
    /// caller can attach its own error code.
    pub(crate) fn descriptor(&mut self, selector: Selector) -> Result<Descriptor, Exception> {
        if selector.is_null() {
            return Ok(Descriptor::Null);
        }
        let (base, limit) = if selector.ti_local() {
            (self.ldtr.base, self.ldtr.limit)
        } else {
            (self.gdtr.base, u32::from(self.gdtr.limit))
        };
        let offset = selector.table_offset();
        if offset + 7 > limit {
            return Ok(Descriptor::OutsideTableLimits);
        }
        let raw = self.read_linear_u64(base.wrapping_add(offset))?;
        Ok(parse_descriptor(raw))
    }

    /// The raw 8-byte table entry, or `None` for a null selector or one past
    /// the table limit. Used by the LAR/LSL probes, which need the undecoded
    /// access bytes.
    pub(crate) fn raw_descriptor(&mut self, selector: Selector) -> Result<Option<u64>, Exception> {
        if selector.is_null() {
            return Ok(None);
        }
        let (base, limit) = if selector.ti_local() {
            (self.ldtr.base, self.ldtr.limit)
        } else {
            (self.gdtr.base, u32::from(self.gdtr.limit))
        };
        let offset = selector.table_offset();
        if offset + 7 > limit {
            return Ok(None);
        }
        Ok(Some(self.read_linear_u64(base.wrapping_add(offset))?))
    }

    /// Flip the busy bit of a TSS descriptor in the GDT.
    pub(crate) fn set_tss_busy(&mut self, selector: Selector, busy: bool) -> Result<(), Exception> {
        let addr = self.gdtr.base.wrapping_add(selector.table_offset());
        let raw = self.read_linear_u64(addr)?;
        self.write_linear_u64(addr, with_tss_busy(raw, busy))
    }

    fn cache_from_code(selector: Selector, seg: &CodeSegment) -> SegmentCache {
        SegmentCache {
            kind: SegKind::Code {
                conforming: seg.conforming,
                readable: seg.readable,
            },
            base: seg.base,
            limit: seg.limit,
            dpl: seg.dpl,
            rpl: selector.rpl(),
            present: seg.present,
            default_big: seg.default_big,
            from_ldt: selector.ti_local(),
        }
    }

    fn cache_from_data(selector: Selector, seg: &DataSegment) -> SegmentCache {
        SegmentCache {
            kind: SegKind::Data {
                writable: seg.writable,
                expand_down: seg.expand_down,
            },
            base: seg.base,
            limit: seg.limit,
            dpl: seg.dpl,
            rpl: selector.rpl(),
            present: seg.present,
            default_big: seg.default_big,
            from_ldt: selector.ti_local(),
        }
    }

    /// Real-mode / V86 segment register write: base tracks the selector,
    /// nothing can fault.
    pub(crate) fn set_segment_real(&mut self, seg: SegReg, selector: u16) {
        self.selectors[seg as usize] = selector;
        let mut cache = SegmentCache::real_mode(selector, seg == SegReg::CS);
        if self.v86_mode() {
            cache.rpl = 3;
            cache.dpl = 3;
        }
        self.caches[seg as usize] = cache;
    }

    /// Load a data or stack segment register (MOV/POP to sreg, the LDS
    /// family, string setup, post-task-switch reload). CS only changes via
    /// far control transfers.
    pub(crate) fn load_segment(&mut self, seg: SegReg, selector: u16) -> Result<(), Exception> {
        debug_assert!(seg != SegReg::CS);
        if self.real_semantics() {
            self.set_segment_real(seg, selector);
            return Ok(());
        }

        let sel = Selector(selector);
        if seg == SegReg::SS {
            return self.load_stack_segment(sel);
        }

        if sel.is_null() {
            // Legal to hold; the cache is marked unusable and faults on use.
            self.selectors[seg as usize] = selector;
            self.caches[seg as usize] = SegmentCache::null();
            return Ok(());
        }

        let descriptor = self.descriptor(sel)?;
        let cache = match descriptor {
            Descriptor::Data(data) => {
                if data.dpl < sel.rpl().max(self.cpl) {
                    return Err(Exception::gp(selector));
                }
                Self::cache_from_data(sel, &data)
            }
            Descriptor::Code(code) => {
                if !code.readable {
                    return Err(Exception::gp(selector));
                }
                if !code.conforming && code.dpl < sel.rpl().max(self.cpl) {
                    return Err(Exception::gp(selector));
                }
                Self::cache_from_code(sel, &code)
            }
            _ => return Err(Exception::gp(selector)),
        };
        if !cache.present {
            return Err(Exception::np(selector));
        }
        self.selectors[seg as usize] = selector;
        self.caches[seg as usize] = cache;
        Ok(())
    }

    fn load_stack_segment(&mut self, sel: Selector) -> Result<(), Exception> {
        let selector = sel.0;
        if sel.is_null() {
            // Ring 0 may park a null SS (it faults on use); anywhere else
            // the load itself is illegal.
            if self.cpl == 0 {
                self.selectors[SegReg::SS as usize] = selector;
                self.caches[SegReg::SS as usize] = SegmentCache::null();
                return Ok(());
            }
            return Err(Exception::gp0());
        }
        if sel.rpl() != self.cpl {
            return Err(Exception::gp(selector));
        }
        let descriptor = self.descriptor(sel)?;
        let data = match descriptor {
            Descriptor::Data(data) if data.writable => data,
            Descriptor::OutsideTableLimits => return Err(Exception::gp(selector)),
            _ => return Err(Exception::gp(selector)),
        };
        if data.dpl != self.cpl {
            return Err(Exception::gp(selector));
        }
        if !data.present {
            return Err(Exception::ss(selector));
        }
        self.selectors[SegReg::SS as usize] = selector;
        self.caches[SegReg::SS as usize] = Self::cache_from_data(sel, &data);
        Ok(())
    }

    /// Install SS:ESP from an already-validated descriptor, as ring
    /// transitions and task switches do.
    pub(crate) fn install_stack_segment(
        &mut self,
        selector: Selector,
        data: &DataSegment,
        esp: u32,
    ) {
        self.selectors[SegReg::SS as usize] = selector.0;
        self.caches[SegReg::SS as usize] = Self::cache_from_data(selector, data);
        self.gpr[crate::state::REG_ESP] = esp;
    }

    /// Install CS after the caller has done the transfer-specific privilege
    /// checks. The selector's RPL bits are replaced with the new CPL.
    pub(crate) fn load_cs_checked(&mut self, selector: u16, code: &CodeSegment, cpl: u8) {
        let sel = Selector((selector & !0x3) | u16::from(cpl & 0x3));
        self.selectors[SegReg::CS as usize] = sel.0;
        self.caches[SegReg::CS as usize] = Self::cache_from_code(sel, code);
        self.cpl = cpl & 0x3;
    }

    /// LLDT. A null selector empties the LDT.
    pub(crate) fn load_ldtr(&mut self, selector: u16) -> Result<(), Exception> {
        let sel = Selector(selector);
        if sel.is_null() {
            self.ldtr = SystemSegmentReg::default();
            return Ok(());
        }
        if sel.ti_local() {
            return Err(Exception::gp(selector));
        }
        match self.descriptor(sel)? {
            Descriptor::Ldt(ldt) => {
                if !ldt.present {
                    return Err(Exception::np(selector));
                }
                self.ldtr = SystemSegmentReg {
                    selector,
                    base: ldt.base,
                    limit: ldt.limit,
                    is_32bit: false,
                };
                Ok(())
            }
            _ => Err(Exception::gp(selector)),
        }
    }

    /// LTR: load an *available* TSS and mark it busy.
    pub(crate) fn load_tr(&mut self, selector: u16) -> Result<(), Exception> {
        let sel = Selector(selector);
        if sel.is_null() || sel.ti_local() {
            return Err(Exception::gp(selector));
        }
        match self.descriptor(sel)? {
            Descriptor::Tss(tss) => {
                if tss.busy {
                    return Err(Exception::gp(selector));
                }
                if !tss.present {
                    return Err(Exception::np(selector));
                }
                self.set_tss_busy(sel, true)?;
                self.tr = SystemSegmentReg {
                    selector,
                    base: tss.base,
                    limit: tss.limit,
                    is_32bit: tss.is_32bit,
                };
                Ok(())
            }
            _ => Err(Exception::gp(selector)),
        }
    }

    /// After a return to an outer ring, data segment registers that are more
    /// privileged than the new CPL are silently emptied.
    pub(crate) fn clear_segment_if_unreachable(&mut self, seg: SegReg) {
        let index = seg as usize;
        if self.selectors[index] & !0x3 == 0 {
            return;
        }
        let cache = &self.caches[index];
        let unreachable = cache.is_null()
            || (cache.dpl < self.cpl && (cache.is_data() || cache.is_nonconforming_code()));
        if unreachable {
            trace!(
                target: "kestrel_cpu",
                segment = seg.name(),
                selector = self.selectors[index],
                cpl = self.cpl,
                "clearing segment no longer reachable from new privilege level",
            );
            self.selectors[index] = 0;
            self.caches[index] = SegmentCache::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{Cpu, CpuConfig};
    use crate::state::CR0_PE;

    pub(crate) fn make_descriptor(
        base: u32,
        limit_raw: u32,
        typ: u8,
        s: bool,
        dpl: u8,
        present: bool,
        db: bool,
        g: bool,
    ) -> u64 {
        let mut raw = 0u64;
        raw |= u64::from(limit_raw & 0xFFFF);
        raw |= u64::from(base & 0xFFFF) << 16;
        raw |= u64::from((base >> 16) & 0xFF) << 32;
        let access = u64::from(typ)
            | (u64::from(s) << 4)
            | (u64::from(dpl & 0x3) << 5)
            | (u64::from(present) << 7);
        raw |= access << 40;
        raw |= u64::from((limit_raw >> 16) & 0xF) << 48;
        raw |= (u64::from(db) << 54) | (u64::from(g) << 55);
        raw |= u64::from((base >> 24) & 0xFF) << 56;
        raw
    }

    fn protected_cpu_with_gdt(descriptors: &[u64]) -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::default()).unwrap();
        let gdt_base = 0x500;
        for (i, raw) in descriptors.iter().enumerate() {
            let bytes = raw.to_le_bytes();
            cpu.bus_mut().load(gdt_base + (i as u32) * 8, &bytes);
        }
        cpu.gdtr = crate::state::DescriptorTableReg {
            base: gdt_base,
            limit: (descriptors.len() * 8 - 1) as u16,
        };
        cpu.cr0 |= CR0_PE;
        cpu
    }

    #[test]
    fn null_ds_loads_but_is_unusable() {
        let code = make_descriptor(0, 0xFFFFF, 0xA, true, 0, true, true, true);
        let mut cpu = protected_cpu_with_gdt(&[0, code]);
        cpu.load_segment(SegReg::DS, 0).unwrap();
        assert!(cpu.cache(SegReg::DS).is_null());
        assert_eq!(
            cpu.read_memory8(SegReg::DS, 0x10).unwrap_err(),
            Exception::gp0()
        );
    }

    #[test]
    fn null_ss_load_only_at_ring0() {
        let mut cpu = protected_cpu_with_gdt(&[0]);
        cpu.cpl = 3;
        assert_eq!(
            cpu.load_segment(SegReg::SS, 0).unwrap_err(),
            Exception::gp0()
        );

        cpu.cpl = 0;
        cpu.load_segment(SegReg::SS, 0).unwrap();
        assert!(cpu.cache(SegReg::SS).is_null());
        assert_eq!(
            cpu.write_memory16(SegReg::SS, 0x10, 0).unwrap_err(),
            Exception::StackFault(0),
            "a parked null SS faults on use",
        );
    }

    #[test]
    fn data_load_checks_privilege() {
        let ring0_data = make_descriptor(0, 0xFFFFF, 0x2, true, 0, true, true, true);
        let mut cpu = protected_cpu_with_gdt(&[0, ring0_data]);
        cpu.cpl = 3;
        assert_eq!(
            cpu.load_segment(SegReg::DS, 0x08 | 3).unwrap_err(),
            Exception::gp(0x08)
        );
    }

    #[test]
    fn not_present_data_raises_np_and_ss_raises_ss() {
        let data_np = make_descriptor(0, 0xFFFFF, 0x2, true, 0, false, true, true);
        let mut cpu = protected_cpu_with_gdt(&[0, data_np]);
        assert_eq!(
            cpu.load_segment(SegReg::DS, 0x08).unwrap_err(),
            Exception::np(0x08)
        );
        assert_eq!(
            cpu.load_segment(SegReg::SS, 0x08).unwrap_err(),
            Exception::ss(0x08)
        );
    }

    #[test]
    fn selector_outside_table_limit_raises_gp_with_selector() {
        let code = make_descriptor(0, 0xFFFFF, 0xA, true, 0, true, true, true);
        let mut cpu = protected_cpu_with_gdt(&[0, code]);
        assert_eq!(
            cpu.load_segment(SegReg::DS, 0x20).unwrap_err(),
            Exception::gp(0x20)
        );
    }

    #[test]
    fn cached_descriptor_reflects_raw_entry() {
        let data = make_descriptor(0x0012_0000, 0xFFFFF, 0x2, true, 0, true, true, true);
        let mut cpu = protected_cpu_with_gdt(&[0, data]);
        cpu.load_segment(SegReg::DS, 0x08).unwrap();
        let cache = cpu.cache(SegReg::DS);
        assert_eq!(cache.base, 0x0012_0000);
        assert_eq!(cache.limit, 0xFFFF_FFFF);
        assert_eq!(cache.dpl, 0);
        assert!(cache.writable());
    }

    #[test]
    fn expand_down_limit_enforced_on_access() {
        let expand_down = make_descriptor(0x0010_0000, 0x0FFF, 0x6, true, 0, true, false, false);
        let mut cpu = protected_cpu_with_gdt(&[0, expand_down]);
        cpu.load_segment(SegReg::DS, 0x08).unwrap();
        assert_eq!(
            cpu.read_memory8(SegReg::DS, 0x0FFF).unwrap_err(),
            Exception::gp0()
        );
        assert!(cpu.read_memory8(SegReg::DS, 0x1000).is_ok());
        assert_eq!(
            cpu.read_memory16(SegReg::DS, 0xFFFF).unwrap_err(),
            Exception::gp0(),
            "access past the 64 KiB ceiling of a 16-bit expand-down segment",
        );
    }

    #[test]
    fn ldt_selector_resolves_through_ldtr() {
        let ldt_base = 0x900u32;
        let ldt_desc = make_descriptor(ldt_base, 0x0F, 0x2, false, 0, true, false, false);
        let mut cpu = protected_cpu_with_gdt(&[0, ldt_desc]);

        let ldt_data = make_descriptor(0x0034_0000, 0xFFFF, 0x2, true, 0, true, false, false);
        cpu.bus_mut().load(ldt_base + 8, &ldt_data.to_le_bytes());

        cpu.load_ldtr(0x08).unwrap();
        cpu.load_segment(SegReg::DS, 0x08 | 0x4).unwrap();
        assert_eq!(cpu.segment_base(SegReg::DS), 0x0034_0000);
        assert!(cpu.cache(SegReg::DS).from_ldt);
    }

    #[test]
    fn ltr_sets_busy_bit() {
        let tss = make_descriptor(0x2000, 0x67, 0x9, false, 0, true, false, false);
        let mut cpu = protected_cpu_with_gdt(&[0, tss]);
        cpu.load_tr(0x08).unwrap();
        assert_eq!(cpu.tr.base, 0x2000);
        match cpu.descriptor(Selector(0x08)).unwrap() {
            Descriptor::Tss(t) => assert!(t.busy),
            other => panic!("unexpected descriptor: {other:?}"),
        }
        // A second LTR of the now-busy TSS faults.
        assert_eq!(cpu.load_tr(0x08).unwrap_err(), Exception::gp(0x08));
    }
}
