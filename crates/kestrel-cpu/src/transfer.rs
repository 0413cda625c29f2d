//! Far control transfers: JMP/CALL ptr16:xx, RETF, IRET, and the privilege
//! transitions they imply.

use tracing::{trace, warn};

use crate::addr::LogicalAddress;
use crate::cpu::Cpu;
use crate::descriptor::{CodeSegment, Descriptor, Gate, GateKind, Selector};
use crate::exception::Exception;
use crate::state::{SegReg, FLAG_NT, FLAG_VM, REG_ESP};

/// What kind of transfer is asking; RETF goes through [`Cpu::far_return`]
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JumpType {
    Jmp,
    Call,
    Int,
    Iret,
    /// Reset and other non-architectural transfers.
    Internal,
}

/// Reads stack slots without committing ESP, so a fault between the reads
/// and the final state change leaves the stack intact for a restart.
pub(crate) struct TransactionalPopper {
    consumed: u32,
}

impl TransactionalPopper {
    pub(crate) fn new() -> Self {
        Self { consumed: 0 }
    }

    pub(crate) fn pop16(&mut self, cpu: &mut Cpu) -> Result<u16, Exception> {
        let sp = cpu.stack_ptr().wrapping_add(self.consumed) & cpu.stack_mask();
        let value = cpu.read_memory16(SegReg::SS, sp)?;
        self.consumed = self.consumed.wrapping_add(2);
        Ok(value)
    }

    pub(crate) fn pop32(&mut self, cpu: &mut Cpu) -> Result<u32, Exception> {
        let sp = cpu.stack_ptr().wrapping_add(self.consumed) & cpu.stack_mask();
        let value = cpu.read_memory32(SegReg::SS, sp)?;
        self.consumed = self.consumed.wrapping_add(4);
        Ok(value)
    }

    pub(crate) fn pop_osize(&mut self, cpu: &mut Cpu, o32: bool) -> Result<u32, Exception> {
        if o32 {
            self.pop32(cpu)
        } else {
            Ok(u32::from(self.pop16(cpu)?))
        }
    }

    /// Account for bytes the caller releases without reading (RETF n).
    pub(crate) fn skip(&mut self, bytes: u32) {
        self.consumed = self.consumed.wrapping_add(bytes);
    }

    pub(crate) fn commit(self, cpu: &mut Cpu) {
        cpu.adjust_stack_pointer(self.consumed as i32);
    }
}

impl Cpu {
    /// Far JMP/CALL entry point; `o32` is the instruction's effective
    /// operand size (a gate overrides it for the pushes).
    pub(crate) fn far_jump_sized(
        &mut self,
        target: LogicalAddress,
        jump_type: JumpType,
        o32: bool,
    ) -> Result<(), Exception> {
        if self.real_semantics() {
            self.real_mode_far_jump(target, jump_type, o32)
        } else {
            self.protected_far_jump(target, jump_type, o32, None)
        }
    }

    fn real_mode_far_jump(
        &mut self,
        target: LogicalAddress,
        jump_type: JumpType,
        o32: bool,
    ) -> Result<(), Exception> {
        let original_cs = self.segment(SegReg::CS);
        let original_eip = self.eip();

        self.set_segment_real(SegReg::CS, target.selector);
        self.set_eip(if o32 {
            target.offset
        } else {
            target.offset & 0xFFFF
        });

        if jump_type == JumpType::Call {
            self.push_osize(u32::from(original_cs), o32)?;
            self.push_osize(original_eip, o32)?;
        }
        Ok(())
    }

    fn protected_far_jump(
        &mut self,
        target: LogicalAddress,
        jump_type: JumpType,
        o32: bool,
        gate: Option<&Gate>,
    ) -> Result<(), Exception> {
        let selector = Selector(target.selector);
        let mut offset = target.offset;
        let push_32 = gate.map_or(o32, |g| g.is_32bit);

        let original_ss = self.segment(SegReg::SS);
        let original_esp = self.stack_ptr();
        let original_cpl = self.cpl();
        let original_cs = self.segment(SegReg::CS);
        let original_eip = self.eip();

        let descriptor = self.descriptor(selector)?;
        if descriptor.is_null() {
            return Err(Exception::gp0());
        }
        if descriptor.is_outside_table_limits() {
            return Err(Exception::gp(selector.0));
        }

        match descriptor {
            Descriptor::Gate(inner) if inner.kind == GateKind::Call => {
                if gate.is_some() {
                    return Err(Exception::gp(selector.0));
                }
                if inner.parameter_count != 0 {
                    warn!(
                        target: "kestrel_cpu",
                        selector = selector.0,
                        count = inner.parameter_count,
                        "call gate with nonzero parameter count is not implemented",
                    );
                    return Err(Exception::gp(selector.0));
                }
                if inner.dpl < self.cpl() || selector.rpl() > inner.dpl {
                    return Err(Exception::gp(selector.0));
                }
                if !inner.present {
                    return Err(Exception::np(selector.0));
                }
                self.protected_far_jump(inner.entry(), jump_type, o32, Some(&inner))
            }
            Descriptor::Gate(inner) if inner.kind == GateKind::Task => {
                if inner.dpl < self.cpl() || inner.dpl < selector.rpl() {
                    return Err(Exception::gp(selector.0));
                }
                if !inner.present {
                    return Err(Exception::np(selector.0));
                }
                self.task_switch_through_gate(&inner, jump_type)
            }
            Descriptor::Tss(tss) => {
                if tss.dpl < self.cpl() || tss.dpl < selector.rpl() {
                    return Err(Exception::gp(selector.0));
                }
                if !tss.present {
                    return Err(Exception::np(selector.0));
                }
                self.task_switch(selector, &tss, jump_type)
            }
            Descriptor::Code(code) => {
                if matches!(jump_type, JumpType::Call | JumpType::Jmp) && gate.is_none() {
                    if code.conforming {
                        if code.dpl > self.cpl() {
                            return Err(Exception::gp(selector.0));
                        }
                    } else {
                        if selector.rpl() > self.cpl() {
                            return Err(Exception::gp(selector.0));
                        }
                        if code.dpl != self.cpl() {
                            return Err(Exception::gp(selector.0));
                        }
                    }
                }
                if gate.is_some()
                    && jump_type == JumpType::Jmp
                    && !code.conforming
                    && code.dpl != self.cpl()
                {
                    return Err(Exception::gp(selector.0));
                }

                if !push_32 || !code.default_big {
                    // A 32-bit transfer into a 16-bit segment carries stray
                    // high offset bits; mask before the limit check.
                    offset &= 0xFFFF;
                }
                if !code.present {
                    return Err(Exception::np(selector.0));
                }
                if offset > code.limit {
                    return Err(Exception::gp0());
                }

                let escalating =
                    jump_type == JumpType::Call && gate.is_some() && code.dpl < original_cpl && !code.conforming;
                if escalating {
                    self.enter_inner_ring(
                        selector,
                        &code,
                        offset,
                        push_32,
                        original_ss,
                        original_esp,
                    )?;
                    trace!(
                        target: "kestrel_cpu",
                        from = original_cpl,
                        to = code.dpl,
                        "call gate privilege escalation",
                    );
                } else {
                    self.load_cs_checked(selector.0, &code, original_cpl);
                    self.set_eip(offset);
                }

                if jump_type == JumpType::Call {
                    self.push_osize(u32::from(original_cs), push_32)?;
                    self.push_osize(original_eip, push_32)?;
                }
                Ok(())
            }
            _ => Err(Exception::gp(selector.0)),
        }
    }

    /// CALL through a gate into a more privileged non-conforming segment:
    /// the ring stack comes from the current TSS, and the outer SS:ESP is
    /// pushed on it before CS:EIP.
    fn enter_inner_ring(
        &mut self,
        selector: Selector,
        code: &CodeSegment,
        offset: u32,
        push_32: bool,
        original_ss: u16,
        original_esp: u32,
    ) -> Result<(), Exception> {
        let new_cpl = code.dpl;
        let (new_ss, new_esp) = self.tss_ring_stack(new_cpl)?;
        let ss_sel = Selector(new_ss);

        let ss_descriptor = self.descriptor(ss_sel)?;
        if ss_descriptor.is_null() {
            return Err(Exception::ts(new_ss));
        }
        if ss_descriptor.is_outside_table_limits() {
            return Err(Exception::ts(new_ss));
        }
        let data = match ss_descriptor {
            Descriptor::Data(data) if data.writable => data,
            _ => return Err(Exception::ts(new_ss)),
        };
        if data.dpl != new_cpl {
            return Err(Exception::ts(new_ss));
        }
        if !data.present {
            return Err(Exception::ss(new_ss));
        }

        self.load_cs_checked(selector.0, code, new_cpl);
        self.set_eip(offset);
        self.install_stack_segment(ss_sel, &data, new_esp);

        self.push_osize(u32::from(original_ss), push_32)?;
        self.push_osize(original_esp, push_32)?;
        Ok(())
    }

    /// RETF, and the stack-restore half of IRET.
    pub(crate) fn far_return(&mut self, stack_adjustment: u16, o32: bool) -> Result<(), Exception> {
        if self.real_semantics() {
            let offset = self.pop_osize(o32)?;
            let selector = self.pop_osize(o32)? as u16;
            self.set_segment_real(SegReg::CS, selector);
            self.set_eip(if o32 { offset } else { offset & 0xFFFF });
            self.adjust_stack_pointer(i32::from(stack_adjustment));
            return Ok(());
        }
        self.protected_far_return(stack_adjustment, o32)
    }

    fn protected_far_return(&mut self, stack_adjustment: u16, o32: bool) -> Result<(), Exception> {
        let mut popper = TransactionalPopper::new();
        let mut offset = popper.pop_osize(self, o32)?;
        let selector = Selector(popper.pop_osize(self, o32)? as u16);
        popper.skip(u32::from(stack_adjustment));

        let original_cpl = self.cpl();
        let code = self.validate_return_code_segment(selector, original_cpl)?;
        if !code.default_big {
            offset &= 0xFFFF;
        }
        if offset > code.limit {
            return Err(Exception::gp0());
        }

        if selector.rpl() > original_cpl {
            // Outer-ring return: the caller's SS:ESP sits above the frame.
            let new_esp = popper.pop_osize(self, o32)?;
            let new_ss = popper.pop_osize(self, o32)? as u16;

            self.load_cs_checked(selector.0, &code, selector.rpl());
            self.set_eip(offset);
            self.load_segment(SegReg::SS, new_ss)?;
            self.gpr[REG_ESP] = new_esp;
            self.adjust_stack_pointer(i32::from(stack_adjustment));

            for seg in [SegReg::ES, SegReg::FS, SegReg::GS, SegReg::DS] {
                self.clear_segment_if_unreachable(seg);
            }
        } else {
            popper.commit(self);
            self.load_cs_checked(selector.0, &code, original_cpl);
            self.set_eip(offset);
        }
        Ok(())
    }

    fn validate_return_code_segment(
        &mut self,
        selector: Selector,
        cpl: u8,
    ) -> Result<CodeSegment, Exception> {
        let descriptor = self.descriptor(selector)?;
        if descriptor.is_null() {
            return Err(Exception::gp0());
        }
        if descriptor.is_outside_table_limits() {
            return Err(Exception::gp(selector.0));
        }
        let code = match descriptor {
            Descriptor::Code(code) => code,
            _ => return Err(Exception::gp(selector.0)),
        };
        if selector.rpl() < cpl {
            return Err(Exception::gp(selector.0));
        }
        if code.conforming && code.dpl > selector.rpl() {
            return Err(Exception::gp(selector.0));
        }
        if !code.conforming && code.dpl != selector.rpl() {
            return Err(Exception::gp(selector.0));
        }
        if !code.present {
            return Err(Exception::np(selector.0));
        }
        Ok(code)
    }

    // --- IRET ---------------------------------------------------------------

    pub(crate) fn iret(&mut self, o32: bool) -> Result<(), Exception> {
        if !self.protected_mode() {
            return self.real_mode_iret(o32);
        }
        if self.v86_mode() {
            // Without VME, V86 IRET is IOPL-sensitive.
            if self.iopl() < 3 {
                return Err(Exception::gp0());
            }
            return self.real_mode_iret(o32);
        }
        if self.get_eflags() & FLAG_NT != 0 {
            return self.task_return_via_backlink();
        }
        self.protected_iret(o32)
    }

    fn real_mode_iret(&mut self, o32: bool) -> Result<(), Exception> {
        let mut popper = TransactionalPopper::new();
        let offset = popper.pop_osize(self, o32)?;
        let selector = popper.pop_osize(self, o32)? as u16;
        let flags = popper.pop_osize(self, o32)?;
        popper.commit(self);

        self.set_segment_real(SegReg::CS, selector);
        self.set_eip(if o32 { offset } else { offset & 0xFFFF });
        self.apply_popped_flags(flags, o32);
        Ok(())
    }

    fn protected_iret(&mut self, o32: bool) -> Result<(), Exception> {
        let mut popper = TransactionalPopper::new();
        let mut offset = popper.pop_osize(self, o32)?;
        let selector = Selector(popper.pop_osize(self, o32)? as u16);
        let flags = popper.pop_osize(self, o32)?;

        if o32 && flags & FLAG_VM != 0 && self.cpl() == 0 {
            return self.iret_to_v86(popper, offset, selector.0, flags);
        }

        let original_cpl = self.cpl();
        let code = self.validate_return_code_segment(selector, original_cpl)?;
        if !code.default_big {
            offset &= 0xFFFF;
        }
        if offset > code.limit {
            return Err(Exception::gp0());
        }

        if selector.rpl() > original_cpl {
            let new_esp = popper.pop_osize(self, o32)?;
            let new_ss = popper.pop_osize(self, o32)? as u16;

            // Flag restore rules are judged at the outgoing CPL.
            self.apply_popped_flags(flags, o32);
            self.load_cs_checked(selector.0, &code, selector.rpl());
            self.set_eip(offset);
            self.load_segment(SegReg::SS, new_ss)?;
            self.gpr[REG_ESP] = new_esp;

            for seg in [SegReg::ES, SegReg::FS, SegReg::GS, SegReg::DS] {
                self.clear_segment_if_unreachable(seg);
            }
        } else {
            popper.commit(self);
            self.apply_popped_flags(flags, o32);
            self.load_cs_checked(selector.0, &code, original_cpl);
            self.set_eip(offset);
        }
        Ok(())
    }

    /// IRET whose popped EFLAGS image has VM set: unwind the V86 monitor
    /// frame (ESP, SS, ES, DS, FS, GS) and drop to ring 3 V86 execution.
    fn iret_to_v86(
        &mut self,
        mut popper: TransactionalPopper,
        offset: u32,
        cs: u16,
        flags: u32,
    ) -> Result<(), Exception> {
        let new_esp = popper.pop32(self)?;
        let new_ss = popper.pop32(self)? as u16;
        let new_es = popper.pop32(self)? as u16;
        let new_ds = popper.pop32(self)? as u16;
        let new_fs = popper.pop32(self)? as u16;
        let new_gs = popper.pop32(self)? as u16;

        self.set_eflags(flags);
        self.set_segment_real(SegReg::CS, cs);
        self.set_segment_real(SegReg::SS, new_ss);
        self.set_segment_real(SegReg::ES, new_es);
        self.set_segment_real(SegReg::DS, new_ds);
        self.set_segment_real(SegReg::FS, new_fs);
        self.set_segment_real(SegReg::GS, new_gs);
        self.set_eip(offset & 0xFFFF);
        self.gpr[REG_ESP] = new_esp;
        self.set_cpl(3);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{Cpu, CpuConfig};
    use crate::descriptor::Descriptor;
    use crate::state::{DescriptorTableReg, SystemSegmentReg, CR0_PE};

    fn descriptor_raw(base: u32, limit_raw: u32, typ: u8, s: bool, dpl: u8, db: bool, g: bool) -> u64 {
        let mut raw = 0u64;
        raw |= u64::from(limit_raw & 0xFFFF);
        raw |= u64::from(base & 0xFFFF) << 16;
        raw |= u64::from((base >> 16) & 0xFF) << 32;
        raw |= (u64::from(typ) | (u64::from(s) << 4) | (u64::from(dpl) << 5) | (1 << 7)) << 40;
        raw |= u64::from((limit_raw >> 16) & 0xF) << 48;
        raw |= (u64::from(db) << 54) | (u64::from(g) << 55);
        raw |= u64::from((base >> 24) & 0xFF) << 56;
        raw
    }

    fn call_gate_raw(selector: u16, offset: u32, dpl: u8) -> u64 {
        let mut raw = 0u64;
        raw |= u64::from(offset & 0xFFFF);
        raw |= u64::from(selector) << 16;
        raw |= (0xC | (u64::from(dpl) << 5) | (1 << 7)) << 40;
        raw |= u64::from(offset >> 16) << 48;
        raw
    }

    const GDT_BASE: u32 = 0x800;
    const TSS_BASE: u32 = 0x1800;
    // GDT layout: 08 ring3 code, 10 ring3 data, 18 ring0 code, 20 call gate,
    // 28 ring0 data (stack), 30 TSS.
    const RING3_CS: u16 = 0x08 | 3;
    const RING3_DS: u16 = 0x10 | 3;
    const RING0_CS: u16 = 0x18;
    const CALL_GATE: u16 = 0x20 | 3;
    const RING0_SS: u16 = 0x28;
    const TSS_SEL: u16 = 0x30;

    /// A protected-mode CPU parked at CPL 3 with a ring-0 stack in the TSS
    /// and a call gate at GDT[4].
    fn ring3_cpu() -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::default()).unwrap();
        let entries = [
            0u64,
            descriptor_raw(0, 0xFFFFF, 0xA, true, 3, true, true),
            descriptor_raw(0, 0xFFFFF, 0x2, true, 3, true, true),
            descriptor_raw(0, 0xFFFFF, 0xA, true, 0, true, true),
            call_gate_raw(RING0_CS, 0x4000, 3),
            descriptor_raw(0, 0xFFFFF, 0x2, true, 0, true, true),
            descriptor_raw(TSS_BASE, 0x67, 0x9, false, 0, false, false),
        ];
        for (i, raw) in entries.iter().enumerate() {
            let bytes = raw.to_le_bytes();
            cpu.bus_mut().load(GDT_BASE + (i as u32) * 8, &bytes);
        }
        cpu.gdtr = DescriptorTableReg {
            base: GDT_BASE,
            limit: (entries.len() * 8 - 1) as u16,
        };
        cpu.cr0 |= CR0_PE;

        // Ring-0 stack published through the TSS.
        cpu.bus_mut().load(TSS_BASE + 4, &0x3000u32.to_le_bytes()); // ESP0
        cpu.bus_mut()
            .load(TSS_BASE + 8, &u32::from(RING0_SS).to_le_bytes()); // SS0
        cpu.tr = SystemSegmentReg {
            selector: TSS_SEL,
            base: TSS_BASE,
            limit: 0x67,
            is_32bit: true,
        };

        // Drop to ring 3.
        let code = match cpu.descriptor(Selector(RING3_CS)).unwrap() {
            Descriptor::Code(code) => code,
            other => panic!("unexpected descriptor: {other:?}"),
        };
        cpu.load_cs_checked(RING3_CS, &code, 3);
        cpu.load_segment(SegReg::SS, RING3_DS).unwrap();
        cpu.gpr[REG_ESP] = 0x5000;
        cpu.set_eip(0x1000);
        cpu
    }

    #[test]
    fn call_gate_escalates_to_ring0_and_switches_stacks() {
        let mut cpu = ring3_cpu();
        let old_esp = cpu.stack_ptr();

        cpu.far_jump_sized(
            LogicalAddress::new(CALL_GATE, 0),
            JumpType::Call,
            true,
        )
        .unwrap();

        assert_eq!(cpu.cpl(), 0);
        assert_eq!(cpu.segment(SegReg::CS), RING0_CS);
        assert_eq!(cpu.eip(), 0x4000, "entry point comes from the gate");
        assert_eq!(cpu.segment(SegReg::SS), RING0_SS);

        // Frame on the ring-0 stack: old SS, old ESP, old CS, old EIP.
        assert_eq!(cpu.stack_ptr(), 0x3000 - 16);
        assert_eq!(cpu.read_memory32(SegReg::SS, 0x3000 - 4).unwrap(), u32::from(RING3_DS));
        assert_eq!(cpu.read_memory32(SegReg::SS, 0x3000 - 8).unwrap(), old_esp);
        assert_eq!(
            cpu.read_memory32(SegReg::SS, 0x3000 - 12).unwrap(),
            u32::from(RING3_CS)
        );
        assert_eq!(cpu.read_memory32(SegReg::SS, 0x3000 - 16).unwrap(), 0x1000);
    }

    #[test]
    fn retf_returns_to_outer_ring_and_restores_stack() {
        let mut cpu = ring3_cpu();
        cpu.far_jump_sized(LogicalAddress::new(CALL_GATE, 0), JumpType::Call, true)
            .unwrap();
        assert_eq!(cpu.cpl(), 0);

        cpu.far_return(0, true).unwrap();
        assert_eq!(cpu.cpl(), 3);
        assert_eq!(cpu.segment(SegReg::CS), RING3_CS);
        assert_eq!(cpu.eip(), 0x1000);
        assert_eq!(cpu.segment(SegReg::SS), RING3_DS);
        assert_eq!(cpu.stack_ptr(), 0x5000);
    }

    #[test]
    fn jmp_to_lower_privilege_code_faults() {
        let mut cpu = ring3_cpu();
        let err = cpu
            .far_jump_sized(LogicalAddress::new(RING0_CS | 3, 0x10), JumpType::Jmp, true)
            .unwrap_err();
        assert_eq!(err, Exception::gp(RING0_CS));
    }

    #[test]
    fn far_return_fault_leaves_stack_untouched() {
        let mut cpu = ring3_cpu();
        // A return frame naming a data segment as CS.
        cpu.push32(u32::from(RING3_DS)).unwrap();
        cpu.push32(0x2222).unwrap();
        let sp_before = cpu.stack_ptr();

        let err = cpu.far_return(0, true).unwrap_err();
        assert_eq!(err, Exception::gp(RING3_DS));
        assert_eq!(cpu.stack_ptr(), sp_before, "transactional pop must not commit");
    }
}
