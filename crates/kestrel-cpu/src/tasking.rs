//! Hardware task switching: TSS image save/load, busy-bit management,
//! backlink/NT nesting.

use tracing::trace;

use crate::cpu::Cpu;
use crate::descriptor::{Descriptor, Gate, Selector, TssDescriptor};
use crate::exception::Exception;
use crate::state::{
    SegReg, SystemSegmentReg, CR0_TS, FLAG_NT, FLAG_VM, REG_EAX, REG_EBP, REG_EBX, REG_ECX,
    REG_EDI, REG_EDX, REG_ESI, REG_ESP,
};
use crate::transfer::JumpType;

// 32-bit TSS field offsets.
mod tss32 {
    pub const BACKLINK: u32 = 0x00;
    pub const ESP0: u32 = 0x04;
    pub const SS0: u32 = 0x08;
    pub const CR3: u32 = 0x1C;
    pub const EIP: u32 = 0x20;
    pub const EFLAGS: u32 = 0x24;
    pub const GPR: u32 = 0x28;
    pub const ES: u32 = 0x48;
    pub const CS: u32 = 0x4C;
    pub const SS: u32 = 0x50;
    pub const DS: u32 = 0x54;
    pub const FS: u32 = 0x58;
    pub const GS: u32 = 0x5C;
    pub const LDT: u32 = 0x60;
    pub const MIN_LIMIT: u32 = 0x67;
}

// 16-bit (80286) TSS field offsets. The backlink shares offset 0 with the
// 32-bit layout.
mod tss16 {
    pub const SP0: u32 = 0x02;
    pub const SS0: u32 = 0x04;
    pub const IP: u32 = 0x0E;
    pub const FLAGS: u32 = 0x10;
    pub const GPR: u32 = 0x12;
    pub const ES: u32 = 0x22;
    pub const CS: u32 = 0x24;
    pub const SS: u32 = 0x26;
    pub const DS: u32 = 0x28;
    pub const LDT: u32 = 0x2A;
    pub const MIN_LIMIT: u32 = 0x2B;
}

const GPR_ORDER: [usize; 8] = [
    REG_EAX, REG_ECX, REG_EDX, REG_EBX, REG_ESP, REG_EBP, REG_ESI, REG_EDI,
];

impl Cpu {
    /// Ring-stack pointer for `dpl` out of the current TSS.
    pub(crate) fn tss_ring_stack(&mut self, dpl: u8) -> Result<(u16, u32), Exception> {
        let base = self.tr.base;
        if self.tr.is_32bit {
            let offset = tss32::ESP0 + u32::from(dpl) * 8;
            if offset + 5 > self.tr.limit {
                return Err(Exception::ts(self.tr.selector));
            }
            let esp = self.read_linear_u32(base.wrapping_add(offset))?;
            let ss = self.read_linear_u16(base.wrapping_add(offset + tss32::SS0 - tss32::ESP0))?;
            Ok((ss, esp))
        } else {
            let offset = tss16::SP0 + u32::from(dpl) * 4;
            if offset + 3 > self.tr.limit {
                return Err(Exception::ts(self.tr.selector));
            }
            let sp = self.read_linear_u16(base.wrapping_add(offset))?;
            let ss = self.read_linear_u16(base.wrapping_add(offset + 2))?;
            Ok((ss, u32::from(sp)))
        }
    }

    /// IRET with NT set: chase the backlink of the current TSS.
    pub(crate) fn task_return_via_backlink(&mut self) -> Result<(), Exception> {
        let backlink = self.read_linear_u16(self.tr.base)?;
        let selector = Selector(backlink);
        match self.descriptor(selector)? {
            Descriptor::Tss(tss) if tss.busy => self.task_switch(selector, &tss, JumpType::Iret),
            _ => Err(Exception::ts(backlink)),
        }
    }

    /// JMP/CALL arriving at a task gate rather than a TSS descriptor.
    pub(crate) fn task_switch_through_gate(
        &mut self,
        gate: &Gate,
        jump_type: JumpType,
    ) -> Result<(), Exception> {
        let selector = Selector(gate.selector);
        if selector.ti_local() {
            return Err(Exception::gp(gate.selector));
        }
        match self.descriptor(selector)? {
            Descriptor::Tss(tss) => {
                if !tss.present {
                    return Err(Exception::np(gate.selector));
                }
                self.task_switch(selector, &tss, jump_type)
            }
            _ => Err(Exception::gp(gate.selector)),
        }
    }

    /// The full task switch. On exit the incoming task's register image is
    /// live; segment validation failures fault with #TS *after* the switch,
    /// so the handler runs on the incoming task.
    pub(crate) fn task_switch(
        &mut self,
        selector: Selector,
        incoming: &TssDescriptor,
        jump_type: JumpType,
    ) -> Result<(), Exception> {
        if jump_type != JumpType::Iret && incoming.busy {
            return Err(Exception::gp(selector.0));
        }
        let min_limit = if incoming.is_32bit {
            tss32::MIN_LIMIT
        } else {
            tss16::MIN_LIMIT
        };
        if incoming.limit < min_limit {
            return Err(Exception::ts(selector.0));
        }

        trace!(
            target: "kestrel_cpu",
            from = self.tr.selector,
            to = selector.0,
            ?jump_type,
            "task switch",
        );

        let outgoing = self.tr;
        self.save_task_state(outgoing.base, outgoing.is_32bit, jump_type)?;

        if matches!(jump_type, JumpType::Jmp | JumpType::Iret) {
            self.set_tss_busy(Selector(outgoing.selector), false)?;
        }

        self.load_task_state(incoming, jump_type, outgoing.selector, selector)?;
        Ok(())
    }

    fn save_task_state(
        &mut self,
        base: u32,
        is_32bit: bool,
        jump_type: JumpType,
    ) -> Result<(), Exception> {
        let mut flags = self.get_eflags();
        if jump_type == JumpType::Iret {
            // Leaving the nested task: the saved image must not re-enter it.
            flags &= !FLAG_NT;
        }

        if is_32bit {
            self.write_linear_u32(base.wrapping_add(tss32::EIP), self.eip())?;
            self.write_linear_u32(base.wrapping_add(tss32::EFLAGS), flags)?;
            for (i, reg) in GPR_ORDER.iter().enumerate() {
                self.write_linear_u32(
                    base.wrapping_add(tss32::GPR + (i as u32) * 4),
                    self.read_reg32(*reg),
                )?;
            }
            for (offset, seg) in [
                (tss32::ES, SegReg::ES),
                (tss32::CS, SegReg::CS),
                (tss32::SS, SegReg::SS),
                (tss32::DS, SegReg::DS),
                (tss32::FS, SegReg::FS),
                (tss32::GS, SegReg::GS),
            ] {
                self.write_linear_u16(base.wrapping_add(offset), self.segment(seg))?;
            }
            self.write_linear_u16(base.wrapping_add(tss32::LDT), self.ldtr_selector())?;
        } else {
            self.write_linear_u16(base.wrapping_add(tss16::IP), self.eip() as u16)?;
            self.write_linear_u16(base.wrapping_add(tss16::FLAGS), flags as u16)?;
            for (i, reg) in GPR_ORDER.iter().enumerate() {
                self.write_linear_u16(
                    base.wrapping_add(tss16::GPR + (i as u32) * 2),
                    self.read_reg16(*reg),
                )?;
            }
            for (offset, seg) in [
                (tss16::ES, SegReg::ES),
                (tss16::CS, SegReg::CS),
                (tss16::SS, SegReg::SS),
                (tss16::DS, SegReg::DS),
            ] {
                self.write_linear_u16(base.wrapping_add(offset), self.segment(seg))?;
            }
            self.write_linear_u16(base.wrapping_add(tss16::LDT), self.ldtr_selector())?;
        }
        Ok(())
    }

    fn load_task_state(
        &mut self,
        incoming: &TssDescriptor,
        jump_type: JumpType,
        outgoing_selector: u16,
        selector: Selector,
    ) -> Result<(), Exception> {
        let base = incoming.base;

        let (eip, flags, ldt_selector);
        let mut selectors = [0u16; 6];
        if incoming.is_32bit {
            // CR3 only travels in the 386 TSS. No TLB exists, so the reload
            // is complete the moment the register changes.
            let cr3 = self.read_linear_u32(base.wrapping_add(tss32::CR3))?;
            self.set_cr(3, cr3)?;
            eip = self.read_linear_u32(base.wrapping_add(tss32::EIP))?;
            flags = self.read_linear_u32(base.wrapping_add(tss32::EFLAGS))?;
            for (i, reg) in GPR_ORDER.iter().enumerate() {
                let value = self.read_linear_u32(base.wrapping_add(tss32::GPR + (i as u32) * 4))?;
                self.write_reg32(*reg, value);
            }
            for (offset, seg) in [
                (tss32::ES, SegReg::ES),
                (tss32::CS, SegReg::CS),
                (tss32::SS, SegReg::SS),
                (tss32::DS, SegReg::DS),
                (tss32::FS, SegReg::FS),
                (tss32::GS, SegReg::GS),
            ] {
                selectors[seg as usize] = self.read_linear_u16(base.wrapping_add(offset))?;
            }
            ldt_selector = self.read_linear_u16(base.wrapping_add(tss32::LDT))?;
        } else {
            eip = u32::from(self.read_linear_u16(base.wrapping_add(tss16::IP))?);
            flags = u32::from(self.read_linear_u16(base.wrapping_add(tss16::FLAGS))?);
            for (i, reg) in GPR_ORDER.iter().enumerate() {
                let value = self.read_linear_u16(base.wrapping_add(tss16::GPR + (i as u32) * 2))?;
                self.write_reg16(*reg, value);
            }
            for (offset, seg) in [
                (tss16::ES, SegReg::ES),
                (tss16::CS, SegReg::CS),
                (tss16::SS, SegReg::SS),
                (tss16::DS, SegReg::DS),
            ] {
                selectors[seg as usize] = self.read_linear_u16(base.wrapping_add(offset))?;
            }
            ldt_selector = self.read_linear_u16(base.wrapping_add(tss16::LDT))?;
        }

        self.tr = SystemSegmentReg {
            selector: selector.0,
            base: incoming.base,
            limit: incoming.limit,
            is_32bit: incoming.is_32bit,
        };
        if jump_type != JumpType::Iret {
            self.set_tss_busy(selector, true)?;
        }

        let mut flags = flags;
        if matches!(jump_type, JumpType::Call | JumpType::Int) {
            self.write_linear_u16(base.wrapping_add(tss32::BACKLINK), outgoing_selector)?;
            flags |= FLAG_NT;
        }

        self.set_eflags(flags);
        self.set_eip(eip);
        // The incoming EIP is this task's restart point; a post-switch #TS
        // must not rewind into the outgoing task.
        self.sync_instruction_start();

        let cr0 = self.control_register(0).unwrap_or(0);
        self.set_cr(0, cr0 | CR0_TS)?;

        self.load_ldtr(ldt_selector)
            .map_err(|_| Exception::ts(ldt_selector))?;

        if flags & FLAG_VM != 0 {
            for seg in SegReg::ALL {
                self.set_segment_real(seg, selectors[seg as usize]);
            }
            self.set_cpl(3);
            return Ok(());
        }

        self.reload_task_segments(&selectors)
    }

    /// Post-switch segment reloads; any failure is #TS with the offending
    /// selector, delivered on the incoming task.
    fn reload_task_segments(&mut self, selectors: &[u16; 6]) -> Result<(), Exception> {
        let cs_selector = Selector(selectors[SegReg::CS as usize]);
        let code = match self.descriptor(cs_selector)? {
            Descriptor::Code(code) => code,
            _ => return Err(Exception::ts(cs_selector.0)),
        };
        if !code.present {
            return Err(Exception::ts(cs_selector.0));
        }
        let cpl = cs_selector.rpl();
        if code.conforming {
            if code.dpl > cpl {
                return Err(Exception::ts(cs_selector.0));
            }
        } else if code.dpl != cpl {
            return Err(Exception::ts(cs_selector.0));
        }
        self.load_cs_checked(cs_selector.0, &code, cpl);

        let ss = selectors[SegReg::SS as usize];
        self.load_segment(SegReg::SS, ss)
            .map_err(|_| Exception::ts(ss))?;

        for seg in [SegReg::ES, SegReg::DS, SegReg::FS, SegReg::GS] {
            let sel = selectors[seg as usize];
            self.load_segment(seg, sel)
                .map_err(|_| Exception::ts(sel))?;
        }
        Ok(())
    }
}
