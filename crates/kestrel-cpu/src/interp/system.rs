//! System instructions: descriptor-table management, control/debug register
//! moves, protection probes.

use crate::cpu::{Cpu, Env};
use crate::decode::{Instruction, RmLocation};
use crate::descriptor::{Descriptor, Selector};
use crate::exception::Exception;
use crate::state::{DescriptorTableReg, CR0_PE, CR0_TS, FLAG_ZF};

fn require_ring0(cpu: &Cpu) -> Result<(), Exception> {
    if cpu.protected_mode() && cpu.cpl() != 0 {
        return Err(Exception::gp0());
    }
    Ok(())
}

/// The protection probes (LLDT, LTR, LAR, LSL, VERR, VERW, ARPL) only exist
/// in protected mode.
fn require_protected(cpu: &Cpu) -> Result<(), Exception> {
    if cpu.real_semantics() {
        return Err(Exception::InvalidOpcode);
    }
    Ok(())
}

// --- Group 6 (0F 00) --------------------------------------------------------

pub(crate) fn sldt(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    require_protected(cpu)?;
    let selector = cpu.ldtr_selector();
    cpu.write_rm16(insn, selector)
}

pub(crate) fn str_(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    require_protected(cpu)?;
    let selector = cpu.tr_selector();
    cpu.write_rm16(insn, selector)
}

pub(crate) fn lldt(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    require_protected(cpu)?;
    require_ring0(cpu)?;
    let selector = cpu.read_rm16(insn)?;
    cpu.load_ldtr(selector)
}

pub(crate) fn ltr(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    require_protected(cpu)?;
    require_ring0(cpu)?;
    let selector = cpu.read_rm16(insn)?;
    cpu.load_tr(selector)
}

pub(crate) fn verr(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    require_protected(cpu)?;
    let selector = cpu.read_rm16(insn)?;
    let ok = cpu.segment_verifies(Selector(selector), false)?;
    cpu.set_flag(FLAG_ZF, ok);
    Ok(())
}

pub(crate) fn verw(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    require_protected(cpu)?;
    let selector = cpu.read_rm16(insn)?;
    let ok = cpu.segment_verifies(Selector(selector), true)?;
    cpu.set_flag(FLAG_ZF, ok);
    Ok(())
}

// --- Group 7 (0F 01) --------------------------------------------------------

fn store_table_register(
    cpu: &mut Cpu,
    insn: &Instruction,
    table: DescriptorTableReg,
) -> Result<(), Exception> {
    let (seg, ea) = cpu.rm_memory_operand(insn)?;
    cpu.write_memory16(seg, ea, table.limit)?;
    cpu.write_memory32(seg, ea.wrapping_add(2), table.base)
}

fn load_table_register(cpu: &mut Cpu, insn: &Instruction) -> Result<DescriptorTableReg, Exception> {
    require_ring0(cpu)?;
    let (seg, ea) = cpu.rm_memory_operand(insn)?;
    let limit = cpu.read_memory16(seg, ea)?;
    let mut base = cpu.read_memory32(seg, ea.wrapping_add(2))?;
    if !insn.o32 {
        // 16-bit forms only move a 24-bit base.
        base &= 0x00FF_FFFF;
    }
    Ok(DescriptorTableReg { base, limit })
}

pub(crate) fn sgdt(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let table = cpu.gdtr();
    store_table_register(cpu, insn, table)
}

pub(crate) fn sidt(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let table = cpu.idtr();
    store_table_register(cpu, insn, table)
}

pub(crate) fn lgdt(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let table = load_table_register(cpu, insn)?;
    cpu.set_gdtr(table.base, table.limit);
    Ok(())
}

pub(crate) fn lidt(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let table = load_table_register(cpu, insn)?;
    cpu.set_idtr(table.base, table.limit);
    Ok(())
}

pub(crate) fn smsw(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let msw = cpu.control_register(0).unwrap_or(0) as u16;
    cpu.write_rm16(insn, msw)
}

pub(crate) fn lmsw(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    require_ring0(cpu)?;
    let value = cpu.read_rm16(insn)?;
    // LMSW can set PE but never clear it, and only touches the low 4 bits.
    let cr0 = cpu.control_register(0).unwrap_or(0);
    let new = (cr0 & !0xE) | u32::from(value & 0xE) | (cr0 & CR0_PE) | u32::from(value & 1);
    cpu.set_cr(0, new)?;
    Ok(())
}

pub(crate) fn invlpg(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    require_ring0(cpu)?;
    // No TLB to shoot down; the operand still has to be a memory form.
    cpu.rm_memory_operand(insn)?;
    Ok(())
}

// --- Control and debug registers --------------------------------------------

fn modrm_register(insn: &Instruction) -> Result<usize, Exception> {
    match insn.modrm().location {
        RmLocation::Reg(reg) => Ok(reg),
        // mod != 3 is not a valid encoding for the CR/DR moves.
        RmLocation::Mem { .. } => Err(Exception::InvalidOpcode),
    }
}

pub(crate) fn mov_r32_cr(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    require_ring0(cpu)?;
    let reg = modrm_register(insn)?;
    let value = cpu
        .control_register(insn.modrm().reg())
        .ok_or(Exception::InvalidOpcode)?;
    cpu.write_reg32(reg, value);
    Ok(())
}

pub(crate) fn mov_cr_r32(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    require_ring0(cpu)?;
    let reg = modrm_register(insn)?;
    let value = cpu.read_reg32(reg);
    cpu.set_cr(insn.modrm().reg(), value)
}

pub(crate) fn mov_r32_dr(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    require_ring0(cpu)?;
    let reg = modrm_register(insn)?;
    let value = cpu.debug_register(insn.modrm().reg());
    cpu.write_reg32(reg, value);
    Ok(())
}

pub(crate) fn mov_dr_r32(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    require_ring0(cpu)?;
    let reg = modrm_register(insn)?;
    let value = cpu.read_reg32(reg);
    cpu.set_debug_register(insn.modrm().reg(), value);
    Ok(())
}

pub(crate) fn clts(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    require_ring0(cpu)?;
    let cr0 = cpu.control_register(0).unwrap_or(0);
    cpu.set_cr(0, cr0 & !CR0_TS)
}

pub(crate) fn wbinvd(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    // There are no caches to write back; the privilege check is the
    // architectural part.
    require_ring0(cpu)
}

// --- Protection probes ------------------------------------------------------

pub(crate) fn lar(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    require_protected(cpu)?;
    let selector = Selector(cpu.read_rm16(insn)?);
    match cpu.access_rights_for(selector)? {
        Some(rights) => {
            cpu.set_flag(FLAG_ZF, true);
            let reg = insn.modrm().reg();
            if insn.o32 {
                cpu.write_reg32(reg, rights & 0x00FF_FF00);
            } else {
                cpu.write_reg16(reg, (rights & 0xFF00) as u16);
            }
        }
        None => cpu.set_flag(FLAG_ZF, false),
    }
    Ok(())
}

pub(crate) fn lsl(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    require_protected(cpu)?;
    let selector = Selector(cpu.read_rm16(insn)?);
    match cpu.segment_limit_for(selector)? {
        Some(limit) => {
            cpu.set_flag(FLAG_ZF, true);
            let reg = insn.modrm().reg();
            if insn.o32 {
                cpu.write_reg32(reg, limit);
            } else {
                cpu.write_reg16(reg, limit as u16);
            }
        }
        None => cpu.set_flag(FLAG_ZF, false),
    }
    Ok(())
}

pub(crate) fn arpl(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    require_protected(cpu)?;
    let dest = cpu.read_rm16(insn)?;
    let source = cpu.read_reg16(insn.modrm().reg());
    if dest & 3 < source & 3 {
        cpu.set_flag(FLAG_ZF, true);
        cpu.write_rm16(insn, (dest & !3) | (source & 3))?;
    } else {
        cpu.set_flag(FLAG_ZF, false);
    }
    Ok(())
}

// --- Probe helpers ----------------------------------------------------------

impl Cpu {
    /// VERR/VERW: whether the selector names a segment readable (or
    /// writable) from the current privilege level.
    fn segment_verifies(&mut self, selector: Selector, for_write: bool) -> Result<bool, Exception> {
        let descriptor = match self.descriptor(selector)? {
            Descriptor::OutsideTableLimits | Descriptor::Null => return Ok(false),
            d => d,
        };
        Ok(match descriptor {
            Descriptor::Data(data) => {
                let priv_ok = data.dpl >= self.cpl().max(selector.rpl());
                priv_ok && (!for_write || data.writable)
            }
            Descriptor::Code(code) => {
                if for_write {
                    false
                } else if !code.readable {
                    false
                } else if code.conforming {
                    true
                } else {
                    code.dpl >= self.cpl().max(selector.rpl())
                }
            }
            _ => false,
        })
    }

    /// LAR: the access-rights dword, or None when the selector fails the
    /// visibility rules and only ZF=0 is reported.
    fn access_rights_for(&mut self, selector: Selector) -> Result<Option<u32>, Exception> {
        let raw = match self.raw_descriptor(selector)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let parsed = crate::descriptor::parse_descriptor(raw);
        if !self.descriptor_visible_to_probe(selector, &parsed, true) {
            return Ok(None);
        }
        Ok(Some(((raw >> 32) & 0x00F0_FF00) as u32))
    }

    fn segment_limit_for(&mut self, selector: Selector) -> Result<Option<u32>, Exception> {
        let raw = match self.raw_descriptor(selector)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let parsed = crate::descriptor::parse_descriptor(raw);
        if !self.descriptor_visible_to_probe(selector, &parsed, false) {
            return Ok(None);
        }
        let limit = match parsed {
            Descriptor::Code(seg) => seg.limit,
            Descriptor::Data(seg) => seg.limit,
            Descriptor::Ldt(seg) => seg.limit,
            Descriptor::Tss(tss) => tss.limit,
            _ => return Ok(None),
        };
        Ok(Some(limit))
    }

    fn descriptor_visible_to_probe(
        &self,
        selector: Selector,
        descriptor: &Descriptor,
        allow_gates: bool,
    ) -> bool {
        match descriptor {
            Descriptor::Code(code) => {
                code.conforming || code.dpl >= self.cpl().max(selector.rpl())
            }
            Descriptor::Data(data) => data.dpl >= self.cpl().max(selector.rpl()),
            Descriptor::Ldt(_) | Descriptor::Tss(_) => true,
            Descriptor::Gate(gate) => allow_gates && gate.dpl >= self.cpl().max(selector.rpl()),
            _ => false,
        }
    }
}
