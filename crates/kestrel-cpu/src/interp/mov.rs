//! MOV in all encodings, exchanges, address/segment loads and the widening
//! moves.

use crate::cpu::{Cpu, Env};
use crate::decode::{Instruction, RmLocation};
use crate::exception::Exception;
use crate::state::{SegReg, REG_EBX};

pub(crate) fn mov_rm8_r8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let v = cpu.read_reg8(insn.modrm().reg());
    cpu.write_rm8(insn, v)
}

pub(crate) fn mov_rm_r(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let v = cpu.read_reg32(insn.modrm().reg());
        cpu.write_rm32(insn, v)
    } else {
        let v = cpu.read_reg16(insn.modrm().reg());
        cpu.write_rm16(insn, v)
    }
}

pub(crate) fn mov_r8_rm8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let v = cpu.read_rm8(insn)?;
    cpu.write_reg8(insn.modrm().reg(), v);
    Ok(())
}

pub(crate) fn mov_r_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let v = cpu.read_rm32(insn)?;
        cpu.write_reg32(insn.modrm().reg(), v);
    } else {
        let v = cpu.read_rm16(insn)?;
        cpu.write_reg16(insn.modrm().reg(), v);
    }
    Ok(())
}

pub(crate) fn mov_rm_sreg(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let seg = SegReg::from_index(insn.modrm().reg()).ok_or(Exception::InvalidOpcode)?;
    let selector = cpu.segment(seg);
    match insn.modrm().location {
        // Register destination zero-extends to the full operand size.
        RmLocation::Reg(i) if insn.o32 => {
            cpu.write_reg32(i, u32::from(selector));
            Ok(())
        }
        _ => cpu.write_rm16(insn, selector),
    }
}

pub(crate) fn mov_sreg_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let seg = SegReg::from_index(insn.modrm().reg()).ok_or(Exception::InvalidOpcode)?;
    if seg == SegReg::CS {
        // MOV CS is not a thing on the 286+.
        return Err(Exception::InvalidOpcode);
    }
    let selector = cpu.read_rm16(insn)?;
    cpu.load_segment(seg, selector)?;
    if seg == SegReg::SS {
        cpu.make_next_instruction_uninterruptible();
    }
    Ok(())
}

pub(crate) fn mov_al_moffs(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let v = cpu.read_memory8(insn.data_segment(), insn.imm)?;
    cpu.set_al(v);
    Ok(())
}

pub(crate) fn mov_eax_moffs(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let v = cpu.read_memory32(insn.data_segment(), insn.imm)?;
        cpu.set_eax(v);
    } else {
        let v = cpu.read_memory16(insn.data_segment(), insn.imm)?;
        cpu.set_ax(v);
    }
    Ok(())
}

pub(crate) fn mov_moffs_al(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let v = cpu.al();
    cpu.write_memory8(insn.data_segment(), insn.imm, v)
}

pub(crate) fn mov_moffs_eax(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let v = cpu.eax();
        cpu.write_memory32(insn.data_segment(), insn.imm, v)
    } else {
        let v = cpu.ax();
        cpu.write_memory16(insn.data_segment(), insn.imm, v)
    }
}

pub(crate) fn mov_reg8_imm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    cpu.write_reg8(usize::from(insn.opcode & 7), insn.imm as u8);
    Ok(())
}

pub(crate) fn mov_reg_imm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let reg = usize::from(insn.opcode & 7);
    if insn.o32 {
        cpu.write_reg32(reg, insn.imm);
    } else {
        cpu.write_reg16(reg, insn.imm as u16);
    }
    Ok(())
}

pub(crate) fn mov_rm8_imm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    cpu.write_rm8(insn, insn.imm as u8)
}

pub(crate) fn mov_rm_imm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    cpu.write_rm_osize(insn, insn.imm)
}

// --- XCHG ------------------------------------------------------------------

pub(crate) fn xchg_eax_reg(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let reg = usize::from(insn.opcode & 7);
    if insn.o32 {
        let tmp = cpu.read_reg32(reg);
        let eax = cpu.eax();
        cpu.write_reg32(reg, eax);
        cpu.set_eax(tmp);
    } else {
        let tmp = cpu.read_reg16(reg);
        let ax = cpu.ax();
        cpu.write_reg16(reg, ax);
        cpu.set_ax(tmp);
    }
    Ok(())
}

pub(crate) fn xchg_rm8_r8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let reg = insn.modrm().reg();
    let tmp = cpu.read_rm8(insn)?;
    let reg_value = cpu.read_reg8(reg);
    cpu.write_rm8(insn, reg_value)?;
    cpu.write_reg8(reg, tmp);
    Ok(())
}

pub(crate) fn xchg_rm_r(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let reg = insn.modrm().reg();
    if insn.o32 {
        let tmp = cpu.read_rm32(insn)?;
        let reg_value = cpu.read_reg32(reg);
        cpu.write_rm32(insn, reg_value)?;
        cpu.write_reg32(reg, tmp);
    } else {
        let tmp = cpu.read_rm16(insn)?;
        let reg_value = cpu.read_reg16(reg);
        cpu.write_rm16(insn, reg_value)?;
        cpu.write_reg16(reg, tmp);
    }
    Ok(())
}

// --- Address loads ----------------------------------------------------------

pub(crate) fn lea(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let (_seg, ea) = cpu.rm_memory_operand(insn)?;
    let reg = insn.modrm().reg();
    if insn.o32 {
        cpu.write_reg32(reg, ea);
    } else {
        cpu.write_reg16(reg, ea as u16);
    }
    Ok(())
}

fn load_far_pointer(
    cpu: &mut Cpu,
    insn: &Instruction,
    seg: SegReg,
) -> Result<(), Exception> {
    let (src_seg, ea) = cpu.rm_memory_operand(insn)?;
    let offset = cpu.read_memory_osize(src_seg, ea, insn.o32)?;
    let selector = cpu.read_memory16(src_seg, ea.wrapping_add(insn.osize().bytes()))?;
    cpu.load_segment(seg, selector)?;
    let reg = insn.modrm().reg();
    if insn.o32 {
        cpu.write_reg32(reg, offset);
    } else {
        cpu.write_reg16(reg, offset as u16);
    }
    if seg == SegReg::SS {
        cpu.make_next_instruction_uninterruptible();
    }
    Ok(())
}

pub(crate) fn les(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    load_far_pointer(cpu, insn, SegReg::ES)
}

pub(crate) fn lds(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    load_far_pointer(cpu, insn, SegReg::DS)
}

pub(crate) fn lss(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    load_far_pointer(cpu, insn, SegReg::SS)
}

pub(crate) fn lfs(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    load_far_pointer(cpu, insn, SegReg::FS)
}

pub(crate) fn lgs(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    load_far_pointer(cpu, insn, SegReg::GS)
}

// --- Widening moves ---------------------------------------------------------

pub(crate) fn movzx_r_rm8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let v = u32::from(cpu.read_rm8(insn)?);
    let reg = insn.modrm().reg();
    if insn.o32 {
        cpu.write_reg32(reg, v);
    } else {
        cpu.write_reg16(reg, v as u16);
    }
    Ok(())
}

pub(crate) fn movzx_r_rm16(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let v = u32::from(cpu.read_rm16(insn)?);
    let reg = insn.modrm().reg();
    if insn.o32 {
        cpu.write_reg32(reg, v);
    } else {
        cpu.write_reg16(reg, v as u16);
    }
    Ok(())
}

pub(crate) fn movsx_r_rm8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let v = cpu.read_rm8(insn)? as i8;
    let reg = insn.modrm().reg();
    if insn.o32 {
        cpu.write_reg32(reg, v as i32 as u32);
    } else {
        cpu.write_reg16(reg, v as i16 as u16);
    }
    Ok(())
}

pub(crate) fn movsx_r_rm16(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let v = cpu.read_rm16(insn)? as i16;
    let reg = insn.modrm().reg();
    if insn.o32 {
        cpu.write_reg32(reg, v as i32 as u32);
    } else {
        cpu.write_reg16(reg, v as u16);
    }
    Ok(())
}

/// CMOVcc. The memory operand is read regardless of the condition, so a bad
/// address faults either way.
pub(crate) fn cmovcc(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let value = cpu.read_rm_osize(insn)?;
    let cc = (insn.opcode & 0xF) as u8;
    if cpu.condition(cc) {
        let reg = insn.modrm().reg();
        if insn.o32 {
            cpu.write_reg32(reg, value);
        } else {
            cpu.write_reg16(reg, value as u16);
        }
    }
    Ok(())
}

// --- XLAT ------------------------------------------------------------------

pub(crate) fn xlat(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let table = if insn.a32 {
        cpu.read_reg32(REG_EBX)
    } else {
        u32::from(cpu.read_reg16(REG_EBX))
    };
    let v = cpu.read_memory8(insn.data_segment(), table.wrapping_add(u32::from(cpu.al())))?;
    cpu.set_al(v);
    Ok(())
}
