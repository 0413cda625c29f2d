//! Shift/rotate groups, the bit-test family, bit scans, SETcc and the
//! double-precision shifts.

use crate::cpu::{Cpu, Env};
use crate::decode::{Instruction, RmLocation};
use crate::exception::Exception;
use crate::state::REG_ECX;

#[derive(Debug, Clone, Copy)]
enum ShiftKind {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
}

fn shift_kind(group_ext: usize) -> Option<ShiftKind> {
    Some(match group_ext {
        0 => ShiftKind::Rol,
        1 => ShiftKind::Ror,
        2 => ShiftKind::Rcl,
        3 => ShiftKind::Rcr,
        4 | 6 => ShiftKind::Shl, // /6 is the undocumented SAL alias
        5 => ShiftKind::Shr,
        7 => ShiftKind::Sar,
        _ => return None,
    })
}

fn shift8(cpu: &mut Cpu, kind: ShiftKind, value: u8, count: u32) -> u8 {
    match kind {
        ShiftKind::Rol => cpu.alu_rol(value, count),
        ShiftKind::Ror => cpu.alu_ror(value, count),
        ShiftKind::Rcl => cpu.alu_rcl(value, count),
        ShiftKind::Rcr => cpu.alu_rcr(value, count),
        ShiftKind::Shl => cpu.alu_shl(value, count),
        ShiftKind::Shr => cpu.alu_shr(value, count),
        ShiftKind::Sar => cpu.alu_sar(value, count),
    }
}

fn shift16(cpu: &mut Cpu, kind: ShiftKind, value: u16, count: u32) -> u16 {
    match kind {
        ShiftKind::Rol => cpu.alu_rol(value, count),
        ShiftKind::Ror => cpu.alu_ror(value, count),
        ShiftKind::Rcl => cpu.alu_rcl(value, count),
        ShiftKind::Rcr => cpu.alu_rcr(value, count),
        ShiftKind::Shl => cpu.alu_shl(value, count),
        ShiftKind::Shr => cpu.alu_shr(value, count),
        ShiftKind::Sar => cpu.alu_sar(value, count),
    }
}

fn shift32(cpu: &mut Cpu, kind: ShiftKind, value: u32, count: u32) -> u32 {
    match kind {
        ShiftKind::Rol => cpu.alu_rol(value, count),
        ShiftKind::Ror => cpu.alu_ror(value, count),
        ShiftKind::Rcl => cpu.alu_rcl(value, count),
        ShiftKind::Rcr => cpu.alu_rcr(value, count),
        ShiftKind::Shl => cpu.alu_shl(value, count),
        ShiftKind::Shr => cpu.alu_shr(value, count),
        ShiftKind::Sar => cpu.alu_sar(value, count),
    }
}

fn shift_count(cpu: &Cpu, insn: &Instruction) -> u32 {
    match insn.opcode {
        0xD0 | 0xD1 => 1,
        0xD2 | 0xD3 => u32::from(cpu.read_reg8(REG_ECX)) & 0x1F, // CL
        _ => insn.imm & 0x1F,
    }
}

pub(crate) fn shift_rm8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let kind = shift_kind(insn.modrm().reg()).ok_or(Exception::InvalidOpcode)?;
    let count = shift_count(cpu, insn);
    let value = cpu.read_rm8(insn)?;
    let result = shift8(cpu, kind, value, count);
    cpu.write_rm8(insn, result)
}

pub(crate) fn shift_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let kind = shift_kind(insn.modrm().reg()).ok_or(Exception::InvalidOpcode)?;
    let count = shift_count(cpu, insn);
    if insn.o32 {
        let value = cpu.read_rm32(insn)?;
        let result = shift32(cpu, kind, value, count);
        cpu.write_rm32(insn, result)
    } else {
        let value = cpu.read_rm16(insn)?;
        let result = shift16(cpu, kind, value, count);
        cpu.write_rm16(insn, result)
    }
}

// --- Double-precision shifts ------------------------------------------------

fn shld_shrd(
    cpu: &mut Cpu,
    insn: &Instruction,
    count: u32,
    left: bool,
) -> Result<(), Exception> {
    let count = count & 0x1F;
    let fill_reg = insn.modrm().reg();
    if insn.o32 {
        let value = cpu.read_rm32(insn)?;
        let fill = cpu.read_reg32(fill_reg);
        let result = if left {
            cpu.alu_shld(value, fill, count)
        } else {
            cpu.alu_shrd(value, fill, count)
        };
        cpu.write_rm32(insn, result)
    } else {
        let value = cpu.read_rm16(insn)?;
        let fill = cpu.read_reg16(fill_reg);
        let result = if left {
            cpu.alu_shld(value, fill, count)
        } else {
            cpu.alu_shrd(value, fill, count)
        };
        cpu.write_rm16(insn, result)
    }
}

pub(crate) fn shld_imm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    shld_shrd(cpu, insn, insn.imm, true)
}

pub(crate) fn shld_cl(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let count = u32::from(cpu.read_reg8(REG_ECX));
    shld_shrd(cpu, insn, count, true)
}

pub(crate) fn shrd_imm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    shld_shrd(cpu, insn, insn.imm, false)
}

pub(crate) fn shrd_cl(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let count = u32::from(cpu.read_reg8(REG_ECX));
    shld_shrd(cpu, insn, count, false)
}

// --- Bit test family --------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitOp {
    Test,
    Set,
    Reset,
    Complement,
}

/// Register-sourced bit offsets address memory beyond the operand: the
/// effective address is displaced by the signed bit index divided by the
/// operand width.
fn bit_test(
    cpu: &mut Cpu,
    insn: &Instruction,
    bit_index: u32,
    from_register: bool,
    op: BitOp,
) -> Result<(), Exception> {
    let width = insn.osize().bits();

    match insn.modrm().location {
        RmLocation::Reg(reg) => {
            let bit = bit_index % width;
            let value = if insn.o32 {
                cpu.read_reg32(reg)
            } else {
                u32::from(cpu.read_reg16(reg))
            };
            let carry = value & (1 << bit) != 0;
            cpu.set_cf(carry);
            let new = apply_bit(value, bit, carry, op);
            if let Some(new) = new {
                if insn.o32 {
                    cpu.write_reg32(reg, new);
                } else {
                    cpu.write_reg16(reg, new as u16);
                }
            }
        }
        RmLocation::Mem { seg, ea } => {
            let (ea, bit) = if from_register {
                let signed = bit_index as i32;
                let elem = signed.div_euclid(width as i32);
                let bit = signed.rem_euclid(width as i32) as u32;
                (
                    ea.wrapping_add((elem * (width as i32 / 8)) as u32),
                    bit,
                )
            } else {
                (ea, bit_index % width)
            };
            let value = cpu.read_memory_osize(seg, ea, insn.o32)?;
            let carry = value & (1 << bit) != 0;
            cpu.set_cf(carry);
            if let Some(new) = apply_bit(value, bit, carry, op) {
                cpu.write_memory_osize(seg, ea, insn.o32, new)?;
            }
        }
    }
    Ok(())
}

fn apply_bit(value: u32, bit: u32, carry: bool, op: BitOp) -> Option<u32> {
    match op {
        BitOp::Test => None,
        BitOp::Set => Some(value | (1 << bit)),
        BitOp::Reset => Some(value & !(1 << bit)),
        BitOp::Complement => Some(if carry {
            value & !(1 << bit)
        } else {
            value | (1 << bit)
        }),
    }
}

fn bit_index_from_reg(cpu: &Cpu, insn: &Instruction) -> u32 {
    if insn.o32 {
        cpu.read_reg32(insn.modrm().reg())
    } else {
        u32::from(cpu.read_reg16(insn.modrm().reg()))
    }
}

pub(crate) fn bt_rm_r(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let index = bit_index_from_reg(cpu, insn);
    bit_test(cpu, insn, index, true, BitOp::Test)
}

pub(crate) fn bts_rm_r(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let index = bit_index_from_reg(cpu, insn);
    bit_test(cpu, insn, index, true, BitOp::Set)
}

pub(crate) fn btr_rm_r(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let index = bit_index_from_reg(cpu, insn);
    bit_test(cpu, insn, index, true, BitOp::Reset)
}

pub(crate) fn btc_rm_r(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let index = bit_index_from_reg(cpu, insn);
    bit_test(cpu, insn, index, true, BitOp::Complement)
}

pub(crate) fn bt_group_imm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let op = match insn.modrm().reg() {
        4 => BitOp::Test,
        5 => BitOp::Set,
        6 => BitOp::Reset,
        7 => BitOp::Complement,
        _ => return Err(Exception::InvalidOpcode),
    };
    bit_test(cpu, insn, insn.imm, false, op)
}

// --- Bit scans --------------------------------------------------------------

pub(crate) fn bsf(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let value = cpu.read_rm_osize(insn)?;
    if value == 0 {
        cpu.set_zf(true);
        return Ok(());
    }
    cpu.set_zf(false);
    let index = value.trailing_zeros();
    let reg = insn.modrm().reg();
    if insn.o32 {
        cpu.write_reg32(reg, index);
    } else {
        cpu.write_reg16(reg, index as u16);
    }
    Ok(())
}

pub(crate) fn bsr(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let value = cpu.read_rm_osize(insn)?;
    if value == 0 {
        cpu.set_zf(true);
        return Ok(());
    }
    cpu.set_zf(false);
    let index = 31 - value.leading_zeros();
    let reg = insn.modrm().reg();
    if insn.o32 {
        cpu.write_reg32(reg, index);
    } else {
        cpu.write_reg16(reg, index as u16);
    }
    Ok(())
}

// --- SETcc ------------------------------------------------------------------

pub(crate) fn setcc(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let cc = (insn.opcode & 0xF) as u8;
    let value = u8::from(cpu.condition(cc));
    cpu.write_rm8(insn, value)
}
