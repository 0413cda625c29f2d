//! The packed/unpacked BCD adjustment opcodes.

use crate::cpu::{Cpu, Env};
use crate::decode::Instruction;
use crate::exception::Exception;

pub(crate) fn daa(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    let old_al = cpu.al();
    let old_cf = cpu.get_cf();

    let mut al = old_al;
    if old_al & 0x0F > 9 || cpu.get_af() {
        al = al.wrapping_add(6);
        cpu.set_af(true);
    } else {
        cpu.set_af(false);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_add(0x60);
        cpu.set_cf(true);
    } else {
        cpu.set_cf(false);
    }
    cpu.set_al(al);
    cpu.update_lazy_flags::<u8>(u32::from(al));
    Ok(())
}

pub(crate) fn das(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    let old_al = cpu.al();
    let old_cf = cpu.get_cf();

    let mut al = old_al;
    if old_al & 0x0F > 9 || cpu.get_af() {
        al = al.wrapping_sub(6);
        cpu.set_af(true);
    } else {
        cpu.set_af(false);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_sub(0x60);
        cpu.set_cf(true);
    } else {
        cpu.set_cf(false);
    }
    cpu.set_al(al);
    cpu.update_lazy_flags::<u8>(u32::from(al));
    Ok(())
}

pub(crate) fn aaa(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    if cpu.al() & 0x0F > 9 || cpu.get_af() {
        cpu.set_ax(cpu.ax().wrapping_add(0x106));
        cpu.set_af(true);
        cpu.set_cf(true);
    } else {
        cpu.set_af(false);
        cpu.set_cf(false);
    }
    let al = cpu.al() & 0x0F;
    cpu.set_al(al);
    Ok(())
}

pub(crate) fn aas(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    if cpu.al() & 0x0F > 9 || cpu.get_af() {
        cpu.set_ax(cpu.ax().wrapping_sub(6));
        let ah = cpu.read_reg8(4).wrapping_sub(1);
        cpu.write_reg8(4, ah);
        cpu.set_af(true);
        cpu.set_cf(true);
    } else {
        cpu.set_af(false);
        cpu.set_cf(false);
    }
    let al = cpu.al() & 0x0F;
    cpu.set_al(al);
    Ok(())
}

pub(crate) fn aam(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let base = insn.imm as u8;
    if base == 0 {
        return Err(Exception::DivideError);
    }
    let al = cpu.al();
    cpu.write_reg8(4, al / base); // AH
    let al = al % base;
    cpu.set_al(al);
    cpu.update_lazy_flags::<u8>(u32::from(al));
    Ok(())
}

pub(crate) fn aad(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let base = insn.imm as u8;
    let al = cpu
        .al()
        .wrapping_add(cpu.read_reg8(4).wrapping_mul(base));
    cpu.set_al(al);
    cpu.write_reg8(4, 0);
    cpu.update_lazy_flags::<u8>(u32::from(al));
    Ok(())
}
