//! Branches, calls, returns, software interrupts.

use crate::addr::LogicalAddress;
use crate::cpu::{Cpu, Env};
use crate::decode::Instruction;
use crate::exception::{Exception, InterruptSource};
use crate::state::{REG_ECX, SegReg};
use crate::transfer::JumpType;

fn ip_mask(o32: bool) -> u32 {
    if o32 {
        0xFFFF_FFFF
    } else {
        0xFFFF
    }
}

/// Mask a near target to the operand size and check it against the CS
/// limit, so a wild branch faults before any side effect.
fn checked_near_target(cpu: &Cpu, o32: bool, target: u32) -> Result<u32, Exception> {
    let target = target & ip_mask(o32);
    if !cpu.real_semantics() && target > cpu.cache(SegReg::CS).limit {
        return Err(Exception::gp0());
    }
    Ok(target)
}

fn jump_near(cpu: &mut Cpu, o32: bool, target: u32) -> Result<(), Exception> {
    let target = checked_near_target(cpu, o32, target)?;
    cpu.set_eip(target);
    Ok(())
}

pub(crate) fn jcc_rel(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let cc = (insn.opcode & 0xF) as u8;
    if cpu.condition(cc) {
        let target = cpu.eip().wrapping_add(insn.imm);
        return jump_near(cpu, insn.o32, target);
    }
    Ok(())
}

pub(crate) fn jmp_rel(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let target = cpu.eip().wrapping_add(insn.imm);
    jump_near(cpu, insn.o32, target)
}

pub(crate) fn jmp_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let target = cpu.read_rm_osize(insn)?;
    jump_near(cpu, insn.o32, target)
}

pub(crate) fn jmp_far(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let target = LogicalAddress::new(insn.imm2 as u16, insn.imm);
    cpu.far_jump_sized(target, JumpType::Jmp, insn.o32)
}

fn far_pointer_operand(cpu: &mut Cpu, insn: &Instruction) -> Result<LogicalAddress, Exception> {
    let (seg, ea) = cpu.rm_memory_operand(insn)?;
    let offset = cpu.read_memory_osize(seg, ea, insn.o32)?;
    let selector = cpu.read_memory16(seg, ea.wrapping_add(insn.osize().bytes()))?;
    Ok(LogicalAddress::new(selector, offset))
}

pub(crate) fn jmp_far_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let target = far_pointer_operand(cpu, insn)?;
    cpu.far_jump_sized(target, JumpType::Jmp, insn.o32)
}

pub(crate) fn call_rel(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let return_eip = cpu.eip();
    let target = checked_near_target(cpu, insn.o32, return_eip.wrapping_add(insn.imm))?;
    cpu.push_osize(return_eip, insn.o32)?;
    cpu.set_eip(target);
    Ok(())
}

pub(crate) fn call_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let raw_target = cpu.read_rm_osize(insn)?;
    let return_eip = cpu.eip();
    let target = checked_near_target(cpu, insn.o32, raw_target)?;
    cpu.push_osize(return_eip, insn.o32)?;
    cpu.set_eip(target);
    Ok(())
}

pub(crate) fn call_far(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let target = LogicalAddress::new(insn.imm2 as u16, insn.imm);
    cpu.far_jump_sized(target, JumpType::Call, insn.o32)
}

pub(crate) fn call_far_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let target = far_pointer_operand(cpu, insn)?;
    cpu.far_jump_sized(target, JumpType::Call, insn.o32)
}

/// Peek the return offset, validate it, and only then release the slot, so
/// a #GP on the target leaves the stack restartable.
fn ret_near_common(cpu: &mut Cpu, insn: &Instruction, release: u32) -> Result<(), Exception> {
    let raw = cpu.read_memory_osize(SegReg::SS, cpu.stack_ptr(), insn.o32)?;
    let target = checked_near_target(cpu, insn.o32, raw)?;
    cpu.adjust_stack_pointer((insn.osize().bytes() + release) as i32);
    cpu.set_eip(target);
    Ok(())
}

pub(crate) fn ret_near(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    ret_near_common(cpu, insn, 0)
}

pub(crate) fn ret_near_imm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    ret_near_common(cpu, insn, insn.imm)
}

pub(crate) fn retf(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    cpu.far_return(0, insn.o32)
}

pub(crate) fn retf_imm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    cpu.far_return(insn.imm as u16, insn.o32)
}

pub(crate) fn iret(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    cpu.iret(insn.o32)
}

// --- LOOP family ------------------------------------------------------------

fn decrement_count(cpu: &mut Cpu, a32: bool) -> u32 {
    if a32 {
        let v = cpu.ecx().wrapping_sub(1);
        cpu.write_reg32(REG_ECX, v);
        v
    } else {
        let v = cpu.read_reg16(REG_ECX).wrapping_sub(1);
        cpu.write_reg16(REG_ECX, v);
        u32::from(v)
    }
}

pub(crate) fn loop_rel(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let count = decrement_count(cpu, insn.a32);
    if count != 0 {
        let target = cpu.eip().wrapping_add(insn.imm);
        return jump_near(cpu, insn.o32, target);
    }
    Ok(())
}

pub(crate) fn loope_rel(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let count = decrement_count(cpu, insn.a32);
    if count != 0 && cpu.get_zf() {
        let target = cpu.eip().wrapping_add(insn.imm);
        return jump_near(cpu, insn.o32, target);
    }
    Ok(())
}

pub(crate) fn loopne_rel(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let count = decrement_count(cpu, insn.a32);
    if count != 0 && !cpu.get_zf() {
        let target = cpu.eip().wrapping_add(insn.imm);
        return jump_near(cpu, insn.o32, target);
    }
    Ok(())
}

pub(crate) fn jcxz_rel(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let count = if insn.a32 {
        cpu.ecx()
    } else {
        u32::from(cpu.read_reg16(REG_ECX))
    };
    if count == 0 {
        let target = cpu.eip().wrapping_add(insn.imm);
        return jump_near(cpu, insn.o32, target);
    }
    Ok(())
}

// --- Software interrupts ----------------------------------------------------

pub(crate) fn int_imm8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if cpu.v86_mode() && cpu.iopl() < 3 {
        return Err(Exception::gp0());
    }
    crate::interrupt::interrupt(cpu, insn.imm as u8, InterruptSource::Internal, None)
}

pub(crate) fn int3(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    crate::interrupt::interrupt(cpu, 3, InterruptSource::Internal, None)
}

pub(crate) fn into(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    if cpu.get_of() {
        return crate::interrupt::interrupt(cpu, 4, InterruptSource::Internal, None);
    }
    Ok(())
}
