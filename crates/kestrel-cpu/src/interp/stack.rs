//! Stack opcodes: pushes, pops, the all-register forms, flag images and
//! stack frames.

use crate::cpu::{Cpu, Env};
use crate::decode::Instruction;
use crate::exception::Exception;
use crate::state::{
    SegReg, FLAG_RF, FLAG_VM, REG_EBP, REG_ESP,
};

pub(crate) fn push_reg(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let reg = usize::from(insn.opcode & 7);
    let value = if insn.o32 {
        cpu.read_reg32(reg)
    } else {
        u32::from(cpu.read_reg16(reg))
    };
    cpu.push_osize(value, insn.o32)
}

pub(crate) fn pop_reg(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let reg = usize::from(insn.opcode & 7);
    let value = cpu.pop_osize(insn.o32)?;
    if insn.o32 {
        cpu.write_reg32(reg, value);
    } else {
        cpu.write_reg16(reg, value as u16);
    }
    Ok(())
}

pub(crate) fn push_imm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    cpu.push_osize(insn.imm, insn.o32)
}

pub(crate) fn push_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let value = cpu.read_rm_osize(insn)?;
    cpu.push_osize(value, insn.o32)
}

pub(crate) fn pop_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let value = cpu.pop_osize(insn.o32)?;
    cpu.write_rm_osize(insn, value)
}

fn push_sreg_for(cpu: &mut Cpu, insn: &Instruction, seg: SegReg) -> Result<(), Exception> {
    let selector = cpu.segment(seg);
    cpu.push_osize(u32::from(selector), insn.o32)
}

/// Pops the selector without committing SP until the load succeeded, so a
/// faulting load restarts cleanly.
fn pop_sreg_for(cpu: &mut Cpu, insn: &Instruction, seg: SegReg) -> Result<(), Exception> {
    let selector = cpu.read_memory_osize(SegReg::SS, cpu.stack_ptr(), insn.o32)? as u16;
    cpu.load_segment(seg, selector)?;
    cpu.adjust_stack_pointer(insn.osize().bytes() as i32);
    if seg == SegReg::SS {
        cpu.make_next_instruction_uninterruptible();
    }
    Ok(())
}

pub(crate) fn push_sreg(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let seg = match insn.opcode {
        0x06 => SegReg::ES,
        0x0E => SegReg::CS,
        0x16 => SegReg::SS,
        0x1E => SegReg::DS,
        0x0FA0 => SegReg::FS,
        _ => SegReg::GS,
    };
    push_sreg_for(cpu, insn, seg)
}

pub(crate) fn pop_sreg(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let seg = match insn.opcode {
        0x07 => SegReg::ES,
        0x17 => SegReg::SS,
        0x1F => SegReg::DS,
        0x0FA1 => SegReg::FS,
        _ => SegReg::GS,
    };
    pop_sreg_for(cpu, insn, seg)
}

// --- PUSHA / POPA -----------------------------------------------------------

pub(crate) fn pusha(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let original_sp = if insn.o32 {
        cpu.read_reg32(REG_ESP)
    } else {
        u32::from(cpu.read_reg16(REG_ESP))
    };
    for reg in [0, 1, 2, 3, REG_ESP, REG_EBP, 6, 7] {
        let value = if reg == REG_ESP {
            original_sp
        } else if insn.o32 {
            cpu.read_reg32(reg)
        } else {
            u32::from(cpu.read_reg16(reg))
        };
        cpu.push_osize(value, insn.o32)?;
    }
    Ok(())
}

pub(crate) fn popa(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    for reg in [7, 6, REG_EBP, REG_ESP, 3, 2, 1, 0] {
        let value = cpu.pop_osize(insn.o32)?;
        if reg == REG_ESP {
            // The stacked SP image is discarded.
            continue;
        }
        if insn.o32 {
            cpu.write_reg32(reg, value);
        } else {
            cpu.write_reg16(reg, value as u16);
        }
    }
    Ok(())
}

// --- PUSHF / POPF -----------------------------------------------------------

pub(crate) fn pushf(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if cpu.v86_mode() && cpu.iopl() < 3 {
        return Err(Exception::gp0());
    }
    // The pushed image never exposes VM/RF.
    let flags = cpu.get_eflags() & !(FLAG_VM | FLAG_RF);
    cpu.push_osize(flags, insn.o32)
}

pub(crate) fn popf(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if cpu.v86_mode() && cpu.iopl() < 3 {
        return Err(Exception::gp0());
    }
    let value = cpu.pop_osize(insn.o32)?;
    cpu.apply_popped_flags(value, insn.o32);
    Ok(())
}

// --- ENTER / LEAVE ----------------------------------------------------------

pub(crate) fn enter(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let frame_size = insn.imm;
    let nesting = insn.imm2 & 0x1F;
    let opsize = insn.osize().bytes();

    let bp = if insn.o32 {
        cpu.read_reg32(REG_EBP)
    } else {
        u32::from(cpu.read_reg16(REG_EBP))
    };
    cpu.push_osize(bp, insn.o32)?;
    let frame_temp = cpu.stack_ptr();

    if nesting > 0 {
        let mut display = bp;
        for _ in 1..nesting {
            display = display.wrapping_sub(opsize);
            let slot = cpu.read_memory_osize(SegReg::SS, display, insn.o32)?;
            cpu.push_osize(slot, insn.o32)?;
        }
        cpu.push_osize(frame_temp, insn.o32)?;
    }

    if insn.o32 {
        cpu.write_reg32(REG_EBP, frame_temp);
    } else {
        cpu.write_reg16(REG_EBP, frame_temp as u16);
    }
    cpu.set_stack_ptr(cpu.stack_ptr().wrapping_sub(frame_size));
    Ok(())
}

pub(crate) fn leave(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let bp = if insn.o32 {
        cpu.read_reg32(REG_EBP)
    } else {
        u32::from(cpu.read_reg16(REG_EBP))
    };
    cpu.set_stack_ptr(bp);
    let value = cpu.pop_osize(insn.o32)?;
    if insn.o32 {
        cpu.write_reg32(REG_EBP, value);
    } else {
        cpu.write_reg16(REG_EBP, value as u16);
    }
    Ok(())
}
