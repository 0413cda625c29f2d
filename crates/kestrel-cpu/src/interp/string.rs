//! String operations and their REP drivers.
//!
//! A REP loop checks the IRQ line between iterations: when an interrupt is
//! pending and IF is set, ECX keeps its current value, EIP rewinds to the
//! first prefix byte, and control returns to the main loop. The IRET from
//! the handler then re-decodes the whole prefixed instruction and the loop
//! picks up where it left off.

use crate::cpu::{Cpu, Env};
use crate::decode::{Instruction, RepPrefix};
use crate::exception::Exception;
use crate::state::{OpSize, SegReg, REG_ECX, REG_EDI, REG_EDX, REG_ESI};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringOp {
    Movs,
    Cmps,
    Scas,
    Lods,
    Stos,
    Ins,
    Outs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepMode {
    None,
    Plain,
    WhileEqual,
    WhileNotEqual,
}

fn rep_mode(op: StringOp, prefix: RepPrefix) -> RepMode {
    match prefix {
        RepPrefix::None => RepMode::None,
        RepPrefix::Rep => match op {
            StringOp::Cmps | StringOp::Scas => RepMode::WhileEqual,
            _ => RepMode::Plain,
        },
        RepPrefix::RepNe => match op {
            StringOp::Cmps | StringOp::Scas => RepMode::WhileNotEqual,
            _ => RepMode::Plain,
        },
    }
}

fn count(cpu: &Cpu, a32: bool) -> u32 {
    if a32 {
        cpu.read_reg32(REG_ECX)
    } else {
        u32::from(cpu.read_reg16(REG_ECX))
    }
}

fn set_count(cpu: &mut Cpu, a32: bool, value: u32) {
    if a32 {
        cpu.write_reg32(REG_ECX, value);
    } else {
        cpu.write_reg16(REG_ECX, value as u16);
    }
}

fn index(cpu: &Cpu, a32: bool, reg: usize) -> u32 {
    if a32 {
        cpu.read_reg32(reg)
    } else {
        u32::from(cpu.read_reg16(reg))
    }
}

fn step_index(cpu: &mut Cpu, a32: bool, reg: usize, elem: u32) {
    let delta = if cpu.get_df() {
        elem.wrapping_neg()
    } else {
        elem
    };
    if a32 {
        let v = cpu.read_reg32(reg).wrapping_add(delta);
        cpu.write_reg32(reg, v);
    } else {
        let v = cpu.read_reg16(reg).wrapping_add(delta as u16);
        cpu.write_reg16(reg, v);
    }
}

fn read_elem(cpu: &mut Cpu, seg: SegReg, offset: u32, size: OpSize) -> Result<u32, Exception> {
    match size {
        OpSize::Byte => Ok(u32::from(cpu.read_memory8(seg, offset)?)),
        OpSize::Word => Ok(u32::from(cpu.read_memory16(seg, offset)?)),
        OpSize::Dword => cpu.read_memory32(seg, offset),
    }
}

fn write_elem(
    cpu: &mut Cpu,
    seg: SegReg,
    offset: u32,
    size: OpSize,
    value: u32,
) -> Result<(), Exception> {
    match size {
        OpSize::Byte => cpu.write_memory8(seg, offset, value as u8),
        OpSize::Word => cpu.write_memory16(seg, offset, value as u16),
        OpSize::Dword => cpu.write_memory32(seg, offset, value),
    }
}

fn compare_elem(cpu: &mut Cpu, size: OpSize, a: u32, b: u32) {
    match size {
        OpSize::Byte => cpu.alu_cmp(a as u8, b as u8),
        OpSize::Word => cpu.alu_cmp(a as u16, b as u16),
        OpSize::Dword => cpu.alu_cmp(a, b),
    }
}

fn accumulator(cpu: &Cpu, size: OpSize) -> u32 {
    match size {
        OpSize::Byte => u32::from(cpu.al()),
        OpSize::Word => u32::from(cpu.ax()),
        OpSize::Dword => cpu.eax(),
    }
}

fn set_accumulator(cpu: &mut Cpu, size: OpSize, value: u32) {
    match size {
        OpSize::Byte => cpu.set_al(value as u8),
        OpSize::Word => cpu.set_ax(value as u16),
        OpSize::Dword => cpu.set_eax(value),
    }
}

/// One iteration of the operation. Faults propagate before any register
/// adjustment for the iteration, so a restart repeats it cleanly.
fn step(
    cpu: &mut Cpu,
    env: &mut Env<'_>,
    insn: &Instruction,
    op: StringOp,
    size: OpSize,
) -> Result<(), Exception> {
    let a32 = insn.a32;
    let elem = size.bytes();
    let src_seg = insn.data_segment();

    match op {
        StringOp::Movs => {
            let si = index(cpu, a32, REG_ESI);
            let di = index(cpu, a32, REG_EDI);
            let v = read_elem(cpu, src_seg, si, size)?;
            write_elem(cpu, SegReg::ES, di, size, v)?;
            step_index(cpu, a32, REG_ESI, elem);
            step_index(cpu, a32, REG_EDI, elem);
        }
        StringOp::Cmps => {
            let si = index(cpu, a32, REG_ESI);
            let di = index(cpu, a32, REG_EDI);
            let src = read_elem(cpu, src_seg, si, size)?;
            let dst = read_elem(cpu, SegReg::ES, di, size)?;
            compare_elem(cpu, size, src, dst);
            step_index(cpu, a32, REG_ESI, elem);
            step_index(cpu, a32, REG_EDI, elem);
        }
        StringOp::Scas => {
            let di = index(cpu, a32, REG_EDI);
            let dst = read_elem(cpu, SegReg::ES, di, size)?;
            let acc = accumulator(cpu, size);
            compare_elem(cpu, size, acc, dst);
            step_index(cpu, a32, REG_EDI, elem);
        }
        StringOp::Lods => {
            let si = index(cpu, a32, REG_ESI);
            let v = read_elem(cpu, src_seg, si, size)?;
            set_accumulator(cpu, size, v);
            step_index(cpu, a32, REG_ESI, elem);
        }
        StringOp::Stos => {
            let di = index(cpu, a32, REG_EDI);
            let acc = accumulator(cpu, size);
            write_elem(cpu, SegReg::ES, di, size, acc)?;
            step_index(cpu, a32, REG_EDI, elem);
        }
        StringOp::Ins => {
            let port = cpu.read_reg16(REG_EDX);
            cpu.check_io_permission(port, size)?;
            let di = index(cpu, a32, REG_EDI);
            let v = env.io.io_read(port, size);
            write_elem(cpu, SegReg::ES, di, size, v)?;
            step_index(cpu, a32, REG_EDI, elem);
        }
        StringOp::Outs => {
            let port = cpu.read_reg16(REG_EDX);
            cpu.check_io_permission(port, size)?;
            let si = index(cpu, a32, REG_ESI);
            let v = read_elem(cpu, src_seg, si, size)?;
            env.io.io_write(port, size, v);
            step_index(cpu, a32, REG_ESI, elem);
        }
    }
    Ok(())
}

fn run(
    cpu: &mut Cpu,
    env: &mut Env<'_>,
    insn: &Instruction,
    op: StringOp,
    size: OpSize,
) -> Result<(), Exception> {
    let mode = rep_mode(op, insn.rep);
    if mode == RepMode::None {
        return step(cpu, env, insn, op, size);
    }

    let a32 = insn.a32;
    while count(cpu, a32) != 0 {
        step(cpu, env, insn, op, size)?;
        let remaining = count(cpu, a32).wrapping_sub(1);
        set_count(cpu, a32, remaining);

        match mode {
            RepMode::WhileEqual if !cpu.get_zf() => break,
            RepMode::WhileNotEqual if cpu.get_zf() => break,
            _ => {}
        }

        // Pending IRQ: park EIP back on the prefix so IRET resumes the loop.
        if count(cpu, a32) != 0 && cpu.get_if() && env.irq.has_pending_irq() {
            cpu.rewind_to_instruction_start();
            break;
        }
    }
    Ok(())
}

fn element_size(insn: &Instruction, byte_op: bool) -> OpSize {
    if byte_op {
        OpSize::Byte
    } else {
        insn.osize()
    }
}

macro_rules! string_handlers {
    ($byte:ident, $wide:ident, $op:expr) => {
        pub(crate) fn $byte(
            cpu: &mut Cpu,
            env: &mut Env<'_>,
            insn: &Instruction,
        ) -> Result<(), Exception> {
            run(cpu, env, insn, $op, element_size(insn, true))
        }

        pub(crate) fn $wide(
            cpu: &mut Cpu,
            env: &mut Env<'_>,
            insn: &Instruction,
        ) -> Result<(), Exception> {
            run(cpu, env, insn, $op, element_size(insn, false))
        }
    };
}

string_handlers!(movsb, movsw, StringOp::Movs);
string_handlers!(cmpsb, cmpsw, StringOp::Cmps);
string_handlers!(scasb, scasw, StringOp::Scas);
string_handlers!(lodsb, lodsw, StringOp::Lods);
string_handlers!(stosb, stosw, StringOp::Stos);
string_handlers!(insb, insw, StringOp::Ins);
string_handlers!(outsb, outsw, StringOp::Outs);
