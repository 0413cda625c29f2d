//! Flag toggles, the identification opcodes, HLT and friends.

use tracing::{debug, warn};

use crate::cpu::{Cpu, Env};
use crate::decode::Instruction;
use crate::exception::Exception;
use crate::state::{RunState, CR4_TSD, FLAG_DF, FLAG_IF};

pub(crate) fn nop(_cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    Ok(())
}

pub(crate) fn hlt(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    if cpu.protected_mode() && cpu.cpl() != 0 {
        return Err(Exception::gp0());
    }
    if !cpu.get_if() {
        debug!(target: "kestrel_cpu", "halted with IF=0; only reset or an NMI-class event resumes");
    }
    cpu.set_run_state(RunState::Halted);
    Ok(())
}

pub(crate) fn cmc(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    let cf = cpu.get_cf();
    cpu.set_cf(!cf);
    Ok(())
}

pub(crate) fn clc(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    cpu.set_cf(false);
    Ok(())
}

pub(crate) fn stc(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    cpu.set_cf(true);
    Ok(())
}

pub(crate) fn cld(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    cpu.set_flag(FLAG_DF, false);
    Ok(())
}

pub(crate) fn std(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    cpu.set_flag(FLAG_DF, true);
    Ok(())
}

fn check_interrupt_flag_privilege(cpu: &mut Cpu) -> Result<(), Exception> {
    if cpu.protected_mode() && cpu.cpl() > cpu.iopl() {
        return Err(Exception::gp0());
    }
    Ok(())
}

pub(crate) fn cli(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    check_interrupt_flag_privilege(cpu)?;
    cpu.set_flag(FLAG_IF, false);
    Ok(())
}

pub(crate) fn sti(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    check_interrupt_flag_privilege(cpu)?;
    if !cpu.get_if() {
        // The instruction after STI runs before any IRQ is taken.
        cpu.make_next_instruction_uninterruptible();
    }
    cpu.set_flag(FLAG_IF, true);
    Ok(())
}

pub(crate) fn lahf(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    let flags = cpu.get_flags16() as u8;
    cpu.write_reg8(4, flags); // AH
    Ok(())
}

pub(crate) fn sahf(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    let ah = cpu.read_reg8(4);
    let keep = cpu.get_flags16() & 0xFF00;
    cpu.set_flags16(keep | u16::from(ah));
    Ok(())
}

/// Undocumented but present since the 8086: AL = CF ? 0xFF : 0x00.
pub(crate) fn salc(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    let v = if cpu.get_cf() { 0xFF } else { 0x00 };
    cpu.set_al(v);
    Ok(())
}

// --- Identification ---------------------------------------------------------

const VENDOR_EBX: u32 = u32::from_le_bytes(*b"Kest");
const VENDOR_EDX: u32 = u32::from_le_bytes(*b"relV");
const VENDOR_ECX: u32 = u32::from_le_bytes(*b"M386");
const BRAND: &str = "Kestrel 386 virtual processor";

fn brand_regs(leaf_index: usize) -> [u32; 4] {
    let mut bytes = [0u8; 48];
    bytes[..BRAND.len()].copy_from_slice(BRAND.as_bytes());
    let mut regs = [0u32; 4];
    for (i, reg) in regs.iter_mut().enumerate() {
        let offset = leaf_index * 16 + i * 4;
        *reg = u32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("4-byte chunk"));
    }
    regs
}

pub(crate) fn cpuid(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    let leaf = cpu.eax();
    let [eax, ebx, ecx, edx] = match leaf {
        0 => [1, VENDOR_EBX, VENDOR_ECX, VENDOR_EDX],
        1 => {
            // Stepping 0, model 1, family 3; TSC and CMOV reported.
            [0x0000_0310, 0, 0, (1 << 4) | (1 << 15)]
        }
        0x8000_0000 => [0x8000_0004, 0, 0, 0],
        0x8000_0002 => brand_regs(0),
        0x8000_0003 => brand_regs(1),
        0x8000_0004 => brand_regs(2),
        _ => [0, 0, 0, 0],
    };
    cpu.set_eax(eax);
    cpu.write_reg32(crate::state::REG_EBX, ebx);
    cpu.write_reg32(crate::state::REG_ECX, ecx);
    cpu.set_edx(edx);
    Ok(())
}

pub(crate) fn rdtsc(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    if cpu.control_register(4).unwrap_or(0) & CR4_TSD != 0
        && cpu.protected_mode()
        && cpu.cpl() != 0
    {
        return Err(Exception::gp0());
    }
    let ticks = cpu.retired_instructions();
    cpu.set_eax(ticks as u32);
    cpu.set_edx((ticks >> 32) as u32);
    Ok(())
}

/// 0xF1: autotest shutdown. Outside autotest configurations it is an
/// ordinary invalid opcode.
pub(crate) fn vkill(cpu: &mut Cpu, _env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    if !cpu.is_for_autotest() {
        return Err(Exception::InvalidOpcode);
    }
    warn!(target: "kestrel_cpu", "VKILL: autotest shutdown requested");
    cpu.set_run_state(RunState::Dead { exit_code: 0 });
    Ok(())
}

