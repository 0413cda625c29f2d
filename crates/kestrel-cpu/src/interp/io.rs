//! IN/OUT and the I/O permission machinery.

use crate::cpu::{Cpu, Env};
use crate::decode::Instruction;
use crate::exception::Exception;
use crate::state::{OpSize, REG_EDX};

impl Cpu {
    /// IOPL gate plus the TSS I/O permission bitmap.
    ///
    /// CPL ≤ IOPL passes outright (outside V86). Otherwise every port in
    /// `port..port + size` must have a clear bit in the current TSS's IOPM;
    /// a missing or truncated map denies everything.
    pub(crate) fn check_io_permission(&mut self, port: u16, size: OpSize) -> Result<(), Exception> {
        if !self.protected_mode() {
            return Ok(());
        }
        if !self.v86_mode() && self.cpl() <= self.iopl() {
            return Ok(());
        }

        if !self.tr.is_32bit {
            // A 286 TSS has no I/O permission map.
            return Err(Exception::gp0());
        }
        let iomap_base = self.read_linear_u16(self.tr.base.wrapping_add(0x66))?;
        if u32::from(iomap_base) > self.tr.limit {
            return Err(Exception::gp0());
        }
        for p in u32::from(port)..u32::from(port) + size.bytes() {
            let byte_offset = u32::from(iomap_base) + p / 8;
            if byte_offset > self.tr.limit {
                return Err(Exception::gp0());
            }
            let bits = self.read_linear_u8(self.tr.base.wrapping_add(byte_offset))?;
            if bits & (1 << (p % 8)) != 0 {
                return Err(Exception::gp0());
            }
        }
        Ok(())
    }
}

fn in_port(cpu: &mut Cpu, env: &mut Env<'_>, port: u16, size: OpSize) -> Result<(), Exception> {
    cpu.check_io_permission(port, size)?;
    let value = env.io.io_read(port, size);
    match size {
        OpSize::Byte => cpu.set_al(value as u8),
        OpSize::Word => cpu.set_ax(value as u16),
        OpSize::Dword => cpu.set_eax(value),
    }
    Ok(())
}

fn out_port(cpu: &mut Cpu, env: &mut Env<'_>, port: u16, size: OpSize) -> Result<(), Exception> {
    cpu.check_io_permission(port, size)?;
    let value = match size {
        OpSize::Byte => u32::from(cpu.al()),
        OpSize::Word => u32::from(cpu.ax()),
        OpSize::Dword => cpu.eax(),
    };
    env.io.io_write(port, size, value);
    Ok(())
}

pub(crate) fn in_al_imm8(cpu: &mut Cpu, env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    in_port(cpu, env, insn.imm as u16, OpSize::Byte)
}

pub(crate) fn in_eax_imm8(cpu: &mut Cpu, env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    in_port(cpu, env, insn.imm as u16, insn.osize())
}

pub(crate) fn in_al_dx(cpu: &mut Cpu, env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    let port = cpu.read_reg16(REG_EDX);
    in_port(cpu, env, port, OpSize::Byte)
}

pub(crate) fn in_eax_dx(cpu: &mut Cpu, env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let port = cpu.read_reg16(REG_EDX);
    in_port(cpu, env, port, insn.osize())
}

pub(crate) fn out_imm8_al(cpu: &mut Cpu, env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    out_port(cpu, env, insn.imm as u16, OpSize::Byte)
}

pub(crate) fn out_imm8_eax(cpu: &mut Cpu, env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    out_port(cpu, env, insn.imm as u16, insn.osize())
}

pub(crate) fn out_dx_al(cpu: &mut Cpu, env: &mut Env<'_>, _insn: &Instruction) -> Result<(), Exception> {
    let port = cpu.read_reg16(REG_EDX);
    out_port(cpu, env, port, OpSize::Byte)
}

pub(crate) fn out_dx_eax(cpu: &mut Cpu, env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let port = cpu.read_reg16(REG_EDX);
    out_port(cpu, env, port, insn.osize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{Cpu, CpuConfig};
    use crate::state::{SystemSegmentReg, CR0_PE};

    const TSS_BASE: u32 = 0x2000;
    const IOMAP_OFFSET: u16 = 0x80;

    /// CPL 3, IOPL 0, a 386 TSS whose IOPM allows port 0x60 and denies
    /// port 0x61.
    fn user_cpu_with_iomap() -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::default()).unwrap();
        cpu.cr0 |= CR0_PE;
        cpu.cpl = 3;
        cpu.set_iopl(0);

        cpu.bus_mut()
            .load(TSS_BASE + 0x66, &IOMAP_OFFSET.to_le_bytes());
        // Bitmap byte covering ports 0x60..0x67: only bit 1 (port 0x61) set.
        cpu.bus_mut()
            .load(TSS_BASE + u32::from(IOMAP_OFFSET) + 0x60 / 8, &[0b0000_0010]);
        cpu.tr = SystemSegmentReg {
            selector: 0x30,
            base: TSS_BASE,
            limit: u32::from(IOMAP_OFFSET) + 0x2000 / 8,
            is_32bit: true,
        };
        cpu
    }

    #[test]
    fn iopl_gate_passes_privileged_code() {
        let mut cpu = Cpu::new(CpuConfig::default()).unwrap();
        cpu.cr0 |= CR0_PE;
        cpu.set_iopl(0);
        assert!(cpu.check_io_permission(0x3F8, OpSize::Byte).is_ok());
    }

    #[test]
    fn iomap_bit_gates_user_io() {
        let mut cpu = user_cpu_with_iomap();
        assert!(cpu.check_io_permission(0x60, OpSize::Byte).is_ok());
        assert_eq!(
            cpu.check_io_permission(0x61, OpSize::Byte).unwrap_err(),
            Exception::gp0()
        );
        // A word access spanning an allowed and a denied port is denied.
        assert_eq!(
            cpu.check_io_permission(0x60, OpSize::Word).unwrap_err(),
            Exception::gp0()
        );
    }

    #[test]
    fn truncated_iomap_denies_everything() {
        let mut cpu = user_cpu_with_iomap();
        cpu.tr.limit = u32::from(IOMAP_OFFSET) - 1;
        assert_eq!(
            cpu.check_io_permission(0x60, OpSize::Byte).unwrap_err(),
            Exception::gp0()
        );
    }

    #[test]
    fn a_16bit_tss_has_no_iomap() {
        let mut cpu = user_cpu_with_iomap();
        cpu.tr.is_32bit = false;
        assert_eq!(
            cpu.check_io_permission(0x60, OpSize::Byte).unwrap_err(),
            Exception::gp0()
        );
    }
}
