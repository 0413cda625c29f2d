//! Arithmetic and logic opcode handlers.

use crate::cpu::{Cpu, Env};
use crate::decode::Instruction;
use crate::exception::Exception;
use crate::state::REG_EDX;

/// The six encoding forms shared by ADD/OR/ADC/SBB/AND/SUB/XOR/CMP.
macro_rules! alu_family {
    ($alu:ident: $rm8_r8:ident, $rm_r:ident, $r8_rm8:ident, $r_rm:ident, $al_imm:ident, $eax_imm:ident, $rm8_imm:ident, $rm_imm:ident, writeback = $wb:expr) => {
        pub(crate) fn $rm8_r8(
            cpu: &mut Cpu,
            _env: &mut Env<'_>,
            insn: &Instruction,
        ) -> Result<(), Exception> {
            let a = cpu.read_rm8(insn)?;
            let b = cpu.read_reg8(insn.modrm().reg());
            let r = cpu.$alu(a, b);
            if $wb {
                cpu.write_rm8(insn, r)?;
            }
            Ok(())
        }

        pub(crate) fn $rm_r(
            cpu: &mut Cpu,
            _env: &mut Env<'_>,
            insn: &Instruction,
        ) -> Result<(), Exception> {
            if insn.o32 {
                let a = cpu.read_rm32(insn)?;
                let b = cpu.read_reg32(insn.modrm().reg());
                let r = cpu.$alu(a, b);
                if $wb {
                    cpu.write_rm32(insn, r)?;
                }
            } else {
                let a = cpu.read_rm16(insn)?;
                let b = cpu.read_reg16(insn.modrm().reg());
                let r = cpu.$alu(a, b);
                if $wb {
                    cpu.write_rm16(insn, r)?;
                }
            }
            Ok(())
        }

        pub(crate) fn $r8_rm8(
            cpu: &mut Cpu,
            _env: &mut Env<'_>,
            insn: &Instruction,
        ) -> Result<(), Exception> {
            let a = cpu.read_reg8(insn.modrm().reg());
            let b = cpu.read_rm8(insn)?;
            let r = cpu.$alu(a, b);
            if $wb {
                cpu.write_reg8(insn.modrm().reg(), r);
            }
            Ok(())
        }

        pub(crate) fn $r_rm(
            cpu: &mut Cpu,
            _env: &mut Env<'_>,
            insn: &Instruction,
        ) -> Result<(), Exception> {
            if insn.o32 {
                let a = cpu.read_reg32(insn.modrm().reg());
                let b = cpu.read_rm32(insn)?;
                let r = cpu.$alu(a, b);
                if $wb {
                    cpu.write_reg32(insn.modrm().reg(), r);
                }
            } else {
                let a = cpu.read_reg16(insn.modrm().reg());
                let b = cpu.read_rm16(insn)?;
                let r = cpu.$alu(a, b);
                if $wb {
                    cpu.write_reg16(insn.modrm().reg(), r);
                }
            }
            Ok(())
        }

        pub(crate) fn $al_imm(
            cpu: &mut Cpu,
            _env: &mut Env<'_>,
            insn: &Instruction,
        ) -> Result<(), Exception> {
            let a = cpu.al();
            let r = cpu.$alu(a, insn.imm as u8);
            if $wb {
                cpu.set_al(r);
            }
            Ok(())
        }

        pub(crate) fn $eax_imm(
            cpu: &mut Cpu,
            _env: &mut Env<'_>,
            insn: &Instruction,
        ) -> Result<(), Exception> {
            if insn.o32 {
                let a = cpu.eax();
                let r = cpu.$alu(a, insn.imm);
                if $wb {
                    cpu.set_eax(r);
                }
            } else {
                let a = cpu.ax();
                let r = cpu.$alu(a, insn.imm as u16);
                if $wb {
                    cpu.set_ax(r);
                }
            }
            Ok(())
        }

        pub(crate) fn $rm8_imm(
            cpu: &mut Cpu,
            _env: &mut Env<'_>,
            insn: &Instruction,
        ) -> Result<(), Exception> {
            let a = cpu.read_rm8(insn)?;
            let r = cpu.$alu(a, insn.imm as u8);
            if $wb {
                cpu.write_rm8(insn, r)?;
            }
            Ok(())
        }

        pub(crate) fn $rm_imm(
            cpu: &mut Cpu,
            _env: &mut Env<'_>,
            insn: &Instruction,
        ) -> Result<(), Exception> {
            if insn.o32 {
                let a = cpu.read_rm32(insn)?;
                let r = cpu.$alu(a, insn.imm);
                if $wb {
                    cpu.write_rm32(insn, r)?;
                }
            } else {
                let a = cpu.read_rm16(insn)?;
                let r = cpu.$alu(a, insn.imm as u16);
                if $wb {
                    cpu.write_rm16(insn, r)?;
                }
            }
            Ok(())
        }
    };
}

alu_family!(alu_add: add_rm8_r8, add_rm_r, add_r8_rm8, add_r_rm, add_al_imm, add_eax_imm, add_rm8_imm, add_rm_imm, writeback = true);
alu_family!(alu_or: or_rm8_r8, or_rm_r, or_r8_rm8, or_r_rm, or_al_imm, or_eax_imm, or_rm8_imm, or_rm_imm, writeback = true);
alu_family!(alu_adc: adc_rm8_r8, adc_rm_r, adc_r8_rm8, adc_r_rm, adc_al_imm, adc_eax_imm, adc_rm8_imm, adc_rm_imm, writeback = true);
alu_family!(alu_sbb: sbb_rm8_r8, sbb_rm_r, sbb_r8_rm8, sbb_r_rm, sbb_al_imm, sbb_eax_imm, sbb_rm8_imm, sbb_rm_imm, writeback = true);
alu_family!(alu_and: and_rm8_r8, and_rm_r, and_r8_rm8, and_r_rm, and_al_imm, and_eax_imm, and_rm8_imm, and_rm_imm, writeback = true);
alu_family!(alu_sub: sub_rm8_r8, sub_rm_r, sub_r8_rm8, sub_r_rm, sub_al_imm, sub_eax_imm, sub_rm8_imm, sub_rm_imm, writeback = true);
alu_family!(alu_xor: xor_rm8_r8, xor_rm_r, xor_r8_rm8, xor_r_rm, xor_al_imm, xor_eax_imm, xor_rm8_imm, xor_rm_imm, writeback = true);
alu_family!(alu_sub: cmp_rm8_r8, cmp_rm_r, cmp_r8_rm8, cmp_r_rm, cmp_al_imm, cmp_eax_imm, cmp_rm8_imm, cmp_rm_imm, writeback = false);

// --- TEST ------------------------------------------------------------------

pub(crate) fn test_rm8_r8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let a = cpu.read_rm8(insn)?;
    let b = cpu.read_reg8(insn.modrm().reg());
    cpu.alu_test(a, b);
    Ok(())
}

pub(crate) fn test_rm_r(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let a = cpu.read_rm32(insn)?;
        cpu.alu_test(a, cpu.read_reg32(insn.modrm().reg()));
    } else {
        let a = cpu.read_rm16(insn)?;
        cpu.alu_test(a, cpu.read_reg16(insn.modrm().reg()));
    }
    Ok(())
}

pub(crate) fn test_al_imm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let a = cpu.al();
    cpu.alu_test(a, insn.imm as u8);
    Ok(())
}

pub(crate) fn test_eax_imm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let a = cpu.eax();
        cpu.alu_test(a, insn.imm);
    } else {
        let a = cpu.ax();
        cpu.alu_test(a, insn.imm as u16);
    }
    Ok(())
}

pub(crate) fn test_rm8_imm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let a = cpu.read_rm8(insn)?;
    cpu.alu_test(a, insn.imm as u8);
    Ok(())
}

pub(crate) fn test_rm_imm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let a = cpu.read_rm32(insn)?;
        cpu.alu_test(a, insn.imm);
    } else {
        let a = cpu.read_rm16(insn)?;
        cpu.alu_test(a, insn.imm as u16);
    }
    Ok(())
}

// --- INC / DEC -------------------------------------------------------------

pub(crate) fn inc_reg(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let reg = usize::from(insn.opcode & 7);
    if insn.o32 {
        let r = cpu.alu_inc(cpu.read_reg32(reg));
        cpu.write_reg32(reg, r);
    } else {
        let r = cpu.alu_inc(cpu.read_reg16(reg));
        cpu.write_reg16(reg, r);
    }
    Ok(())
}

pub(crate) fn dec_reg(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let reg = usize::from(insn.opcode & 7);
    if insn.o32 {
        let r = cpu.alu_dec(cpu.read_reg32(reg));
        cpu.write_reg32(reg, r);
    } else {
        let r = cpu.alu_dec(cpu.read_reg16(reg));
        cpu.write_reg16(reg, r);
    }
    Ok(())
}

pub(crate) fn inc_rm8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let a = cpu.read_rm8(insn)?;
    let r = cpu.alu_inc(a);
    cpu.write_rm8(insn, r)
}

pub(crate) fn dec_rm8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let a = cpu.read_rm8(insn)?;
    let r = cpu.alu_dec(a);
    cpu.write_rm8(insn, r)
}

pub(crate) fn inc_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let a = cpu.read_rm32(insn)?;
        let r = cpu.alu_inc(a);
        cpu.write_rm32(insn, r)
    } else {
        let a = cpu.read_rm16(insn)?;
        let r = cpu.alu_inc(a);
        cpu.write_rm16(insn, r)
    }
}

pub(crate) fn dec_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let a = cpu.read_rm32(insn)?;
        let r = cpu.alu_dec(a);
        cpu.write_rm32(insn, r)
    } else {
        let a = cpu.read_rm16(insn)?;
        let r = cpu.alu_dec(a);
        cpu.write_rm16(insn, r)
    }
}

// --- NOT / NEG -------------------------------------------------------------

pub(crate) fn not_rm8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let a = cpu.read_rm8(insn)?;
    cpu.write_rm8(insn, !a)
}

pub(crate) fn not_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let a = cpu.read_rm_osize(insn)?;
    cpu.write_rm_osize(insn, !a & insn.osize().mask())
}

pub(crate) fn neg_rm8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let a = cpu.read_rm8(insn)?;
    let r = cpu.alu_neg(a);
    cpu.write_rm8(insn, r)
}

pub(crate) fn neg_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let a = cpu.read_rm32(insn)?;
        let r = cpu.alu_neg(a);
        cpu.write_rm32(insn, r)
    } else {
        let a = cpu.read_rm16(insn)?;
        let r = cpu.alu_neg(a);
        cpu.write_rm16(insn, r)
    }
}

// --- Multiply / divide ------------------------------------------------------

pub(crate) fn mul_rm8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let src = cpu.read_rm8(insn)?;
    let product = u16::from(cpu.al()) * u16::from(src);
    cpu.set_ax(product);
    let upper = product >> 8 != 0;
    cpu.set_cf(upper);
    cpu.set_of(upper);
    cpu.update_lazy_flags::<u8>(product as u32);
    Ok(())
}

pub(crate) fn mul_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let src = cpu.read_rm32(insn)?;
        let product = u64::from(cpu.eax()) * u64::from(src);
        cpu.set_eax(product as u32);
        cpu.set_edx((product >> 32) as u32);
        let upper = product >> 32 != 0;
        cpu.set_cf(upper);
        cpu.set_of(upper);
        cpu.update_lazy_flags::<u32>(product as u32);
    } else {
        let src = cpu.read_rm16(insn)?;
        let product = u32::from(cpu.ax()) * u32::from(src);
        cpu.set_ax(product as u16);
        cpu.write_reg16(REG_EDX, (product >> 16) as u16);
        let upper = product >> 16 != 0;
        cpu.set_cf(upper);
        cpu.set_of(upper);
        cpu.update_lazy_flags::<u16>(product & 0xFFFF);
    }
    Ok(())
}

pub(crate) fn imul_rm8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let src = cpu.read_rm8(insn)? as i8;
    let product = i16::from(cpu.al() as i8) * i16::from(src);
    cpu.set_ax(product as u16);
    let fits = i16::from(product as i8) == product;
    cpu.set_cf(!fits);
    cpu.set_of(!fits);
    cpu.update_lazy_flags::<u8>(product as u32);
    Ok(())
}

pub(crate) fn imul_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let src = cpu.read_rm32(insn)? as i32;
        let product = i64::from(cpu.eax() as i32) * i64::from(src);
        cpu.set_eax(product as u32);
        cpu.set_edx((product >> 32) as u32);
        let fits = i64::from(product as i32) == product;
        cpu.set_cf(!fits);
        cpu.set_of(!fits);
        cpu.update_lazy_flags::<u32>(product as u32);
    } else {
        let src = cpu.read_rm16(insn)? as i16;
        let product = i32::from(cpu.ax() as i16) * i32::from(src);
        cpu.set_ax(product as u16);
        cpu.write_reg16(REG_EDX, (product >> 16) as u16);
        let fits = i32::from(product as i16) == product;
        cpu.set_cf(!fits);
        cpu.set_of(!fits);
        cpu.update_lazy_flags::<u16>(product as u32 & 0xFFFF);
    }
    Ok(())
}

/// The two- and three-operand IMUL forms (0F AF, 69, 6B).
pub(crate) fn imul_r_rm_imm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let reg = insn.modrm().reg();
    if insn.o32 {
        let a = cpu.read_rm32(insn)?;
        let r = cpu.alu_imul_truncated(a, insn.imm);
        cpu.write_reg32(reg, r);
    } else {
        let a = cpu.read_rm16(insn)?;
        let r = cpu.alu_imul_truncated(a, insn.imm as u16);
        cpu.write_reg16(reg, r);
    }
    Ok(())
}

pub(crate) fn imul_r_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let reg = insn.modrm().reg();
    if insn.o32 {
        let a = cpu.read_reg32(reg);
        let b = cpu.read_rm32(insn)?;
        let r = cpu.alu_imul_truncated(a, b);
        cpu.write_reg32(reg, r);
    } else {
        let a = cpu.read_reg16(reg);
        let b = cpu.read_rm16(insn)?;
        let r = cpu.alu_imul_truncated(a, b);
        cpu.write_reg16(reg, r);
    }
    Ok(())
}

pub(crate) fn div_rm8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let divisor = cpu.read_rm8(insn)?;
    if divisor == 0 {
        return Err(Exception::DivideError);
    }
    let dividend = cpu.ax();
    let quotient = dividend / u16::from(divisor);
    if quotient > 0xFF {
        return Err(Exception::DivideError);
    }
    let remainder = dividend % u16::from(divisor);
    cpu.set_al(quotient as u8);
    cpu.write_reg8(4, remainder as u8); // AH
    Ok(())
}

pub(crate) fn div_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let divisor = cpu.read_rm32(insn)?;
        if divisor == 0 {
            return Err(Exception::DivideError);
        }
        let dividend = (u64::from(cpu.edx()) << 32) | u64::from(cpu.eax());
        let quotient = dividend / u64::from(divisor);
        if quotient > 0xFFFF_FFFF {
            return Err(Exception::DivideError);
        }
        cpu.set_eax(quotient as u32);
        cpu.set_edx((dividend % u64::from(divisor)) as u32);
    } else {
        let divisor = cpu.read_rm16(insn)?;
        if divisor == 0 {
            return Err(Exception::DivideError);
        }
        let dividend = (u32::from(cpu.read_reg16(REG_EDX)) << 16) | u32::from(cpu.ax());
        let quotient = dividend / u32::from(divisor);
        if quotient > 0xFFFF {
            return Err(Exception::DivideError);
        }
        cpu.set_ax(quotient as u16);
        cpu.write_reg16(REG_EDX, (dividend % u32::from(divisor)) as u16);
    }
    Ok(())
}

pub(crate) fn idiv_rm8(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let divisor = cpu.read_rm8(insn)? as i8;
    if divisor == 0 {
        return Err(Exception::DivideError);
    }
    let dividend = cpu.ax() as i16;
    let quotient = dividend / i16::from(divisor);
    if i16::from(quotient as i8) != quotient {
        return Err(Exception::DivideError);
    }
    let remainder = dividend % i16::from(divisor);
    cpu.set_al(quotient as u8);
    cpu.write_reg8(4, remainder as u8); // AH
    Ok(())
}

pub(crate) fn idiv_rm(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let divisor = cpu.read_rm32(insn)? as i32;
        if divisor == 0 {
            return Err(Exception::DivideError);
        }
        let dividend = (i64::from(cpu.edx() as i32) << 32) | i64::from(cpu.eax());
        let quotient = dividend.wrapping_div(i64::from(divisor));
        if i64::from(quotient as i32) != quotient {
            return Err(Exception::DivideError);
        }
        cpu.set_eax(quotient as u32);
        cpu.set_edx(dividend.wrapping_rem(i64::from(divisor)) as u32);
    } else {
        let divisor = cpu.read_rm16(insn)? as i16;
        if divisor == 0 {
            return Err(Exception::DivideError);
        }
        let dividend =
            (i32::from(cpu.read_reg16(REG_EDX) as i16) << 16) | i32::from(cpu.ax());
        let quotient = dividend.wrapping_div(i32::from(divisor));
        if i32::from(quotient as i16) != quotient {
            return Err(Exception::DivideError);
        }
        cpu.set_ax(quotient as u16);
        cpu.write_reg16(REG_EDX, dividend.wrapping_rem(i32::from(divisor)) as u16);
    }
    Ok(())
}

// --- BOUND -----------------------------------------------------------------

pub(crate) fn bound(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    let (seg, ea) = cpu.rm_memory_operand(insn)?;
    let reg = insn.modrm().reg();
    if insn.o32 {
        let index = cpu.read_reg32(reg) as i32;
        let lower = cpu.read_memory32(seg, ea)? as i32;
        let upper = cpu.read_memory32(seg, ea.wrapping_add(4))? as i32;
        if index < lower || index > upper {
            return Err(Exception::BoundRange);
        }
    } else {
        let index = cpu.read_reg16(reg) as i16;
        let lower = cpu.read_memory16(seg, ea)? as i16;
        let upper = cpu.read_memory16(seg, ea.wrapping_add(2))? as i16;
        if index < lower || index > upper {
            return Err(Exception::BoundRange);
        }
    }
    Ok(())
}

// --- Sign/zero widening conversions ----------------------------------------

pub(crate) fn cbw_cwde(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let widened = cpu.ax() as i16 as i32 as u32;
        cpu.set_eax(widened);
    } else {
        let widened = cpu.al() as i8 as i16 as u16;
        cpu.set_ax(widened);
    }
    Ok(())
}

pub(crate) fn cwd_cdq(cpu: &mut Cpu, _env: &mut Env<'_>, insn: &Instruction) -> Result<(), Exception> {
    if insn.o32 {
        let fill = if (cpu.eax() as i32) < 0 { 0xFFFF_FFFF } else { 0 };
        cpu.set_edx(fill);
    } else {
        let fill = if (cpu.ax() as i16) < 0 { 0xFFFF } else { 0 };
        cpu.write_reg16(REG_EDX, fill);
    }
    Ok(())
}
