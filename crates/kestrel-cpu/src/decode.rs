//! Table-driven instruction decoder.
//!
//! Bytes arrive through the execute-access fetch path (so instruction
//! fetches participate in segmentation and paging and can fault). Prefixes
//! are absorbed first, then the opcode selects an entry in one of the two
//! tables built by `interp::table`; the entry says whether a ModR/M byte
//! follows and which immediate shape to pull.

use crate::cpu::Cpu;
use crate::exception::Exception;
use crate::interp::table::{self, Entry, Slot};
use crate::state::{OpSize, SegReg, REG_EBP, REG_ESP};

/// Architectural instruction length limit; a longer prefix run faults.
pub(crate) const MAX_INSTRUCTION_LEN: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepPrefix {
    #[default]
    None,
    /// F3: REP / REPE.
    Rep,
    /// F2: REPNE.
    RepNe,
}

/// Where a ModR/M operand lives.
#[derive(Debug, Clone, Copy)]
pub enum RmLocation {
    Reg(usize),
    Mem { seg: SegReg, ea: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct ModRm {
    pub raw: u8,
    pub location: RmLocation,
}

impl ModRm {
    /// The reg field, also the group extension for group opcodes.
    pub fn reg(&self) -> usize {
        usize::from((self.raw >> 3) & 7)
    }

    pub fn is_register(&self) -> bool {
        matches!(self.location, RmLocation::Reg(_))
    }
}

/// One decoded instruction, ready for its handler.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// `0x00..=0xFF`, or `0x0F00 | byte` for the two-byte map.
    pub opcode: u16,
    pub modrm: Option<ModRm>,
    pub imm: u32,
    /// Secondary immediate: far-pointer selector, ENTER's nesting level.
    pub imm2: u32,
    pub seg_prefix: Option<SegReg>,
    pub rep: RepPrefix,
    pub lock: bool,
    pub o32: bool,
    pub a32: bool,
}

impl Instruction {
    pub fn osize(&self) -> OpSize {
        OpSize::from_o32(self.o32)
    }

    /// The segment string reads and moffs accesses come from: DS unless
    /// overridden.
    pub(crate) fn data_segment(&self) -> SegReg {
        self.seg_prefix.unwrap_or(SegReg::DS)
    }

    pub(crate) fn modrm(&self) -> &ModRm {
        self.modrm.as_ref().expect("opcode table demands a ModR/M")
    }
}

/// Immediate shapes, keyed by the opcode tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Imm {
    None,
    /// imm8, zero-extended.
    Byte,
    /// imm8, sign-extended to the operand size.
    ByteSigned,
    /// imm16 regardless of operand size (RET n, ENTER's frame size).
    Word,
    /// imm16/imm32 per effective operand size.
    OSize,
    /// ptr16:16 / ptr16:32 — offset into `imm`, selector into `imm2`.
    FarPointer,
    /// moffs8/16/32 — address-size-wide offset into `imm`.
    Moffs,
    /// ENTER: imm16 frame size into `imm`, imm8 nesting level into `imm2`.
    EnterFrame,
}

pub(crate) fn decode(cpu: &mut Cpu) -> Result<(Instruction, Entry), Exception> {
    let start_eip = cpu.eip();
    let mut seg_prefix = None;
    let mut rep = RepPrefix::None;
    let mut lock = false;
    let mut o_override = false;
    let mut a_override = false;

    let first = loop {
        if cpu.eip().wrapping_sub(start_eip) >= MAX_INSTRUCTION_LEN {
            return Err(Exception::gp0());
        }
        match cpu.fetch_u8()? {
            0x26 => seg_prefix = Some(SegReg::ES),
            0x2E => seg_prefix = Some(SegReg::CS),
            0x36 => seg_prefix = Some(SegReg::SS),
            0x3E => seg_prefix = Some(SegReg::DS),
            0x64 => seg_prefix = Some(SegReg::FS),
            0x65 => seg_prefix = Some(SegReg::GS),
            0x66 => o_override = true,
            0x67 => a_override = true,
            0xF0 => lock = true,
            0xF2 => rep = RepPrefix::RepNe,
            0xF3 => rep = RepPrefix::Rep,
            byte => break byte,
        }
    };

    let opcode: u16 = if first == 0x0F {
        0x0F00 | u16::from(cpu.fetch_u8()?)
    } else {
        u16::from(first)
    };

    let default_32 = cpu.cs_default_32();
    let o32 = default_32 ^ o_override;
    let a32 = default_32 ^ a_override;

    let tables = table::tables();
    let slot = if opcode < 0x100 {
        &tables.primary[opcode as usize]
    } else {
        &tables.extended[(opcode & 0xFF) as usize]
    };

    let mut insn = Instruction {
        opcode,
        modrm: None,
        imm: 0,
        imm2: 0,
        seg_prefix,
        rep,
        lock,
        o32,
        a32,
    };

    let entry = match slot {
        Slot::Invalid => return Err(Exception::InvalidOpcode),
        Slot::Plain(entry) => {
            if entry.modrm {
                insn.modrm = Some(decode_modrm(cpu, a32, seg_prefix)?);
            }
            *entry
        }
        Slot::Group(entries) => {
            let modrm = decode_modrm(cpu, a32, seg_prefix)?;
            let entry = entries[modrm.reg()].ok_or(Exception::InvalidOpcode)?;
            insn.modrm = Some(modrm);
            entry
        }
    };

    match entry.imm {
        Imm::None => {}
        Imm::Byte => insn.imm = u32::from(cpu.fetch_u8()?),
        Imm::ByteSigned => {
            let raw = cpu.fetch_u8()? as i8 as i32 as u32;
            insn.imm = raw & insn.osize().mask();
        }
        Imm::Word => insn.imm = u32::from(cpu.fetch_u16()?),
        Imm::OSize => {
            insn.imm = if o32 {
                cpu.fetch_u32()?
            } else {
                u32::from(cpu.fetch_u16()?)
            };
        }
        Imm::FarPointer => {
            insn.imm = if o32 {
                cpu.fetch_u32()?
            } else {
                u32::from(cpu.fetch_u16()?)
            };
            insn.imm2 = u32::from(cpu.fetch_u16()?);
        }
        Imm::Moffs => {
            insn.imm = if a32 {
                cpu.fetch_u32()?
            } else {
                u32::from(cpu.fetch_u16()?)
            };
        }
        Imm::EnterFrame => {
            insn.imm = u32::from(cpu.fetch_u16()?);
            insn.imm2 = u32::from(cpu.fetch_u8()?);
        }
    }

    if cpu.eip().wrapping_sub(start_eip) > MAX_INSTRUCTION_LEN {
        return Err(Exception::gp0());
    }

    Ok((insn, entry))
}

fn decode_modrm(
    cpu: &mut Cpu,
    a32: bool,
    seg_prefix: Option<SegReg>,
) -> Result<ModRm, Exception> {
    let raw = cpu.fetch_u8()?;
    let mode = raw >> 6;
    let rm = usize::from(raw & 7);

    if mode == 3 {
        return Ok(ModRm {
            raw,
            location: RmLocation::Reg(rm),
        });
    }

    let (seg, ea) = if a32 {
        decode_ea32(cpu, mode, rm)?
    } else {
        decode_ea16(cpu, mode, rm)?
    };

    Ok(ModRm {
        raw,
        location: RmLocation::Mem {
            seg: seg_prefix.unwrap_or(seg),
            ea,
        },
    })
}

fn decode_ea16(cpu: &mut Cpu, mode: u8, rm: usize) -> Result<(SegReg, u32), Exception> {
    use crate::state::{REG_EBX, REG_EDI, REG_ESI};

    let disp: u16 = match mode {
        0 if rm == 6 => {
            let disp = cpu.fetch_u16()?;
            return Ok((SegReg::DS, u32::from(disp)));
        }
        0 => 0,
        1 => cpu.fetch_u8()? as i8 as i16 as u16,
        _ => cpu.fetch_u16()?,
    };

    let bx = cpu.read_reg16(REG_EBX);
    let bp = cpu.read_reg16(REG_EBP);
    let si = cpu.read_reg16(REG_ESI);
    let di = cpu.read_reg16(REG_EDI);

    let (base, seg) = match rm {
        0 => (bx.wrapping_add(si), SegReg::DS),
        1 => (bx.wrapping_add(di), SegReg::DS),
        2 => (bp.wrapping_add(si), SegReg::SS),
        3 => (bp.wrapping_add(di), SegReg::SS),
        4 => (si, SegReg::DS),
        5 => (di, SegReg::DS),
        6 => (bp, SegReg::SS),
        _ => (bx, SegReg::DS),
    };

    Ok((seg, u32::from(base.wrapping_add(disp))))
}

fn decode_ea32(cpu: &mut Cpu, mode: u8, rm: usize) -> Result<(SegReg, u32), Exception> {
    let (mut ea, seg) = if rm == 4 {
        decode_sib(cpu, mode)?
    } else if rm == 5 && mode == 0 {
        (cpu.fetch_u32()?, SegReg::DS)
    } else {
        let seg = if rm == REG_EBP { SegReg::SS } else { SegReg::DS };
        (cpu.read_reg32(rm), seg)
    };

    match mode {
        1 => ea = ea.wrapping_add(cpu.fetch_u8()? as i8 as i32 as u32),
        2 => ea = ea.wrapping_add(cpu.fetch_u32()?),
        _ => {}
    }

    Ok((seg, ea))
}

fn decode_sib(cpu: &mut Cpu, mode: u8) -> Result<(u32, SegReg), Exception> {
    let sib = cpu.fetch_u8()?;
    let scale = sib >> 6;
    let index = usize::from((sib >> 3) & 7);
    let base = usize::from(sib & 7);

    let index_value = if index == REG_ESP {
        0
    } else {
        cpu.read_reg32(index) << scale
    };

    let (base_value, seg) = if base == REG_EBP && mode == 0 {
        (cpu.fetch_u32()?, SegReg::DS)
    } else {
        let seg = if base == REG_ESP || base == REG_EBP {
            SegReg::SS
        } else {
            SegReg::DS
        };
        (cpu.read_reg32(base), seg)
    };

    Ok((base_value.wrapping_add(index_value), seg))
}
