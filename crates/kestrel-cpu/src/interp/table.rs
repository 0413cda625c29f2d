//! The two opcode tables, built once on first use.
//!
//! Prefix bytes never reach these tables (the decoder absorbs them), so
//! their slots stay invalid. FPU escapes D8-DF are deliberately invalid:
//! there is no x87 here and vector 6 is the documented outcome.

use std::sync::OnceLock;

use crate::decode::Imm;
use crate::interp::{alu, bcd, bits, branch, io, misc, mov, stack, string, system, Handler};

#[derive(Clone, Copy)]
pub(crate) struct Entry {
    pub handler: Handler,
    pub modrm: bool,
    pub imm: Imm,
}

#[derive(Clone, Copy)]
pub(crate) enum Slot {
    Invalid,
    Plain(Entry),
    /// Group opcode: ModR/M.reg selects the sub-entry.
    Group([Option<Entry>; 8]),
}

pub(crate) struct OpcodeTables {
    pub primary: [Slot; 256],
    pub extended: [Slot; 256],
}

pub(crate) fn tables() -> &'static OpcodeTables {
    static TABLES: OnceLock<OpcodeTables> = OnceLock::new();
    TABLES.get_or_init(build)
}

fn op(handler: Handler) -> Slot {
    Slot::Plain(Entry {
        handler,
        modrm: false,
        imm: Imm::None,
    })
}

fn op_imm(handler: Handler, imm: Imm) -> Slot {
    Slot::Plain(Entry {
        handler,
        modrm: false,
        imm,
    })
}

fn op_rm(handler: Handler) -> Slot {
    Slot::Plain(Entry {
        handler,
        modrm: true,
        imm: Imm::None,
    })
}

fn op_rm_imm(handler: Handler, imm: Imm) -> Slot {
    Slot::Plain(Entry {
        handler,
        modrm: true,
        imm,
    })
}

fn sub(handler: Handler) -> Option<Entry> {
    Some(Entry {
        handler,
        modrm: true,
        imm: Imm::None,
    })
}

fn sub_imm(handler: Handler, imm: Imm) -> Option<Entry> {
    Some(Entry {
        handler,
        modrm: true,
        imm,
    })
}

/// The six-form layout shared by the classic ALU families.
#[allow(clippy::too_many_arguments)]
fn alu_block(
    table: &mut [Slot; 256],
    base: usize,
    rm8_r8: Handler,
    rm_r: Handler,
    r8_rm8: Handler,
    r_rm: Handler,
    al_imm: Handler,
    eax_imm: Handler,
) {
    table[base] = op_rm(rm8_r8);
    table[base + 1] = op_rm(rm_r);
    table[base + 2] = op_rm(r8_rm8);
    table[base + 3] = op_rm(r_rm);
    table[base + 4] = op_imm(al_imm, Imm::Byte);
    table[base + 5] = op_imm(eax_imm, Imm::OSize);
}

fn build() -> OpcodeTables {
    let mut p: [Slot; 256] = [Slot::Invalid; 256];

    alu_block(
        &mut p,
        0x00,
        alu::add_rm8_r8,
        alu::add_rm_r,
        alu::add_r8_rm8,
        alu::add_r_rm,
        alu::add_al_imm,
        alu::add_eax_imm,
    );
    alu_block(
        &mut p,
        0x08,
        alu::or_rm8_r8,
        alu::or_rm_r,
        alu::or_r8_rm8,
        alu::or_r_rm,
        alu::or_al_imm,
        alu::or_eax_imm,
    );
    alu_block(
        &mut p,
        0x10,
        alu::adc_rm8_r8,
        alu::adc_rm_r,
        alu::adc_r8_rm8,
        alu::adc_r_rm,
        alu::adc_al_imm,
        alu::adc_eax_imm,
    );
    alu_block(
        &mut p,
        0x18,
        alu::sbb_rm8_r8,
        alu::sbb_rm_r,
        alu::sbb_r8_rm8,
        alu::sbb_r_rm,
        alu::sbb_al_imm,
        alu::sbb_eax_imm,
    );
    alu_block(
        &mut p,
        0x20,
        alu::and_rm8_r8,
        alu::and_rm_r,
        alu::and_r8_rm8,
        alu::and_r_rm,
        alu::and_al_imm,
        alu::and_eax_imm,
    );
    alu_block(
        &mut p,
        0x28,
        alu::sub_rm8_r8,
        alu::sub_rm_r,
        alu::sub_r8_rm8,
        alu::sub_r_rm,
        alu::sub_al_imm,
        alu::sub_eax_imm,
    );
    alu_block(
        &mut p,
        0x30,
        alu::xor_rm8_r8,
        alu::xor_rm_r,
        alu::xor_r8_rm8,
        alu::xor_r_rm,
        alu::xor_al_imm,
        alu::xor_eax_imm,
    );
    alu_block(
        &mut p,
        0x38,
        alu::cmp_rm8_r8,
        alu::cmp_rm_r,
        alu::cmp_r8_rm8,
        alu::cmp_r_rm,
        alu::cmp_al_imm,
        alu::cmp_eax_imm,
    );

    p[0x06] = op(stack::push_sreg);
    p[0x07] = op(stack::pop_sreg);
    p[0x0E] = op(stack::push_sreg);
    p[0x16] = op(stack::push_sreg);
    p[0x17] = op(stack::pop_sreg);
    p[0x1E] = op(stack::push_sreg);
    p[0x1F] = op(stack::pop_sreg);

    p[0x27] = op(bcd::daa);
    p[0x2F] = op(bcd::das);
    p[0x37] = op(bcd::aaa);
    p[0x3F] = op(bcd::aas);

    for opcode in 0x40..=0x47 {
        p[opcode] = op(alu::inc_reg);
    }
    for opcode in 0x48..=0x4F {
        p[opcode] = op(alu::dec_reg);
    }
    for opcode in 0x50..=0x57 {
        p[opcode] = op(stack::push_reg);
    }
    for opcode in 0x58..=0x5F {
        p[opcode] = op(stack::pop_reg);
    }

    p[0x60] = op(stack::pusha);
    p[0x61] = op(stack::popa);
    p[0x62] = op_rm(alu::bound);
    p[0x63] = op_rm(system::arpl);
    p[0x68] = op_imm(stack::push_imm, Imm::OSize);
    p[0x69] = op_rm_imm(alu::imul_r_rm_imm, Imm::OSize);
    p[0x6A] = op_imm(stack::push_imm, Imm::ByteSigned);
    p[0x6B] = op_rm_imm(alu::imul_r_rm_imm, Imm::ByteSigned);
    p[0x6C] = op(string::insb);
    p[0x6D] = op(string::insw);
    p[0x6E] = op(string::outsb);
    p[0x6F] = op(string::outsw);

    for opcode in 0x70..=0x7F {
        p[opcode] = op_imm(branch::jcc_rel, Imm::ByteSigned);
    }

    let group1_8 = Slot::Group([
        sub_imm(alu::add_rm8_imm, Imm::Byte),
        sub_imm(alu::or_rm8_imm, Imm::Byte),
        sub_imm(alu::adc_rm8_imm, Imm::Byte),
        sub_imm(alu::sbb_rm8_imm, Imm::Byte),
        sub_imm(alu::and_rm8_imm, Imm::Byte),
        sub_imm(alu::sub_rm8_imm, Imm::Byte),
        sub_imm(alu::xor_rm8_imm, Imm::Byte),
        sub_imm(alu::cmp_rm8_imm, Imm::Byte),
    ]);
    p[0x80] = group1_8;
    // 0x82 is the historical alias of 0x80.
    p[0x82] = group1_8;
    p[0x81] = Slot::Group([
        sub_imm(alu::add_rm_imm, Imm::OSize),
        sub_imm(alu::or_rm_imm, Imm::OSize),
        sub_imm(alu::adc_rm_imm, Imm::OSize),
        sub_imm(alu::sbb_rm_imm, Imm::OSize),
        sub_imm(alu::and_rm_imm, Imm::OSize),
        sub_imm(alu::sub_rm_imm, Imm::OSize),
        sub_imm(alu::xor_rm_imm, Imm::OSize),
        sub_imm(alu::cmp_rm_imm, Imm::OSize),
    ]);
    p[0x83] = Slot::Group([
        sub_imm(alu::add_rm_imm, Imm::ByteSigned),
        sub_imm(alu::or_rm_imm, Imm::ByteSigned),
        sub_imm(alu::adc_rm_imm, Imm::ByteSigned),
        sub_imm(alu::sbb_rm_imm, Imm::ByteSigned),
        sub_imm(alu::and_rm_imm, Imm::ByteSigned),
        sub_imm(alu::sub_rm_imm, Imm::ByteSigned),
        sub_imm(alu::xor_rm_imm, Imm::ByteSigned),
        sub_imm(alu::cmp_rm_imm, Imm::ByteSigned),
    ]);

    p[0x84] = op_rm(alu::test_rm8_r8);
    p[0x85] = op_rm(alu::test_rm_r);
    p[0x86] = op_rm(mov::xchg_rm8_r8);
    p[0x87] = op_rm(mov::xchg_rm_r);
    p[0x88] = op_rm(mov::mov_rm8_r8);
    p[0x89] = op_rm(mov::mov_rm_r);
    p[0x8A] = op_rm(mov::mov_r8_rm8);
    p[0x8B] = op_rm(mov::mov_r_rm);
    p[0x8C] = op_rm(mov::mov_rm_sreg);
    p[0x8D] = op_rm(mov::lea);
    p[0x8E] = op_rm(mov::mov_sreg_rm);
    p[0x8F] = Slot::Group([
        sub(stack::pop_rm),
        None,
        None,
        None,
        None,
        None,
        None,
        None,
    ]);

    p[0x90] = op(misc::nop);
    for opcode in 0x91..=0x97 {
        p[opcode] = op(mov::xchg_eax_reg);
    }
    p[0x98] = op(alu::cbw_cwde);
    p[0x99] = op(alu::cwd_cdq);
    p[0x9A] = op_imm(branch::call_far, Imm::FarPointer);
    p[0x9B] = op(misc::nop); // WAIT: no coprocessor to wait for
    p[0x9C] = op(stack::pushf);
    p[0x9D] = op(stack::popf);
    p[0x9E] = op(misc::sahf);
    p[0x9F] = op(misc::lahf);

    p[0xA0] = op_imm(mov::mov_al_moffs, Imm::Moffs);
    p[0xA1] = op_imm(mov::mov_eax_moffs, Imm::Moffs);
    p[0xA2] = op_imm(mov::mov_moffs_al, Imm::Moffs);
    p[0xA3] = op_imm(mov::mov_moffs_eax, Imm::Moffs);
    p[0xA4] = op(string::movsb);
    p[0xA5] = op(string::movsw);
    p[0xA6] = op(string::cmpsb);
    p[0xA7] = op(string::cmpsw);
    p[0xA8] = op_imm(alu::test_al_imm, Imm::Byte);
    p[0xA9] = op_imm(alu::test_eax_imm, Imm::OSize);
    p[0xAA] = op(string::stosb);
    p[0xAB] = op(string::stosw);
    p[0xAC] = op(string::lodsb);
    p[0xAD] = op(string::lodsw);
    p[0xAE] = op(string::scasb);
    p[0xAF] = op(string::scasw);

    for opcode in 0xB0..=0xB7 {
        p[opcode] = op_imm(mov::mov_reg8_imm, Imm::Byte);
    }
    for opcode in 0xB8..=0xBF {
        p[opcode] = op_imm(mov::mov_reg_imm, Imm::OSize);
    }

    p[0xC0] = op_rm_imm(bits::shift_rm8, Imm::Byte);
    p[0xC1] = op_rm_imm(bits::shift_rm, Imm::Byte);
    p[0xC2] = op_imm(branch::ret_near_imm, Imm::Word);
    p[0xC3] = op(branch::ret_near);
    p[0xC4] = op_rm(mov::les);
    p[0xC5] = op_rm(mov::lds);
    p[0xC6] = Slot::Group([
        sub_imm(mov::mov_rm8_imm, Imm::Byte),
        None,
        None,
        None,
        None,
        None,
        None,
        None,
    ]);
    p[0xC7] = Slot::Group([
        sub_imm(mov::mov_rm_imm, Imm::OSize),
        None,
        None,
        None,
        None,
        None,
        None,
        None,
    ]);
    p[0xC8] = op_imm(stack::enter, Imm::EnterFrame);
    p[0xC9] = op(stack::leave);
    p[0xCA] = op_imm(branch::retf_imm, Imm::Word);
    p[0xCB] = op(branch::retf);
    p[0xCC] = op(branch::int3);
    p[0xCD] = op_imm(branch::int_imm8, Imm::Byte);
    p[0xCE] = op(branch::into);
    p[0xCF] = op(branch::iret);

    p[0xD0] = op_rm(bits::shift_rm8);
    p[0xD1] = op_rm(bits::shift_rm);
    p[0xD2] = op_rm(bits::shift_rm8);
    p[0xD3] = op_rm(bits::shift_rm);
    p[0xD4] = op_imm(bcd::aam, Imm::Byte);
    p[0xD5] = op_imm(bcd::aad, Imm::Byte);
    p[0xD6] = op(misc::salc);
    p[0xD7] = op(mov::xlat);

    p[0xE0] = op_imm(branch::loopne_rel, Imm::ByteSigned);
    p[0xE1] = op_imm(branch::loope_rel, Imm::ByteSigned);
    p[0xE2] = op_imm(branch::loop_rel, Imm::ByteSigned);
    p[0xE3] = op_imm(branch::jcxz_rel, Imm::ByteSigned);
    p[0xE4] = op_imm(io::in_al_imm8, Imm::Byte);
    p[0xE5] = op_imm(io::in_eax_imm8, Imm::Byte);
    p[0xE6] = op_imm(io::out_imm8_al, Imm::Byte);
    p[0xE7] = op_imm(io::out_imm8_eax, Imm::Byte);
    p[0xE8] = op_imm(branch::call_rel, Imm::OSize);
    p[0xE9] = op_imm(branch::jmp_rel, Imm::OSize);
    p[0xEA] = op_imm(branch::jmp_far, Imm::FarPointer);
    p[0xEB] = op_imm(branch::jmp_rel, Imm::ByteSigned);
    p[0xEC] = op(io::in_al_dx);
    p[0xED] = op(io::in_eax_dx);
    p[0xEE] = op(io::out_dx_al);
    p[0xEF] = op(io::out_dx_eax);

    p[0xF1] = op(misc::vkill);
    p[0xF4] = op(misc::hlt);
    p[0xF5] = op(misc::cmc);
    p[0xF6] = Slot::Group([
        sub_imm(alu::test_rm8_imm, Imm::Byte),
        sub_imm(alu::test_rm8_imm, Imm::Byte),
        sub(alu::not_rm8),
        sub(alu::neg_rm8),
        sub(alu::mul_rm8),
        sub(alu::imul_rm8),
        sub(alu::div_rm8),
        sub(alu::idiv_rm8),
    ]);
    p[0xF7] = Slot::Group([
        sub_imm(alu::test_rm_imm, Imm::OSize),
        sub_imm(alu::test_rm_imm, Imm::OSize),
        sub(alu::not_rm),
        sub(alu::neg_rm),
        sub(alu::mul_rm),
        sub(alu::imul_rm),
        sub(alu::div_rm),
        sub(alu::idiv_rm),
    ]);
    p[0xF8] = op(misc::clc);
    p[0xF9] = op(misc::stc);
    p[0xFA] = op(misc::cli);
    p[0xFB] = op(misc::sti);
    p[0xFC] = op(misc::cld);
    p[0xFD] = op(misc::std);
    p[0xFE] = Slot::Group([
        sub(alu::inc_rm8),
        sub(alu::dec_rm8),
        None,
        None,
        None,
        None,
        None,
        None,
    ]);
    p[0xFF] = Slot::Group([
        sub(alu::inc_rm),
        sub(alu::dec_rm),
        sub(branch::call_rm),
        sub(branch::call_far_rm),
        sub(branch::jmp_rm),
        sub(branch::jmp_far_rm),
        sub(stack::push_rm),
        None,
    ]);

    let mut x: [Slot; 256] = [Slot::Invalid; 256];

    x[0x00] = Slot::Group([
        sub(system::sldt),
        sub(system::str_),
        sub(system::lldt),
        sub(system::ltr),
        sub(system::verr),
        sub(system::verw),
        None,
        None,
    ]);
    x[0x01] = Slot::Group([
        sub(system::sgdt),
        sub(system::sidt),
        sub(system::lgdt),
        sub(system::lidt),
        sub(system::smsw),
        None,
        sub(system::lmsw),
        sub(system::invlpg),
    ]);
    x[0x02] = op_rm(system::lar);
    x[0x03] = op_rm(system::lsl);
    x[0x06] = op(system::clts);
    x[0x08] = op(system::wbinvd); // INVD: same privilege check, same non-cache
    x[0x09] = op(system::wbinvd);

    x[0x20] = op_rm(system::mov_r32_cr);
    x[0x21] = op_rm(system::mov_r32_dr);
    x[0x22] = op_rm(system::mov_cr_r32);
    x[0x23] = op_rm(system::mov_dr_r32);

    x[0x31] = op(misc::rdtsc);

    for opcode in 0x40..=0x4F {
        x[opcode] = op_rm(mov::cmovcc);
    }

    for opcode in 0x80..=0x8F {
        x[opcode] = op_imm(branch::jcc_rel, Imm::OSize);
    }
    for opcode in 0x90..=0x9F {
        x[opcode] = op_rm(bits::setcc);
    }

    x[0xA0] = op(stack::push_sreg);
    x[0xA1] = op(stack::pop_sreg);
    x[0xA2] = op(misc::cpuid);
    x[0xA3] = op_rm(bits::bt_rm_r);
    x[0xA4] = op_rm_imm(bits::shld_imm, Imm::Byte);
    x[0xA5] = op_rm(bits::shld_cl);
    x[0xA8] = op(stack::push_sreg);
    x[0xA9] = op(stack::pop_sreg);
    x[0xAB] = op_rm(bits::bts_rm_r);
    x[0xAC] = op_rm_imm(bits::shrd_imm, Imm::Byte);
    x[0xAD] = op_rm(bits::shrd_cl);
    x[0xAF] = op_rm(alu::imul_r_rm);

    x[0xB2] = op_rm(mov::lss);
    x[0xB3] = op_rm(bits::btr_rm_r);
    x[0xB4] = op_rm(mov::lfs);
    x[0xB5] = op_rm(mov::lgs);
    x[0xB6] = op_rm(mov::movzx_r_rm8);
    x[0xB7] = op_rm(mov::movzx_r_rm16);
    x[0xBA] = op_rm_imm(bits::bt_group_imm, Imm::Byte);
    x[0xBB] = op_rm(bits::btc_rm_r);
    x[0xBC] = op_rm(bits::bsf);
    x[0xBD] = op_rm(bits::bsr);
    x[0xBE] = op_rm(mov::movsx_r_rm8);
    x[0xBF] = op_rm(mov::movsx_r_rm16);

    OpcodeTables {
        primary: p,
        extended: x,
    }
}
