//! End-to-end real-mode scenarios driven through the public API.

use pretty_assertions::assert_eq;

use kestrel_cpu::{
    Cpu, CpuConfig, Env, LogicalAddress, NoIrq, OpenBusIo, SegReg, FLAG_AF, FLAG_CF, FLAG_OF,
    FLAG_SF, FLAG_ZF, REG_EBP, REG_EBX, REG_ECX, REG_EDI, REG_EDX, REG_ESI, REG_ESP,
};

fn boot_cpu(code: &[u8]) -> Cpu {
    let mut cpu = Cpu::new(CpuConfig {
        memory_size: 2 * 1024 * 1024,
        for_autotest: true,
        entry: LogicalAddress::new(0x0000, 0x0500),
    })
    .unwrap();
    cpu.bus_mut().load(0x500, code);
    cpu
}

fn step(cpu: &mut Cpu) {
    let mut io = OpenBusIo;
    let mut irq = NoIrq;
    cpu.step(&mut Env {
        io: &mut io,
        irq: &mut irq,
    });
}

#[test]
fn post_entry_far_jump() {
    // The BIOS stub at F000:FFF0 is `JMP 0000:7C00`.
    let mut cpu = Cpu::new(CpuConfig::default()).unwrap();
    cpu.bus_mut()
        .load(0xF_FFF0, &[0xEA, 0x00, 0x7C, 0x00, 0x00]);

    step(&mut cpu);

    assert_eq!(cpu.segment(SegReg::CS), 0x0000);
    assert_eq!(cpu.eip(), 0x7C00);
}

#[test]
fn push_imm16_grows_stack_down() {
    // PUSH 0xBEEF
    let mut cpu = boot_cpu(&[0x68, 0xEF, 0xBE]);
    cpu.write_segment(SegReg::SS, 0).unwrap();
    cpu.write_reg16(REG_ESP, 0x0100);

    step(&mut cpu);

    assert_eq!(cpu.read_reg16(REG_ESP), 0x00FE);
    assert_eq!(cpu.read_memory16(SegReg::SS, 0x00FE).unwrap(), 0xBEEF);
}

#[test]
fn add_al_one_overflow_flags() {
    // ADD AL, 1 with AL=0x7F
    let mut cpu = boot_cpu(&[0x04, 0x01]);
    cpu.set_al(0x7F);

    step(&mut cpu);

    assert_eq!(cpu.al(), 0x80);
    assert!(cpu.get_flag(FLAG_OF));
    assert!(cpu.get_flag(FLAG_SF));
    assert!(cpu.get_flag(FLAG_AF));
    assert!(!cpu.get_flag(FLAG_ZF));
    assert!(!cpu.get_flag(FLAG_CF));
}

#[test]
fn pusha_popa_round_trip() {
    let mut cpu = boot_cpu(&[0x60, 0x61]); // PUSHA; POPA
    cpu.write_segment(SegReg::SS, 0).unwrap();
    cpu.write_reg16(REG_ESP, 0x400);

    let seed: [(usize, u16); 7] = [
        (0, 0x1111),
        (REG_ECX, 0x2222),
        (REG_EDX, 0x3333),
        (REG_EBX, 0x4444),
        (REG_EBP, 0x6666),
        (REG_ESI, 0x7777),
        (REG_EDI, 0x8888),
    ];
    for (reg, value) in seed {
        cpu.write_reg16(reg, value);
    }

    step(&mut cpu);
    step(&mut cpu);

    for (reg, value) in seed {
        assert_eq!(cpu.read_reg16(reg), value, "register {reg} after POPA");
    }
    assert_eq!(cpu.read_reg16(REG_ESP), 0x400);
}

#[test]
fn far_call_pushes_and_retf_returns() {
    // 0000:0500 CALL 0000:0520 ; target: RETF
    let mut cpu = boot_cpu(&[0x9A, 0x20, 0x05, 0x00, 0x00]);
    cpu.bus_mut().load(0x520, &[0xCB]);
    cpu.write_segment(SegReg::SS, 0).unwrap();
    cpu.write_reg16(REG_ESP, 0x400);

    step(&mut cpu);
    assert_eq!(cpu.eip(), 0x0520);
    assert_eq!(cpu.read_memory16(SegReg::SS, 0x3FE).unwrap(), 0x0000); // old CS
    assert_eq!(cpu.read_memory16(SegReg::SS, 0x3FC).unwrap(), 0x0505); // return IP

    step(&mut cpu);
    assert_eq!(cpu.eip(), 0x0505);
    assert_eq!(cpu.read_reg16(REG_ESP), 0x400);
}

#[test]
fn loop_and_jcxz_drive_cx() {
    // 0500: LOOP 0500 ; runs CX down to zero, then JCXZ takes the branch.
    // 0502: JCXZ 0510
    let mut cpu = boot_cpu(&[0xE2, 0xFE, 0xE3, 0x0C]);
    cpu.write_reg16(REG_ECX, 3);

    step(&mut cpu); // CX=2, branch to 0x500
    assert_eq!(cpu.eip(), 0x0500);
    step(&mut cpu); // CX=1, branch
    step(&mut cpu); // CX=0, fall through
    assert_eq!(cpu.eip(), 0x0502);
    assert_eq!(cpu.read_reg16(REG_ECX), 0);

    step(&mut cpu);
    assert_eq!(cpu.eip(), 0x0510);
}

#[test]
fn xlat_translates_through_table() {
    let mut cpu = boot_cpu(&[0xD7]); // XLAT
    cpu.bus_mut().load(0x600 + 5, &[0x77]);
    cpu.write_reg16(REG_EBX, 0x600);
    cpu.set_al(5);

    step(&mut cpu);
    assert_eq!(cpu.al(), 0x77);
}

#[test]
fn mov_sreg_starts_uninterruptible_window() {
    // MOV SS, AX ; NOP
    let mut cpu = boot_cpu(&[0x8E, 0xD0, 0x90]);
    cpu.set_ax(0x0000);
    assert!(cpu.interrupt_window_open());

    step(&mut cpu);
    assert!(
        !cpu.interrupt_window_open(),
        "the instruction after MOV SS must run before any IRQ"
    );

    step(&mut cpu);
    assert!(cpu.interrupt_window_open());
}

#[test]
fn string_copy_without_rep_moves_one_element() {
    // MOVSB
    let mut cpu = boot_cpu(&[0xA4]);
    cpu.bus_mut().load(0x600, b"x");
    cpu.write_segment(SegReg::ES, 0).unwrap();
    cpu.write_reg16(REG_ESI, 0x600);
    cpu.write_reg16(REG_EDI, 0x700);

    step(&mut cpu);

    assert_eq!(cpu.read_memory8(SegReg::DS, 0x700).unwrap(), b'x');
    assert_eq!(cpu.read_reg16(REG_ESI), 0x601);
    assert_eq!(cpu.read_reg16(REG_EDI), 0x701);
}

#[test]
fn snapshot_restores_mid_program() {
    let mut cpu = boot_cpu(&[0x40, 0x40]); // INC AX; INC AX
    step(&mut cpu);
    let image = cpu.snapshot();
    step(&mut cpu);
    assert_eq!(cpu.ax(), 2);

    cpu.restore(&image);
    assert_eq!(cpu.ax(), 1);
    step(&mut cpu);
    assert_eq!(cpu.ax(), 2);
}
