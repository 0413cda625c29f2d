//! Mode-switch and fault-delivery scenarios.

use pretty_assertions::assert_eq;

use kestrel_cpu::{
    Cpu, CpuConfig, Env, LogicalAddress, NoIrq, OpenBusIo, RunState, SegReg, REG_ESP,
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

fn gdt_entry(base: u32, limit_raw: u32, typ: u8, dpl: u8, db: bool, g: bool) -> u64 {
    let mut raw = 0u64;
    raw |= u64::from(limit_raw & 0xFFFF);
    raw |= u64::from(base & 0xFFFF) << 16;
    raw |= u64::from((base >> 16) & 0xFF) << 32;
    raw |= (u64::from(typ) | (1 << 4) | (u64::from(dpl) << 5) | (1 << 7)) << 40;
    raw |= u64::from((limit_raw >> 16) & 0xF) << 48;
    raw |= (u64::from(db) << 54) | (u64::from(g) << 55);
    raw |= u64::from((base >> 24) & 0xFF) << 56;
    raw
}

/// The classic real-to-protected bootstrap: LGDT, set CR0.PE, far jump into
/// a 32-bit code segment, run 32-bit code.
#[test]
fn real_to_protected_bootstrap() {
    let code: &[u8] = &[
        0x0F, 0x01, 0x16, 0x00, 0x06, // LGDT [0x0600]
        0x66, 0xB8, 0x01, 0x00, 0x00, 0x00, // MOV EAX, 1
        0x0F, 0x22, 0xC0, // MOV CR0, EAX
        0xEA, 0x20, 0x05, 0x08, 0x00, // JMP 0008:0520
    ];
    let mut cpu = boot_cpu(code);

    // GDT descriptor operand at 0x600: limit, then base -> table at 0x608.
    cpu.bus_mut().load(0x600, &0x17u16.to_le_bytes());
    cpu.bus_mut().load(0x602, &0x0000_0608u32.to_le_bytes());
    let entries = [
        0u64,
        gdt_entry(0, 0xFFFFF, 0xA, 0, true, true),
        gdt_entry(0, 0xFFFFF, 0x2, 0, true, true),
    ];
    for (i, raw) in entries.iter().enumerate() {
        let bytes = raw.to_le_bytes();
        cpu.bus_mut().load(0x608 + (i as u32) * 8, &bytes);
    }

    // 32-bit ring-0 code at 0x520: MOV EAX, 0x12345678 ; HLT
    cpu.bus_mut()
        .load(0x520, &[0xB8, 0x78, 0x56, 0x34, 0x12, 0xF4]);

    step(&mut cpu); // LGDT
    assert!(!cpu.protected_mode());
    step(&mut cpu); // MOV EAX, 1
    step(&mut cpu); // MOV CR0, EAX
    assert!(cpu.protected_mode());
    step(&mut cpu); // far jump

    assert_eq!(cpu.segment(SegReg::CS), 0x0008);
    assert_eq!(cpu.eip(), 0x0520);
    assert_eq!(cpu.cpl(), 0);

    step(&mut cpu); // 32-bit MOV EAX
    assert_eq!(cpu.eax(), 0x1234_5678);
    step(&mut cpu); // HLT
    assert_eq!(cpu.run_state(), RunState::Halted);
}

/// #DE is a fault: the pushed return address points back at the DIV so the
/// handler may fix the divisor and restart it.
#[test]
fn divide_error_is_restartable() {
    let code: &[u8] = &[
        0xB1, 0x00, // MOV CL, 0
        0xB0, 0x01, // MOV AL, 1
        0xF6, 0xF1, // DIV CL
    ];
    let mut cpu = boot_cpu(code);
    cpu.bus_mut().load(0x580, &[0xF4]); // handler: HLT
    cpu.bus_mut().load(0, &0x0580u16.to_le_bytes());
    cpu.bus_mut().load(2, &0x0000u16.to_le_bytes());
    cpu.write_segment(SegReg::SS, 0).unwrap();
    cpu.write_reg16(REG_ESP, 0x400);

    step(&mut cpu);
    step(&mut cpu);
    step(&mut cpu); // DIV faults, #DE delivered

    assert_eq!(cpu.eip(), 0x0580);
    assert_eq!(
        cpu.read_memory16(SegReg::SS, 0x3FA).unwrap(),
        0x0504,
        "return address is the faulting DIV itself"
    );
}

/// An unknown opcode raises #UD through the same fault path.
#[test]
fn invalid_opcode_vectors_through_6() {
    let mut cpu = boot_cpu(&[0x0F, 0xFF]); // no such instruction on a 386
    cpu.bus_mut().load(0x590, &[0xF4]);
    cpu.bus_mut().load(6 * 4, &0x0590u16.to_le_bytes());
    cpu.bus_mut().load(6 * 4 + 2, &0x0000u16.to_le_bytes());
    cpu.write_segment(SegReg::SS, 0).unwrap();
    cpu.write_reg16(REG_ESP, 0x400);

    step(&mut cpu);
    assert_eq!(cpu.eip(), 0x0590);
    assert_eq!(cpu.read_memory16(SegReg::SS, 0x3FA).unwrap(), 0x0500);
}
