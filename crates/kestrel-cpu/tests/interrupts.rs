//! IRQ interaction scenarios: REP preemption and resumption, HLT wakeup,
//! the autotest shutdown opcode, and port I/O dispatch.

use pretty_assertions::assert_eq;

use kestrel_cpu::{
    Cpu, CpuConfig, Env, InterruptLine, IoPorts, LogicalAddress, NoIrq, OpSize, OpenBusIo,
    RunState, SegReg, REG_ECX, REG_EDI, REG_ESI, REG_ESP,
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

fn step_quiet(cpu: &mut Cpu) {
    let mut io = OpenBusIo;
    let mut irq = NoIrq;
    cpu.step(&mut Env {
        io: &mut io,
        irq: &mut irq,
    });
}

/// Asserts the IRQ line on the n-th poll and stays asserted.
struct FiringIrq {
    polls: u32,
    fire_on_poll: u32,
}

impl InterruptLine for FiringIrq {
    fn has_pending_irq(&mut self) -> bool {
        self.polls += 1;
        self.polls >= self.fire_on_poll
    }

    fn acknowledge_irq(&mut self) -> Option<u8> {
        Some(0x08)
    }
}

#[test]
fn rep_movsb_is_preempted_and_resumes_after_iret() {
    // 0500: REP MOVSB ; vector 8 handler at 0000:0550 is a bare IRET.
    let mut cpu = boot_cpu(&[0xF3, 0xA4]);
    cpu.bus_mut().load(0x550, &[0xCF]);
    cpu.bus_mut().load(8 * 4, &0x0550u16.to_le_bytes());
    cpu.bus_mut().load(8 * 4 + 2, &0x0000u16.to_le_bytes());
    cpu.bus_mut().load(0x600, b"hello");

    cpu.write_segment(SegReg::ES, 0).unwrap();
    cpu.write_segment(SegReg::SS, 0).unwrap();
    cpu.write_reg16(REG_ESP, 0x400);
    cpu.write_reg16(REG_ESI, 0x600);
    cpu.write_reg16(REG_EDI, 0x700);
    cpu.write_reg16(REG_ECX, 5);
    assert!(cpu.get_if());

    // The line asserts at the boundary after the second iteration.
    let mut io = OpenBusIo;
    let mut irq = FiringIrq {
        polls: 0,
        fire_on_poll: 2,
    };
    cpu.step(&mut Env {
        io: &mut io,
        irq: &mut irq,
    });

    assert_eq!(cpu.read_reg16(REG_ECX), 3, "two iterations retired");
    assert_eq!(cpu.eip(), 0x0500, "EIP parked on the REP prefix");
    assert_eq!(cpu.read_memory8(SegReg::DS, 0x700).unwrap(), b'h');
    assert_eq!(cpu.read_memory8(SegReg::DS, 0x701).unwrap(), b'e');

    // The main loop would now service the IRQ.
    assert!(cpu.interrupt_window_open());
    cpu.deliver_external_interrupt(0x08);
    assert_eq!(cpu.eip(), 0x0550);
    step_quiet(&mut cpu); // IRET
    assert_eq!(cpu.eip(), 0x0500);

    // Undisturbed, the loop finishes the remaining three bytes.
    step_quiet(&mut cpu);
    assert_eq!(cpu.read_reg16(REG_ECX), 0);
    let mut copied = [0u8; 5];
    for (i, slot) in copied.iter_mut().enumerate() {
        *slot = cpu.read_memory8(SegReg::DS, 0x700 + i as u32).unwrap();
    }
    assert_eq!(&copied, b"hello");
}

#[test]
fn hlt_parks_until_external_interrupt() {
    // 0500: HLT ; 0501: NOP. Vector 8 handler is IRET.
    let mut cpu = boot_cpu(&[0xF4, 0x90]);
    cpu.bus_mut().load(0x550, &[0xCF]);
    cpu.bus_mut().load(8 * 4, &0x0550u16.to_le_bytes());
    cpu.bus_mut().load(8 * 4 + 2, &0x0000u16.to_le_bytes());
    cpu.write_segment(SegReg::SS, 0).unwrap();
    cpu.write_reg16(REG_ESP, 0x400);

    step_quiet(&mut cpu);
    assert_eq!(cpu.run_state(), RunState::Halted);

    cpu.deliver_external_interrupt(0x08);
    assert_eq!(cpu.run_state(), RunState::Alive);
    step_quiet(&mut cpu); // IRET
    assert_eq!(cpu.eip(), 0x0501, "execution resumes after the HLT");
}

#[test]
fn vkill_exits_autotest_machines_only() {
    let mut cpu = boot_cpu(&[0xF1]);
    step_quiet(&mut cpu);
    assert_eq!(cpu.run_state(), RunState::Dead { exit_code: 0 });
}

#[test]
fn single_step_trap_enters_debug_handler() {
    // Vector 1 handler at 0000:0560: IRET. TF set via the program's POPF.
    // 0500: POPF ; 0501: NOP
    let mut cpu = boot_cpu(&[0x9D, 0x90]);
    cpu.bus_mut().load(0x560, &[0xCF]);
    cpu.bus_mut().load(4, &0x0560u16.to_le_bytes());
    cpu.bus_mut().load(6, &0x0000u16.to_le_bytes());
    cpu.write_segment(SegReg::SS, 0).unwrap();
    cpu.write_reg16(REG_ESP, 0x3FE);
    // Pre-seed the flag image POPF will load: TF | IF | bit 1.
    cpu.bus_mut().load(0x3FE, &0x0302u16.to_le_bytes());

    step_quiet(&mut cpu); // POPF sets TF; #DB delivers at the boundary
    assert_eq!(cpu.eip(), 0x0560, "single-step trap entered the handler");
    // The IVT frame points at the next instruction, with the TF image
    // preserved so IRET resumes stepping.
    assert_eq!(cpu.read_memory16(SegReg::SS, 0x3FA).unwrap(), 0x0501);
    assert!(!cpu.get_tf(), "the handler itself must not single-step");

    step_quiet(&mut cpu); // IRET
    assert_eq!(cpu.eip(), 0x0501);
    step_quiet(&mut cpu); // NOP retires, trap again
    assert_eq!(cpu.eip(), 0x0560);
    assert_eq!(cpu.read_memory16(SegReg::SS, 0x3FA).unwrap(), 0x0502);
}

struct RecordingIo {
    last_write: Option<(u16, u32)>,
}

impl IoPorts for RecordingIo {
    fn io_read(&mut self, port: u16, _size: OpSize) -> u32 {
        u32::from(port) ^ 0xA5
    }

    fn io_write(&mut self, port: u16, _size: OpSize, value: u32) {
        self.last_write = Some((port, value));
    }
}

#[test]
fn in_out_reach_the_port_bus() {
    // IN AL, 0x42 ; OUT 0x43, AL
    let mut cpu = boot_cpu(&[0xE4, 0x42, 0xE6, 0x43]);
    let mut io = RecordingIo { last_write: None };
    let mut irq = NoIrq;

    cpu.step(&mut Env {
        io: &mut io,
        irq: &mut irq,
    });
    assert_eq!(cpu.al(), 0xE7); // 0x42 ^ 0xA5

    cpu.step(&mut Env {
        io: &mut io,
        irq: &mut irq,
    });
    assert_eq!(io.last_write, Some((0x43, 0xE7)));
}
