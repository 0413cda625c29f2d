//! Interrupt and exception delivery: the real-mode IVT path, the
//! protected-mode IDT path with privilege transitions and error-code
//! pushes, V86 monitor entry, and task-gate dispatch.

use tracing::trace;

use crate::cpu::Cpu;
use crate::descriptor::{Descriptor, Gate, GateKind, Selector};
use crate::exception::{Exception, InterruptSource};
use crate::state::{
    SegReg, FLAG_IF, FLAG_NT, FLAG_RF, FLAG_TF, FLAG_VM,
};
use crate::transfer::JumpType;

fn idt_error_code(vector: u8, source: InterruptSource) -> u16 {
    (u16::from(vector) << 3) | 2 | source.ext_bit()
}

fn selector_error_code(selector: u16, source: InterruptSource) -> u16 {
    (selector & 0xFFFC) | source.ext_bit()
}

/// Deliver `vector`. `error_code` is pushed on the handler's stack for the
/// exceptions that define one.
pub(crate) fn interrupt(
    cpu: &mut Cpu,
    vector: u8,
    source: InterruptSource,
    error_code: Option<u16>,
) -> Result<(), Exception> {
    if cpu.protected_mode() {
        protected_mode_interrupt(cpu, vector, source, error_code)
    } else {
        real_mode_interrupt(cpu, vector)
    }
}

fn real_mode_interrupt(cpu: &mut Cpu, vector: u8) -> Result<(), Exception> {
    let entry_addr = cpu.idtr().base.wrapping_add(u32::from(vector) * 4);
    let offset = cpu.read_linear_u16(entry_addr)?;
    let selector = cpu.read_linear_u16(entry_addr.wrapping_add(2))?;

    let flags = cpu.get_flags16();
    let original_cs = cpu.segment(SegReg::CS);
    let original_ip = cpu.eip() as u16;

    cpu.push16(flags)?;
    cpu.push16(original_cs)?;
    cpu.push16(original_ip)?;

    cpu.set_flag(FLAG_IF, false);
    cpu.set_flag(FLAG_TF, false);

    cpu.set_segment_real(SegReg::CS, selector);
    cpu.set_eip(u32::from(offset));
    Ok(())
}

fn idt_gate(cpu: &mut Cpu, vector: u8, source: InterruptSource) -> Result<Gate, Exception> {
    let offset = u32::from(vector) * 8;
    if offset + 7 > u32::from(cpu.idtr().limit) {
        return Err(Exception::GeneralProtection(idt_error_code(vector, source)));
    }
    let raw = cpu.read_linear_u64(cpu.idtr().base.wrapping_add(offset))?;
    match crate::descriptor::parse_descriptor(raw) {
        Descriptor::Gate(gate)
            if matches!(
                gate.kind,
                GateKind::Interrupt | GateKind::Trap | GateKind::Task
            ) =>
        {
            Ok(gate)
        }
        _ => Err(Exception::GeneralProtection(idt_error_code(vector, source))),
    }
}

fn protected_mode_interrupt(
    cpu: &mut Cpu,
    vector: u8,
    source: InterruptSource,
    error_code: Option<u16>,
) -> Result<(), Exception> {
    let gate = idt_gate(cpu, vector, source)?;

    // Software interrupts cannot reach through a gate more privileged than
    // their caller; external and exception delivery can.
    if source == InterruptSource::Internal && gate.dpl < cpu.cpl() {
        return Err(Exception::GeneralProtection(idt_error_code(vector, source)));
    }
    if !gate.present {
        return Err(Exception::SegmentNotPresent(idt_error_code(vector, source)));
    }

    if gate.kind == GateKind::Task {
        return interrupt_through_task_gate(cpu, source, error_code, &gate);
    }

    let selector = Selector(gate.selector);
    let code = match cpu.descriptor(selector)? {
        Descriptor::Code(code) => code,
        Descriptor::Null => {
            return Err(Exception::GeneralProtection(source.ext_bit()));
        }
        _ => {
            return Err(Exception::GeneralProtection(selector_error_code(
                gate.selector,
                source,
            )));
        }
    };
    if code.dpl > cpu.cpl() {
        return Err(Exception::GeneralProtection(selector_error_code(
            gate.selector,
            source,
        )));
    }
    if !code.present {
        return Err(Exception::SegmentNotPresent(selector_error_code(
            gate.selector,
            source,
        )));
    }

    let is_trap = gate.kind == GateKind::Trap;
    let push_32 = gate.is_32bit;
    let mut offset = gate.offset;
    if !gate.is_32bit || !code.default_big {
        offset &= 0xFFFF;
    }
    if offset > code.limit {
        return Err(Exception::gp0());
    }

    let flags_image = cpu.get_eflags();
    let original_ss = cpu.segment(SegReg::SS);
    let original_esp = cpu.stack_ptr();
    let original_cpl = cpu.cpl();
    let original_cs = cpu.segment(SegReg::CS);
    let original_eip = cpu.eip();

    if cpu.v86_mode() {
        // The V86 monitor lives at ring 0; anything else is a bad IDT.
        if code.conforming || code.dpl != 0 {
            return Err(Exception::GeneralProtection(selector_error_code(
                gate.selector,
                source,
            )));
        }
        return enter_v86_monitor(
            cpu,
            source,
            &gate,
            &code,
            offset,
            is_trap,
            flags_image,
            error_code,
        );
    }

    if !code.conforming && code.dpl < original_cpl {
        // Inner-ring delivery: handler stack comes from the TSS.
        let (new_ss, new_esp) = cpu.tss_ring_stack(code.dpl)?;
        let ss_sel = Selector(new_ss);
        let data = validate_interrupt_stack_segment(cpu, ss_sel, code.dpl, source)?;

        cpu.load_cs_checked(gate.selector, &code, code.dpl);
        cpu.install_stack_segment(ss_sel, &data, new_esp);

        cpu.push_osize(u32::from(original_ss), push_32)?;
        cpu.push_osize(original_esp, push_32)?;

        trace!(
            target: "kestrel_cpu",
            vector,
            from = original_cpl,
            to = code.dpl,
            "interrupt privilege escalation",
        );
    } else if code.conforming || code.dpl == original_cpl {
        cpu.load_cs_checked(gate.selector, &code, original_cpl);
    } else {
        return Err(Exception::GeneralProtection(selector_error_code(
            gate.selector,
            source,
        )));
    }

    cpu.push_osize(flags_image, push_32)?;
    cpu.push_osize(u32::from(original_cs), push_32)?;
    cpu.push_osize(original_eip, push_32)?;
    if let Some(code_value) = error_code {
        cpu.push_osize(u32::from(code_value), push_32)?;
    }

    if !is_trap {
        cpu.set_flag(FLAG_IF, false);
    }
    cpu.set_flag(FLAG_TF, false);
    cpu.set_flag(FLAG_RF, false);
    cpu.set_flag(FLAG_NT, false);
    cpu.set_eip(offset);
    Ok(())
}

/// Interrupt or exception raised while in V86: switch to the ring-0 stack
/// from the TSS, push the segment registers the monitor needs to rebuild
/// the V86 world, and drop VM.
#[allow(clippy::too_many_arguments)]
fn enter_v86_monitor(
    cpu: &mut Cpu,
    source: InterruptSource,
    gate: &Gate,
    code: &crate::descriptor::CodeSegment,
    offset: u32,
    is_trap: bool,
    flags_image: u32,
    error_code: Option<u16>,
) -> Result<(), Exception> {
    let original_ss = cpu.segment(SegReg::SS);
    let original_esp = cpu.stack_ptr();
    let original_cs = cpu.segment(SegReg::CS);
    let original_eip = cpu.eip();
    let original_es = cpu.segment(SegReg::ES);
    let original_ds = cpu.segment(SegReg::DS);
    let original_fs = cpu.segment(SegReg::FS);
    let original_gs = cpu.segment(SegReg::GS);

    // Leave V86 before the ring-0 stack is installed; the pushes below
    // happen with protected-mode semantics.
    cpu.set_flag(FLAG_VM, false);

    let (new_ss, new_esp) = cpu.tss_ring_stack(0)?;
    let ss_sel = Selector(new_ss);
    let data = validate_interrupt_stack_segment(cpu, ss_sel, 0, source)?;

    cpu.load_cs_checked(gate.selector, code, 0);
    cpu.install_stack_segment(ss_sel, &data, new_esp);

    let push_32 = gate.is_32bit;
    cpu.push_osize(u32::from(original_gs), push_32)?;
    cpu.push_osize(u32::from(original_fs), push_32)?;
    cpu.push_osize(u32::from(original_ds), push_32)?;
    cpu.push_osize(u32::from(original_es), push_32)?;
    cpu.push_osize(u32::from(original_ss), push_32)?;
    cpu.push_osize(original_esp, push_32)?;
    cpu.push_osize(flags_image, push_32)?;
    cpu.push_osize(u32::from(original_cs), push_32)?;
    cpu.push_osize(original_eip, push_32)?;
    if let Some(code_value) = error_code {
        cpu.push_osize(u32::from(code_value), push_32)?;
    }

    // The monitor gets null data segments; the saved copies are on its
    // stack.
    for seg in [SegReg::ES, SegReg::DS, SegReg::FS, SegReg::GS] {
        cpu.load_segment(seg, 0)?;
    }

    if !is_trap {
        cpu.set_flag(FLAG_IF, false);
    }
    cpu.set_flag(FLAG_TF, false);
    cpu.set_flag(FLAG_RF, false);
    cpu.set_flag(FLAG_NT, false);
    cpu.set_eip(offset);
    Ok(())
}

fn validate_interrupt_stack_segment(
    cpu: &mut Cpu,
    selector: Selector,
    expected_dpl: u8,
    source: InterruptSource,
) -> Result<crate::descriptor::DataSegment, Exception> {
    if selector.is_null() {
        return Err(Exception::InvalidTss(source.ext_bit()));
    }
    let descriptor = cpu.descriptor(selector)?;
    if descriptor.is_outside_table_limits() {
        return Err(Exception::InvalidTss(selector_error_code(
            selector.0, source,
        )));
    }
    let data = match descriptor {
        Descriptor::Data(data) if data.writable => data,
        _ => {
            return Err(Exception::InvalidTss(selector_error_code(
                selector.0, source,
            )));
        }
    };
    if data.dpl != expected_dpl {
        return Err(Exception::InvalidTss(selector_error_code(
            selector.0, source,
        )));
    }
    if !data.present {
        return Err(Exception::StackFault(selector_error_code(
            selector.0, source,
        )));
    }
    Ok(data)
}

fn interrupt_through_task_gate(
    cpu: &mut Cpu,
    source: InterruptSource,
    error_code: Option<u16>,
    gate: &Gate,
) -> Result<(), Exception> {
    let selector = Selector(gate.selector);
    if selector.ti_local() {
        return Err(Exception::GeneralProtection(selector_error_code(
            gate.selector,
            source,
        )));
    }
    let tss = match cpu.descriptor(selector)? {
        Descriptor::Tss(tss) => tss,
        _ => {
            return Err(Exception::GeneralProtection(selector_error_code(
                gate.selector,
                source,
            )));
        }
    };
    if tss.busy {
        return Err(Exception::GeneralProtection(selector_error_code(
            gate.selector,
            source,
        )));
    }
    if !tss.present {
        return Err(Exception::SegmentNotPresent(selector_error_code(
            gate.selector,
            source,
        )));
    }

    cpu.task_switch(selector, &tss, JumpType::Int)?;

    if let Some(code_value) = error_code {
        if tss.is_32bit {
            cpu.push32(u32::from(code_value))?;
        } else {
            cpu.push16(code_value)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{Cpu, CpuConfig};
    use crate::state::{DescriptorTableReg, SystemSegmentReg, CR0_PE, FLAG_IF};

    #[test]
    fn real_mode_interrupt_frame_and_vector() {
        let mut cpu = Cpu::new(CpuConfig::default()).unwrap();
        // IVT entry 0x21 -> 2000:0100.
        cpu.bus_mut().load(0x21 * 4, &0x0100u16.to_le_bytes());
        cpu.bus_mut().load(0x21 * 4 + 2, &0x2000u16.to_le_bytes());

        cpu.write_segment(SegReg::CS, 0x1000).unwrap();
        cpu.set_eip(0x0005);
        cpu.write_segment(SegReg::SS, 0).unwrap();
        cpu.write_reg32(crate::state::REG_ESP, 0x0200);
        cpu.set_flag(FLAG_IF, true);
        let flags_before = cpu.get_flags16();

        interrupt(&mut cpu, 0x21, InterruptSource::Internal, None).unwrap();

        assert_eq!(cpu.segment(SegReg::CS), 0x2000);
        assert_eq!(cpu.eip(), 0x0100);
        assert!(!cpu.get_if(), "IVT delivery clears IF");

        // Frame: flags, CS, IP from top down.
        assert_eq!(cpu.read_memory16(SegReg::SS, 0x1FA).unwrap(), 0x0005);
        assert_eq!(cpu.read_memory16(SegReg::SS, 0x1FC).unwrap(), 0x1000);
        assert_eq!(cpu.read_memory16(SegReg::SS, 0x1FE).unwrap(), flags_before);

        // IRET restores the interrupted context exactly.
        cpu.iret(false).unwrap();
        assert_eq!(cpu.segment(SegReg::CS), 0x1000);
        assert_eq!(cpu.eip(), 0x0005);
        assert_eq!(cpu.get_flags16(), flags_before);
    }

    fn descriptor_raw(base: u32, limit_raw: u32, typ: u8, s: bool, dpl: u8, db: bool, g: bool) -> u64 {
        let mut raw = 0u64;
        raw |= u64::from(limit_raw & 0xFFFF);
        raw |= u64::from(base & 0xFFFF) << 16;
        raw |= u64::from((base >> 16) & 0xFF) << 32;
        raw |= (u64::from(typ) | (u64::from(s) << 4) | (u64::from(dpl) << 5) | (1 << 7)) << 40;
        raw |= u64::from((limit_raw >> 16) & 0xF) << 48;
        raw |= (u64::from(db) << 54) | (u64::from(g) << 55);
        raw |= u64::from((base >> 24) & 0xFF) << 56;
        raw
    }

    fn interrupt_gate_raw(selector: u16, offset: u32, dpl: u8) -> u64 {
        let mut raw = 0u64;
        raw |= u64::from(offset & 0xFFFF);
        raw |= u64::from(selector) << 16;
        raw |= (0xE | (u64::from(dpl) << 5) | (1 << 7)) << 40;
        raw |= u64::from(offset >> 16) << 48;
        raw
    }

    const GDT_BASE: u32 = 0x800;
    const IDT_BASE: u32 = 0x400;
    const RING0_CS: u16 = 0x08;
    const RING0_SS: u16 = 0x10;

    fn protected_cpu() -> Cpu {
        let mut cpu = Cpu::new(CpuConfig::default()).unwrap();
        let entries = [
            0u64,
            descriptor_raw(0, 0xFFFFF, 0xA, true, 0, true, true),
            descriptor_raw(0, 0xFFFFF, 0x2, true, 0, true, true),
        ];
        for (i, raw) in entries.iter().enumerate() {
            let bytes = raw.to_le_bytes();
            cpu.bus_mut().load(GDT_BASE + (i as u32) * 8, &bytes);
        }
        cpu.gdtr = DescriptorTableReg {
            base: GDT_BASE,
            limit: 8 * 3 - 1,
        };
        cpu.cr0 |= CR0_PE;

        let code = match cpu.descriptor(Selector(RING0_CS)).unwrap() {
            Descriptor::Code(code) => code,
            other => panic!("unexpected descriptor: {other:?}"),
        };
        cpu.load_cs_checked(RING0_CS, &code, 0);
        cpu.load_segment(SegReg::SS, RING0_SS).unwrap();
        cpu.write_reg32(crate::state::REG_ESP, 0x6000);
        cpu.set_eip(0x1234);

        cpu.idtr = DescriptorTableReg {
            base: IDT_BASE,
            limit: 0x7FF,
        };
        cpu.bus_mut().load(
            IDT_BASE + 13 * 8,
            &interrupt_gate_raw(RING0_CS, 0x5000, 0).to_le_bytes(),
        );
        cpu
    }

    #[test]
    fn protected_interrupt_pushes_error_code_and_clears_if() {
        let mut cpu = protected_cpu();
        cpu.set_flag(FLAG_IF, true);
        let flags_before = cpu.get_eflags();

        interrupt(&mut cpu, 13, InterruptSource::Internal, Some(0x18)).unwrap();

        assert_eq!(cpu.segment(SegReg::CS), RING0_CS);
        assert_eq!(cpu.eip(), 0x5000);
        assert!(!cpu.get_if(), "interrupt gate clears IF");

        // Frame: EFLAGS, CS, EIP, error code.
        assert_eq!(cpu.stack_ptr(), 0x6000 - 16);
        assert_eq!(cpu.read_memory32(SegReg::SS, 0x6000 - 4).unwrap(), flags_before);
        assert_eq!(
            cpu.read_memory32(SegReg::SS, 0x6000 - 8).unwrap(),
            u32::from(RING0_CS)
        );
        assert_eq!(cpu.read_memory32(SegReg::SS, 0x6000 - 12).unwrap(), 0x1234);
        assert_eq!(cpu.read_memory32(SegReg::SS, 0x6000 - 16).unwrap(), 0x18);
    }

    #[test]
    fn missing_idt_entry_is_gp_with_idt_error_code() {
        let mut cpu = protected_cpu();
        cpu.idtr = DescriptorTableReg {
            base: IDT_BASE,
            limit: 7,
        };
        let err = interrupt(&mut cpu, 13, InterruptSource::External, None).unwrap_err();
        assert_eq!(err, Exception::GeneralProtection((13 << 3) | 2 | 1));
    }

    #[test]
    fn software_int_through_privileged_gate_is_rejected() {
        let mut cpu = protected_cpu();
        // Park the CPU at ring 3 against a DPL-0 gate.
        cpu.cpl = 3;
        let err = interrupt(&mut cpu, 13, InterruptSource::Internal, None).unwrap_err();
        assert_eq!(err, Exception::GeneralProtection((13 << 3) | 2));
        // The same vector from hardware is allowed to reach ring 0.
        assert!(interrupt(&mut cpu, 13, InterruptSource::External, None).is_err(),
            "still faults later on the ring transition without a TSS, but not on the gate DPL");
    }
}
