use pretty_assertions::assert_eq;
use proptest::prelude::*;
use vx86_cpu_core::state::{EFLAGS_IF, EFLAGS_RESERVED1};
use vx86_cpu_core::{
    AluOp, CpuState, Descriptor, GuestMemory, Gpr, SegReg, StandaloneThread, Width,
};

#[test]
fn reset_state() {
    let mut cpu = CpuState::new();
    cpu.set_reg(Gpr::Eax, 7);
    cpu.eip = 0x1234;
    cpu.reset();

    assert_eq!(cpu.seg(SegReg::Cs).selector, 0x0F);
    assert_eq!(cpu.seg(SegReg::Ss).selector, 0x17);
    assert_eq!(cpu.seg(SegReg::Ds).selector, 0x17);
    assert_eq!(cpu.seg(SegReg::Es).selector, 0x17);
    assert_eq!(cpu.cpl(), 3);
    assert_eq!(cpu.flags(), EFLAGS_IF | EFLAGS_RESERVED1);
    assert_eq!(cpu.df(), 1);
    assert_eq!(cpu.stack_mask(), 0xFFFF_FFFF);
    assert_eq!(cpu.stack_not_mask(), 0);
    assert_eq!(cpu.reg(Gpr::Eax), 0);
    assert!(cpu.big);
}

#[test]
fn enter_without_nesting() {
    let mut cpu = CpuState::new();
    let mut thread = StandaloneThread::new(0x4000);
    cpu.set_reg(Gpr::Ebp, 0x2000);
    cpu.set_reg(Gpr::Esp, 0x3000);

    cpu.enter(&mut thread.memory, true, 8, 0);

    assert_eq!(thread.memory.read_u32(0x2FFC), 0x2000);
    assert_eq!(cpu.reg(Gpr::Ebp), 0x2FFC);
    assert_eq!(cpu.reg(Gpr::Esp), 0x2FF4);
}

#[test]
fn enter_on_16bit_stack_wraps_like_push() {
    let (mut cpu, mut thread) = stack_thread(false);
    cpu.set_reg(Gpr::Esp, 0);
    cpu.set_reg(Gpr::Ebp, 0xBEEF);
    cpu.enter(&mut thread.memory, false, 0, 0);
    assert_eq!(cpu.reg(Gpr::Esp), 0xFFFE);
    assert_eq!(cpu.reg16(Gpr::Ebp), 0xFFFE);
    assert_eq!(thread.memory.read_u16(0x1000 + 0xFFFE), 0xBEEF);

    // Nested frames copy through the same wrapped addresses.
    cpu.set_reg(Gpr::Esp, 2);
    cpu.set_reg(Gpr::Ebp, 0x0004);
    thread.memory.write_u16(0x1000 + 0x0002, 0x1234);
    cpu.enter(&mut thread.memory, false, 4, 2);
    assert_eq!(thread.memory.read_u16(0x1000), 0x0004);
    assert_eq!(thread.memory.read_u16(0x1000 + 0xFFFE), 0x1234);
    assert_eq!(thread.memory.read_u16(0x1000 + 0xFFFC), 0x0000);
    assert_eq!(cpu.reg(Gpr::Esp), 0xFFF8);
}

#[test]
fn leave_on_16bit_stack_keeps_high_half() {
    let mut cpu = CpuState::new();
    let mut thread = StandaloneThread::new(0x2_0000);
    thread.set_descriptor(
        2,
        Descriptor {
            base: 0x1_0000,
            limit: 0xFFFF,
            seg_32bit: false,
            not_present: false,
        },
    );
    cpu.load_segment(&mut thread, SegReg::Ss, 0x17).unwrap();
    cpu.set_reg(Gpr::Esp, 0xDEAD_0100);
    cpu.set_reg(Gpr::Ebp, 0x0000_0200);
    thread.memory.write_u16(0x1_0200, 0x0300);

    cpu.leave(&thread.memory, false);

    assert_eq!(cpu.reg(Gpr::Esp), 0xDEAD_0202);
    assert_eq!(cpu.reg16(Gpr::Ebp), 0x0300);
}

fn stack_thread(seg_32bit: bool) -> (CpuState, StandaloneThread) {
    let mut cpu = CpuState::new();
    let mut thread = StandaloneThread::new(0x2_0000);
    thread.set_descriptor(
        2,
        Descriptor {
            base: 0x1000,
            limit: 0xFFFF,
            seg_32bit,
            not_present: false,
        },
    );
    cpu.load_segment(&mut thread, SegReg::Ss, 0x17).unwrap();
    (cpu, thread)
}

proptest! {
    #[test]
    fn push_pop_round_trip(
        seg_32bit in any::<bool>(),
        high in any::<u16>(),
        sp in 8u16..0xF000,
        value in any::<u32>(),
        dword in any::<bool>(),
    ) {
        let (mut cpu, mut thread) = stack_thread(seg_32bit);
        let esp = if seg_32bit {
            u32::from(sp)
        } else {
            (u32::from(high) << 16) | u32::from(sp)
        };
        cpu.set_reg(Gpr::Esp, esp);

        if dword {
            cpu.push32(&mut thread.memory, value);
            prop_assert_eq!(cpu.pop32(&thread.memory), value);
        } else {
            cpu.push16(&mut thread.memory, value as u16);
            prop_assert_eq!(cpu.pop16(&thread.memory), value as u16);
        }
        prop_assert_eq!(cpu.reg(Gpr::Esp), esp);
    }

    #[test]
    fn push_pop_wraps_16bit_stack_at_zero(high in any::<u16>(), value in any::<u32>()) {
        let (mut cpu, mut thread) = stack_thread(false);
        let esp = u32::from(high) << 16;
        cpu.set_reg(Gpr::Esp, esp);

        cpu.push32(&mut thread.memory, value);
        prop_assert_eq!(cpu.reg(Gpr::Esp), esp | 0xFFFC);
        prop_assert_eq!(thread.memory.read_u32(0x1000 + 0xFFFC), value);
        prop_assert_eq!(cpu.pop32(&thread.memory), value);
        prop_assert_eq!(cpu.reg(Gpr::Esp), esp);
    }

    #[test]
    fn fill_flags_is_idempotent(
        op in prop::sample::select(vec![
            AluOp::Add, AluOp::Or, AluOp::Adc, AluOp::Sbb,
            AluOp::And, AluOp::Sub, AluOp::Xor, AluOp::Cmp,
        ]),
        width in prop::sample::select(vec![Width::Byte, Width::Word, Width::Dword]),
        lhs in any::<u32>(),
        rhs in any::<u32>(),
    ) {
        let mut cpu = CpuState::new();
        cpu.alu(op, width, lhs, rhs);
        cpu.fill_flags();
        let first = cpu.flags();
        prop_assert!(!cpu.lazy_flags().is_pending());
        cpu.fill_flags();
        prop_assert_eq!(cpu.flags(), first);
        prop_assert!(!cpu.lazy_flags().is_pending());
    }
}
