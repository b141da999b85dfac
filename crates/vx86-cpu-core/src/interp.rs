//! Reference interpreter: executes one [`DecodedOp`] directly against a [`CpuState`].
//!
//! The code emitter must reproduce exactly what [`step`] does, including where a delivered fault
//! leaves EIP.

use tracing::trace;

use crate::exceptions::{Completion, CpuExit};
use crate::op::{DecodedOp, FlagOp, Op};
use crate::state::{CpuState, SegReg, Width, EFLAGS_DF, FMASK_ALL};
use crate::thread::GuestThread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Completed; EIP advanced past the operation.
    Retired,
    /// A fault was delivered to the guest; EIP still names the faulting operation.
    Faulted,
    /// A control transfer set EIP.
    Branched,
}

/// Bits of the pushed 32-bit flags image; VM and RF always read as zero.
pub const PUSHF32_MASK: u32 = 0x00FC_FFFF;

impl CpuState {
    /// Builds the flags image PUSHF stores.
    pub fn pushf_image(&mut self) -> u32 {
        self.fill_flags();
        self.flags()
    }

    /// POPF: replaces every modifiable bit. Pending flags are dropped, not materialized.
    pub fn popf_commit(&mut self, value: u32, big: bool) {
        let mask = if big { FMASK_ALL } else { FMASK_ALL & 0xFFFF };
        self.discard_lazy_flags();
        self.set_flags(value, mask);
    }

    pub fn flag_op(&mut self, op: FlagOp) {
        match op {
            FlagOp::Clc | FlagOp::Stc => {
                self.fill_flags_no_cf();
                self.set_cf(op == FlagOp::Stc);
            }
            FlagOp::Cmc => {
                self.fill_flags();
                let cf = self.cf();
                self.set_cf(!cf);
            }
            FlagOp::Cld => {
                self.fill_flags();
                self.remove_flag(EFLAGS_DF);
            }
            FlagOp::Std => {
                self.fill_flags();
                self.add_flag(EFLAGS_DF);
            }
        }
    }

    pub(crate) fn advance(&mut self, len: u8) {
        let next = self.eip.wrapping_add(u32::from(len));
        self.eip = if self.big { next } else { next & 0xFFFF };
    }
}

fn branch(completion: Completion) -> StepOutcome {
    match completion {
        Completion::Done => StepOutcome::Branched,
        Completion::FaultDelivered => StepOutcome::Faulted,
    }
}

/// Executes `op` at the current EIP.
pub fn step<T: GuestThread + ?Sized>(
    cpu: &mut CpuState,
    thread: &mut T,
    op: &DecodedOp,
) -> Result<StepOutcome, CpuExit> {
    trace!(eip = cpu.eip, op = ?op.op, "step");
    let next_eip = cpu.eip.wrapping_add(u32::from(op.len));

    match op.op {
        Op::PushReg16(r) => {
            let v = cpu.reg16(r);
            cpu.push16(thread.memory_mut(), v);
        }
        Op::PushReg32(r) => {
            let v = cpu.reg(r);
            cpu.push32(thread.memory_mut(), v);
        }
        Op::PopReg16(r) => {
            let v = cpu.pop16(thread.memory());
            cpu.set_reg16(r, v);
        }
        Op::PopReg32(r) => {
            let v = cpu.pop32(thread.memory());
            cpu.set_reg(r, v);
        }
        Op::PushMem16(ea) => {
            let v = thread.memory().read_u16(ea.linear(cpu));
            cpu.push16(thread.memory_mut(), v);
        }
        Op::PushMem32(ea) => {
            let v = thread.memory().read_u32(ea.linear(cpu));
            cpu.push32(thread.memory_mut(), v);
        }
        // The destination address is formed after ESP has been incremented.
        Op::PopMem16(ea) => {
            let v = cpu.pop16(thread.memory());
            let addr = ea.linear(cpu);
            thread.memory_mut().write_u16(addr, v);
        }
        Op::PopMem32(ea) => {
            let v = cpu.pop32(thread.memory());
            let addr = ea.linear(cpu);
            thread.memory_mut().write_u32(addr, v);
        }
        Op::PushSeg16(s) => {
            let v = cpu.seg(s).selector;
            cpu.push16(thread.memory_mut(), v);
        }
        Op::PushSeg32(s) => {
            let v = u32::from(cpu.seg(s).selector);
            cpu.push32(thread.memory_mut(), v);
        }
        Op::PopSeg16(s) => {
            let v = u32::from(cpu.peek16(thread.memory(), 0));
            if pop_segment(cpu, thread, s, v, 2)? == Completion::FaultDelivered {
                return Ok(StepOutcome::Faulted);
            }
        }
        Op::PopSeg32(s) => {
            let v = cpu.peek32(thread.memory(), 0);
            if pop_segment(cpu, thread, s, v, 4)? == Completion::FaultDelivered {
                return Ok(StepOutcome::Faulted);
            }
        }
        Op::PushImm16(v) => cpu.push16(thread.memory_mut(), v),
        Op::PushImm32(v) => cpu.push32(thread.memory_mut(), v),
        Op::PushA16 => cpu.push_a16(thread.memory_mut()),
        Op::PushA32 => cpu.push_a32(thread.memory_mut()),
        Op::PopA16 => cpu.pop_a16(thread.memory()),
        Op::PopA32 => cpu.pop_a32(thread.memory()),
        Op::Pushf16 => {
            let v = cpu.pushf_image() as u16;
            cpu.push16(thread.memory_mut(), v);
        }
        Op::Pushf32 => {
            let v = cpu.pushf_image() & PUSHF32_MASK;
            cpu.push32(thread.memory_mut(), v);
        }
        Op::Popf16 => {
            let v = cpu.pop16(thread.memory());
            cpu.popf_commit(u32::from(v), false);
        }
        Op::Popf32 => {
            let v = cpu.pop32(thread.memory());
            cpu.popf_commit(v, true);
        }
        Op::AluRegImm32 { op, reg, imm } => {
            let result = cpu.alu(op, Width::Dword, cpu.reg(reg), imm);
            if op.writes_result() {
                cpu.set_reg(reg, result);
            }
        }
        Op::IncReg32(r) => {
            let v = cpu.inc(Width::Dword, cpu.reg(r));
            cpu.set_reg(r, v);
        }
        Op::DecReg32(r) => {
            let v = cpu.dec(Width::Dword, cpu.reg(r));
            cpu.set_reg(r, v);
        }
        Op::NegReg32(r) => {
            let v = cpu.neg(Width::Dword, cpu.reg(r));
            cpu.set_reg(r, v);
        }
        Op::ShiftRegImm32 { op, reg, count } => {
            let v = cpu.shift(op, Width::Dword, cpu.reg(reg), count);
            cpu.set_reg(reg, v);
        }
        Op::Flag(f) => cpu.flag_op(f),
        Op::Jcc { cond, rel } => {
            cpu.fill_flags();
            let mut target = next_eip;
            if cond.test(cpu.flags()) {
                target = target.wrapping_add(rel as u32);
            }
            cpu.eip = if cpu.big { target } else { target & 0xFFFF };
            return Ok(StepOutcome::Branched);
        }
        Op::CallFar {
            big,
            selector,
            offset,
        } => {
            let done = cpu.call(thread, big, u32::from(selector), offset, next_eip)?;
            return Ok(branch(done));
        }
        Op::JmpFar {
            big,
            selector,
            offset,
        } => {
            let done = cpu.jmp(thread, big, u32::from(selector), offset)?;
            return Ok(branch(done));
        }
        Op::RetFar { big, bytes } => {
            let done = cpu.ret(thread, big, u32::from(bytes))?;
            return Ok(branch(done));
        }
        Op::Iret { big } => {
            let done = cpu.iret(thread, big)?;
            return Ok(branch(done));
        }
        Op::Enter { big, bytes, level } => {
            cpu.enter(thread.memory_mut(), big, u32::from(bytes), u32::from(level))
        }
        Op::Leave { big } => cpu.leave(thread.memory(), big),
        Op::Lar { dst, src } => {
            let v = cpu.lar(&*thread, cpu.reg(src), cpu.reg(dst));
            cpu.set_reg(dst, v);
        }
        Op::Lsl { dst, src } => {
            let v = cpu.lsl(&*thread, cpu.reg(src), cpu.reg(dst));
            cpu.set_reg(dst, v);
        }
        Op::Cpuid => cpu.cpuid(),
    }

    cpu.advance(op.len);
    Ok(StepOutcome::Retired)
}

/// Loads `seg` from a peeked stack slot, popping it only once the load succeeded.
fn pop_segment<T: GuestThread + ?Sized>(
    cpu: &mut CpuState,
    thread: &mut T,
    seg: SegReg,
    value: u32,
    size: u32,
) -> Result<Completion, CpuExit> {
    let done = cpu.set_segment(thread, seg, value)?;
    if done == Completion::Done {
        cpu.adjust_esp(size);
    }
    Ok(done)
}

/// Runs `ops` in order until one branches, faults or ends a block, or the list ends.
pub fn run<T: GuestThread + ?Sized>(
    cpu: &mut CpuState,
    thread: &mut T,
    ops: &[DecodedOp],
) -> Result<StepOutcome, CpuExit> {
    let mut outcome = StepOutcome::Retired;
    for op in ops {
        outcome = step(cpu, thread, op)?;
        if outcome != StepOutcome::Retired || op.op.is_block_end() {
            break;
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::Descriptor;
    use crate::exceptions::{Signal, SignalDisposition};
    use crate::flags::AluOp;
    use crate::mem::GuestMemory;
    use crate::op::{Condition, EffectiveAddress};
    use crate::state::Gpr;
    use crate::thread::StandaloneThread;

    fn setup() -> (CpuState, StandaloneThread) {
        let mut cpu = CpuState::new();
        cpu.set_reg(Gpr::Esp, 0x8000);
        let mut t = StandaloneThread::new(0x1_0000);
        t.set_descriptor(2, Descriptor::flat32());
        t.set_disposition(Signal::Segv, SignalDisposition::Handler);
        (cpu, t)
    }

    #[test]
    fn pop_esp_stores_popped_value() {
        let (mut cpu, mut t) = setup();
        t.memory.write_u32(0x8000, 0x1234);
        step(&mut cpu, &mut t, &DecodedOp::new(1, Op::PopReg32(Gpr::Esp))).unwrap();
        assert_eq!(cpu.reg(Gpr::Esp), 0x1234);
        assert_eq!(cpu.eip, 1);
    }

    #[test]
    fn pop_mem_with_esp_base_uses_incremented_esp() {
        let (mut cpu, mut t) = setup();
        t.memory.write_u32(0x8000, 0xCAFE);
        let ea = EffectiveAddress {
            seg: SegReg::Ss,
            base: Some(Gpr::Esp),
            index: None,
            disp: 0x10,
            addr16: false,
        };
        step(&mut cpu, &mut t, &DecodedOp::new(3, Op::PopMem32(ea))).unwrap();
        assert_eq!(t.memory.read_u32(0x8014), 0xCAFE);
        assert_eq!(cpu.reg(Gpr::Esp), 0x8004);
    }

    #[test]
    fn faulting_pop_seg_keeps_esp_and_eip() {
        let (mut cpu, mut t) = setup();
        cpu.eip = 0x40;
        t.memory.write_u32(0x8000, 0x3F);
        let outcome = step(&mut cpu, &mut t, &DecodedOp::new(1, Op::PopSeg32(SegReg::Ds))).unwrap();
        assert_eq!(outcome, StepOutcome::Faulted);
        assert_eq!(cpu.reg(Gpr::Esp), 0x8000);
        assert_eq!(cpu.eip, 0x40);
        assert_eq!(t.delivered().len(), 1);
    }

    #[test]
    fn pushf_materializes_pending_flags() {
        let (mut cpu, mut t) = setup();
        let ops = [
            DecodedOp::new(
                5,
                Op::AluRegImm32 {
                    op: AluOp::Sub,
                    reg: Gpr::Eax,
                    imm: 1,
                },
            ),
            DecodedOp::new(1, Op::Pushf32),
        ];
        run(&mut cpu, &mut t, &ops).unwrap();
        let image = t.memory.read_u32(0x7FFC);
        // 0 - 1: CF, SF, AF, PF set; IF and the reserved bit always present.
        assert_eq!(image, 0x0000_0297);
    }

    #[test]
    fn jcc_reads_lazy_result() {
        let (mut cpu, mut t) = setup();
        cpu.set_reg(Gpr::Ecx, 5);
        let ops = [
            DecodedOp::new(
                3,
                Op::AluRegImm32 {
                    op: AluOp::Cmp,
                    reg: Gpr::Ecx,
                    imm: 5,
                },
            ),
            DecodedOp::new(
                2,
                Op::Jcc {
                    cond: Condition::Z,
                    rel: 0x10,
                },
            ),
        ];
        assert_eq!(run(&mut cpu, &mut t, &ops).unwrap(), StepOutcome::Branched);
        assert_eq!(cpu.eip, 0x15);
    }

    #[test]
    fn run_stops_after_stack_segment_load() {
        let (mut cpu, mut t) = setup();
        let ops = [
            DecodedOp::new(5, Op::PushImm32(0x17)),
            DecodedOp::new(1, Op::PopSeg32(SegReg::Ss)),
            DecodedOp::new(1, Op::PushReg32(Gpr::Eax)),
        ];
        assert_eq!(run(&mut cpu, &mut t, &ops).unwrap(), StepOutcome::Retired);
        assert_eq!(cpu.eip, 6);
        assert_eq!(cpu.reg(Gpr::Esp), 0x8000);
    }
}
