//! General-path routines called from translated code.
//!
//! Calling convention: the backend spills the pinned registers into the [`CpuState`], passes the
//! state and the owning thread first, then the evaluated arguments in order. Control transfers
//! and segment loads return 1 when the instruction completed and 0 when a fault was delivered.

use vx86_cpu_core::{
    AluOp, Completion, CpuExit, CpuState, FlagOp, Gpr, GuestThread, SegReg, ShiftOp, Width,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Helper {
    Push16,
    Push32,
    Pop16,
    Pop32,
    /// Reads the stack top without popping.
    Peek16,
    Peek32,
    SetSegment(SegReg),
    FillFlags,
    SetFlags {
        mask: u32,
    },
    PushA {
        big: bool,
    },
    PopA {
        big: bool,
    },
    Alu {
        op: AluOp,
        reg: Gpr,
        imm: u32,
    },
    Inc(Gpr),
    Dec(Gpr),
    Shift {
        op: ShiftOp,
        reg: Gpr,
        count: u8,
    },
    Flag(FlagOp),
    CallFar {
        big: bool,
        selector: u16,
        offset: u32,
        return_eip: u32,
    },
    JmpFar {
        big: bool,
        selector: u16,
        offset: u32,
    },
    RetFar {
        big: bool,
        bytes: u16,
    },
    Iret {
        big: bool,
    },
    Enter {
        big: bool,
        bytes: u16,
        level: u8,
    },
    Leave {
        big: bool,
    },
    Lar {
        dst: Gpr,
        src: Gpr,
    },
    Lsl {
        dst: Gpr,
        src: Gpr,
    },
    Cpuid,
}

fn completed(done: Completion) -> u32 {
    match done {
        Completion::Done => 1,
        Completion::FaultDelivered => 0,
    }
}

fn arg(args: &[u32], index: usize) -> u32 {
    args.get(index).copied().unwrap_or(0)
}

impl Helper {
    /// Number of arguments the translator must pass.
    pub fn arity(self) -> usize {
        match self {
            Helper::Push16 | Helper::Push32 | Helper::SetSegment(_) | Helper::SetFlags { .. } => 1,
            _ => 0,
        }
    }

    pub fn invoke<T: GuestThread + ?Sized>(
        self,
        cpu: &mut CpuState,
        thread: &mut T,
        args: &[u32],
    ) -> Result<u32, CpuExit> {
        debug_assert_eq!(args.len(), self.arity(), "{self:?} called with {args:?}");
        let ret = match self {
            Helper::Push16 => {
                cpu.push16(thread.memory_mut(), arg(args, 0) as u16);
                0
            }
            Helper::Push32 => {
                cpu.push32(thread.memory_mut(), arg(args, 0));
                0
            }
            Helper::Pop16 => u32::from(cpu.pop16(thread.memory())),
            Helper::Pop32 => cpu.pop32(thread.memory()),
            Helper::Peek16 => u32::from(cpu.peek16(thread.memory(), 0)),
            Helper::Peek32 => cpu.peek32(thread.memory(), 0),
            Helper::SetSegment(seg) => completed(cpu.set_segment(thread, seg, arg(args, 0))?),
            Helper::FillFlags => {
                cpu.fill_flags();
                0
            }
            Helper::SetFlags { mask } => {
                cpu.set_flags(arg(args, 0), mask);
                0
            }
            Helper::PushA { big } => {
                if big {
                    cpu.push_a32(thread.memory_mut());
                } else {
                    cpu.push_a16(thread.memory_mut());
                }
                0
            }
            Helper::PopA { big } => {
                if big {
                    cpu.pop_a32(thread.memory());
                } else {
                    cpu.pop_a16(thread.memory());
                }
                0
            }
            Helper::Alu { op, reg, imm } => {
                let result = cpu.alu(op, Width::Dword, cpu.reg(reg), imm);
                if op.writes_result() {
                    cpu.set_reg(reg, result);
                }
                result
            }
            Helper::Inc(reg) => {
                let v = cpu.inc(Width::Dword, cpu.reg(reg));
                cpu.set_reg(reg, v);
                v
            }
            Helper::Dec(reg) => {
                let v = cpu.dec(Width::Dword, cpu.reg(reg));
                cpu.set_reg(reg, v);
                v
            }
            Helper::Shift { op, reg, count } => {
                let v = cpu.shift(op, Width::Dword, cpu.reg(reg), count);
                cpu.set_reg(reg, v);
                v
            }
            Helper::Flag(op) => {
                cpu.flag_op(op);
                0
            }
            Helper::CallFar {
                big,
                selector,
                offset,
                return_eip,
            } => completed(cpu.call(thread, big, u32::from(selector), offset, return_eip)?),
            Helper::JmpFar {
                big,
                selector,
                offset,
            } => completed(cpu.jmp(thread, big, u32::from(selector), offset)?),
            Helper::RetFar { big, bytes } => completed(cpu.ret(thread, big, u32::from(bytes))?),
            Helper::Iret { big } => completed(cpu.iret(thread, big)?),
            Helper::Enter { big, bytes, level } => {
                cpu.enter(thread.memory_mut(), big, u32::from(bytes), u32::from(level));
                0
            }
            Helper::Leave { big } => {
                cpu.leave(thread.memory(), big);
                0
            }
            Helper::Lar { dst, src } => {
                let v = cpu.lar(&*thread, cpu.reg(src), cpu.reg(dst));
                cpu.set_reg(dst, v);
                v
            }
            Helper::Lsl { dst, src } => {
                let v = cpu.lsl(&*thread, cpu.reg(src), cpu.reg(dst));
                cpu.set_reg(dst, v);
                v
            }
            Helper::Cpuid => {
                cpu.cpuid();
                0
            }
        };
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vx86_cpu_core::{Descriptor, Signal, SignalDisposition, StandaloneThread};

    #[test]
    fn set_segment_reports_delivered_fault_as_zero() {
        let mut cpu = CpuState::new();
        let mut thread = StandaloneThread::new(0x100);
        thread.set_descriptor(2, Descriptor::flat32());
        thread.set_disposition(Signal::Segv, SignalDisposition::Handler);

        let ok = Helper::SetSegment(SegReg::Es).invoke(&mut cpu, &mut thread, &[0x17]);
        assert_eq!(ok, Ok(1));
        let failed = Helper::SetSegment(SegReg::Es).invoke(&mut cpu, &mut thread, &[0x1F]);
        assert_eq!(failed, Ok(0));
    }

    #[test]
    fn push_then_pop() {
        let mut cpu = CpuState::new();
        let mut thread = StandaloneThread::new(0x100);
        cpu.set_reg(Gpr::Esp, 0x80);
        Helper::Push32
            .invoke(&mut cpu, &mut thread, &[0xABCD])
            .unwrap();
        assert_eq!(Helper::Peek32.invoke(&mut cpu, &mut thread, &[]), Ok(0xABCD));
        assert_eq!(Helper::Pop32.invoke(&mut cpu, &mut thread, &[]), Ok(0xABCD));
        assert_eq!(cpu.reg(Gpr::Esp), 0x80);
    }
}
