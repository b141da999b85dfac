//! Stack operations: register/memory/segment/immediate push and pop, PUSHA/POPA, PUSHF/POPF.

use vx86_cpu_core::interp::PUSHF32_MASK;
use vx86_cpu_core::state::FMASK_ALL;
use vx86_cpu_core::{CpuField, EffectiveAddress, Op, SegReg, Width};

use super::{Emitter, LazyKnowledge};
use crate::helpers::Helper;
use crate::ir::{ExitKind, HostAlu, HostArg, HostInst, HostReg};

impl Emitter {
    fn fast_stack(&mut self, width: Width) -> bool {
        let fast = self.flat_stack && width == Width::Dword;
        if fast {
            self.used_fast_stack = true;
        }
        fast
    }

    /// Pushes `value` at `width`.
    fn push(&mut self, value: HostArg, width: Width) {
        if !self.fast_stack(width) {
            let helper = match width {
                Width::Dword => Helper::Push32,
                _ => Helper::Push16,
            };
            self.call(helper, vec![value], None);
            return;
        }

        self.mov(HostReg::Address, HostReg::Esp);
        self.alu_imm(HostAlu::Sub, HostReg::Address, width.bytes());
        match value {
            HostArg::Imm(imm) => self.emit(HostInst::StoreImm {
                addr: HostReg::Address,
                imm,
                width,
            }),
            HostArg::Reg(src) => self.emit(HostInst::Store {
                addr: HostReg::Address,
                src,
                width,
            }),
            // Read before ESP moves: PUSH ESP stores the old value.
            HostArg::Field(field) => {
                self.load_field(HostReg::Src, field);
                self.emit(HostInst::Store {
                    addr: HostReg::Address,
                    src: HostReg::Src,
                    width,
                });
            }
        }
        self.mov(HostReg::Esp, HostReg::Address);
    }

    /// Pops a `width` value into `dst`.
    fn pop(&mut self, dst: HostReg, width: Width) {
        if !self.fast_stack(width) {
            let helper = match width {
                Width::Dword => Helper::Pop32,
                _ => Helper::Pop16,
            };
            self.call(helper, vec![], Some(dst));
            return;
        }

        self.emit(HostInst::Load {
            dst,
            addr: HostReg::Esp,
            width,
        });
        self.alu_imm(HostAlu::Add, HostReg::Esp, width.bytes());
    }

    /// Reads the stack top into `dst` without moving ESP.
    fn peek(&mut self, dst: HostReg, width: Width) {
        if self.fast_stack(width) {
            self.emit(HostInst::Load {
                dst,
                addr: HostReg::Esp,
                width,
            });
        } else {
            let helper = match width {
                Width::Dword => Helper::Peek32,
                _ => Helper::Peek16,
            };
            self.call(helper, vec![], Some(dst));
        }
    }

    /// Leaves the linear address of `ea` in `Address`, using `Dest` as scratch.
    pub(crate) fn effective_address(&mut self, ea: &EffectiveAddress) {
        self.emit(HostInst::MovImm {
            dst: HostReg::Address,
            imm: ea.disp,
        });
        if let Some(base) = ea.base {
            self.load_field(HostReg::Dest, CpuField::Reg32(base));
            self.alu_reg(HostAlu::Add, HostReg::Address, HostReg::Dest);
        }
        if let Some(index) = ea.index {
            self.load_field(HostReg::Dest, CpuField::Reg32(index.reg));
            let shift = index.shift & 3;
            if shift != 0 {
                self.alu_imm(HostAlu::Shl, HostReg::Dest, u32::from(shift));
            }
            self.alu_reg(HostAlu::Add, HostReg::Address, HostReg::Dest);
        }
        if ea.addr16 {
            self.alu_imm(HostAlu::And, HostReg::Address, 0xFFFF);
        }
        self.load_field(HostReg::Dest, CpuField::SegBase(ea.seg));
        self.alu_reg(HostAlu::Add, HostReg::Address, HostReg::Dest);
    }

    /// POP into a segment register. The slot is only released once the load succeeded; a
    /// delivered fault leaves the block with ESP and EIP untouched.
    fn pop_segment(&mut self, seg: SegReg, width: Width) {
        self.peek(HostReg::Src, width);
        self.call(
            Helper::SetSegment(seg),
            vec![HostArg::Reg(HostReg::Src)],
            Some(HostReg::Result),
        );
        self.emit(HostInst::ExitIfZero {
            reg: HostReg::Result,
            exit: ExitKind::Faulted,
        });

        // The load may have changed the stack width; always step under the live masks.
        self.load_field(HostReg::Dest, CpuField::StackMask);
        self.mov(HostReg::Address, HostReg::Esp);
        self.alu_imm(HostAlu::Add, HostReg::Address, width.bytes());
        self.alu_reg(HostAlu::And, HostReg::Address, HostReg::Dest);
        self.load_field(HostReg::Dest, CpuField::StackNotMask);
        self.alu_reg(HostAlu::And, HostReg::Esp, HostReg::Dest);
        self.alu_reg(HostAlu::Or, HostReg::Esp, HostReg::Address);
    }

    fn pushf(&mut self, width: Width) {
        self.fill_flags();
        self.load_field(HostReg::Src, CpuField::Flags);
        if width == Width::Dword {
            self.alu_imm(HostAlu::And, HostReg::Src, PUSHF32_MASK);
        }
        self.push(HostArg::Reg(HostReg::Src), width);
    }

    fn popf(&mut self, width: Width) {
        self.pop(HostReg::Src, width);
        let mask = match width {
            Width::Dword => FMASK_ALL,
            _ => FMASK_ALL & 0xFFFF,
        };
        self.emit(HostInst::DiscardLazyFlags);
        self.call(
            Helper::SetFlags { mask },
            vec![HostArg::Reg(HostReg::Src)],
            None,
        );
        self.knowledge = LazyKnowledge::Clear;
    }

    pub(super) fn lower_stack(&mut self, op: &Op) {
        match *op {
            Op::PushReg16(r) => self.push(HostArg::Field(CpuField::Reg16(r)), Width::Word),
            Op::PushReg32(r) => self.push(HostArg::Field(CpuField::Reg32(r)), Width::Dword),
            Op::PopReg16(r) => {
                self.pop(HostReg::Src, Width::Word);
                self.emit(HostInst::StoreField {
                    field: CpuField::Reg16(r),
                    src: HostReg::Src,
                });
            }
            Op::PopReg32(r) => {
                self.pop(HostReg::Src, Width::Dword);
                self.emit(HostInst::StoreField {
                    field: CpuField::Reg32(r),
                    src: HostReg::Src,
                });
            }
            Op::PushMem16(ea) | Op::PushMem32(ea) => {
                let width = if matches!(op, Op::PushMem32(_)) {
                    Width::Dword
                } else {
                    Width::Word
                };
                self.effective_address(&ea);
                self.emit(HostInst::Load {
                    dst: HostReg::Src,
                    addr: HostReg::Address,
                    width,
                });
                self.push(HostArg::Reg(HostReg::Src), width);
            }
            // ESP is incremented before the destination address is formed.
            Op::PopMem16(ea) | Op::PopMem32(ea) => {
                let width = if matches!(op, Op::PopMem32(_)) {
                    Width::Dword
                } else {
                    Width::Word
                };
                self.pop(HostReg::Src, width);
                self.effective_address(&ea);
                self.emit(HostInst::Store {
                    addr: HostReg::Address,
                    src: HostReg::Src,
                    width,
                });
            }
            Op::PushSeg16(s) => self.push(HostArg::Field(CpuField::SegSelector(s)), Width::Word),
            Op::PushSeg32(s) => self.push(HostArg::Field(CpuField::SegSelector(s)), Width::Dword),
            Op::PopSeg16(s) => self.pop_segment(s, Width::Word),
            Op::PopSeg32(s) => self.pop_segment(s, Width::Dword),
            Op::PushImm16(v) => self.push(HostArg::Imm(u32::from(v)), Width::Word),
            Op::PushImm32(v) => self.push(HostArg::Imm(v), Width::Dword),
            Op::PushA16 => self.call(Helper::PushA { big: false }, vec![], None),
            Op::PushA32 => self.call(Helper::PushA { big: true }, vec![], None),
            Op::PopA16 => self.call(Helper::PopA { big: false }, vec![], None),
            Op::PopA32 => self.call(Helper::PopA { big: true }, vec![], None),
            Op::Pushf16 => self.pushf(Width::Word),
            Op::Pushf32 => self.pushf(Width::Dword),
            Op::Popf16 => self.popf(Width::Word),
            Op::Popf32 => self.popf(Width::Dword),
            _ => unreachable!("{op:?} is not a stack operation"),
        }
    }
}
