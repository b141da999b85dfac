//! Integer arithmetic, flag control and conditional branches.

use vx86_cpu_core::{AluOp, Condition, CpuField, Gpr, Op};

use super::{Emitter, LazyKnowledge};
use crate::helpers::Helper;
use crate::ir::{HostAlu, HostInst, HostReg, RecordKind};

impl Emitter {
    /// `reg op imm` with an inline flag record.
    fn inline_alu(&mut self, op: AluOp, reg: Gpr, imm: u32) {
        let (host, kind) = match op {
            AluOp::Add => (HostAlu::Add, RecordKind::Add),
            AluOp::Sub | AluOp::Cmp => (HostAlu::Sub, RecordKind::Sub),
            AluOp::And => (HostAlu::And, RecordKind::Logic),
            AluOp::Or => (HostAlu::Or, RecordKind::Logic),
            AluOp::Xor => (HostAlu::Xor, RecordKind::Logic),
            AluOp::Adc | AluOp::Sbb => {
                // Carry-in needs the current CF, which only the helper can derive.
                self.call(Helper::Alu { op, reg, imm }, vec![], None);
                self.knowledge = LazyKnowledge::Unknown;
                return;
            }
        };

        self.load_field(HostReg::Dest, CpuField::Reg32(reg));
        self.emit(HostInst::MovImm {
            dst: HostReg::Src,
            imm,
        });
        self.mov(HostReg::Result, HostReg::Dest);
        self.alu_reg(host, HostReg::Result, HostReg::Src);
        self.emit(HostInst::RecordFlags {
            kind,
            lhs: HostReg::Dest,
            rhs: HostReg::Src,
            result: HostReg::Result,
        });
        if op.writes_result() {
            self.emit(HostInst::StoreField {
                field: CpuField::Reg32(reg),
                src: HostReg::Result,
            });
        }
        self.knowledge = LazyKnowledge::Pending(kind);
    }

    fn inline_neg(&mut self, reg: Gpr) {
        self.load_field(HostReg::Dest, CpuField::Reg32(reg));
        self.emit(HostInst::MovImm {
            dst: HostReg::Result,
            imm: 0,
        });
        self.alu_reg(HostAlu::Sub, HostReg::Result, HostReg::Dest);
        self.emit(HostInst::RecordFlags {
            kind: RecordKind::Neg,
            lhs: HostReg::Dest,
            rhs: HostReg::Dest,
            result: HostReg::Result,
        });
        self.emit(HostInst::StoreField {
            field: CpuField::Reg32(reg),
            src: HostReg::Result,
        });
        self.knowledge = LazyKnowledge::Pending(RecordKind::Neg);
    }

    pub(super) fn lower_alu(&mut self, op: &Op) {
        match *op {
            Op::AluRegImm32 { op, reg, imm } => self.inline_alu(op, reg, imm),
            Op::NegReg32(reg) => self.inline_neg(reg),
            Op::IncReg32(reg) => {
                self.call(Helper::Inc(reg), vec![], None);
                self.knowledge = LazyKnowledge::Unknown;
            }
            Op::DecReg32(reg) => {
                self.call(Helper::Dec(reg), vec![], None);
                self.knowledge = LazyKnowledge::Unknown;
            }
            Op::ShiftRegImm32 { op, reg, count } => {
                self.call(Helper::Shift { op, reg, count }, vec![], None);
                self.knowledge = LazyKnowledge::Unknown;
            }
            Op::Flag(flag) => {
                self.call(Helper::Flag(flag), vec![], None);
                self.knowledge = LazyKnowledge::Clear;
            }
            _ => unreachable!("{op:?} is not an arithmetic operation"),
        }
    }

    /// Jcc: materializes the flags, then leaves the block for one of two static targets.
    pub(super) fn lower_jcc(&mut self, cond: Condition, rel: i32, next: u32) {
        self.fill_flags();
        self.load_field(HostReg::Src, CpuField::Flags);
        let taken = self.mask_eip(next.wrapping_add(rel as u32));
        let not_taken = self.mask_eip(next);
        self.emit(HostInst::ExitBranch {
            cond,
            flags: HostReg::Src,
            taken,
            not_taken,
        });
    }
}
