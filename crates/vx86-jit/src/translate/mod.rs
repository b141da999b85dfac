//! Guest block → host instructions.
//!
//! Each [`DecodedOp`] is lowered to host code reproducing [`vx86_cpu_core::interp::step`],
//! followed by code advancing the pinned EIP by the operation's length. Stack accesses take one of
//! two shapes:
//! - fast path: when the process has never reloaded SS nor narrowed the stack mask, 32-bit pushes
//!   and pops are inlined as arithmetic on the pinned ESP plus a memory access
//! - general path: a [`Helper`] call that applies the segment base and stack mask
//!
//! Translation stops after the first operation that ends a block.

mod alu;
mod control;
mod pushpop;

use tracing::debug;
use vx86_cpu_core::{CpuField, CpuState, DecodedOp, GuestThread, Op};

use crate::buffer::{CodeBuffer, TranslatedBlock};
use crate::config::EmitterConfig;
use crate::helpers::Helper;
use crate::ir::{ExitKind, HostAlu, HostArg, HostInst, HostReg, RecordKind};
use crate::opt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error("no operations to translate")]
    Empty,
    #[error("block of {len} operations exceeds the limit of {max}")]
    TooLong { len: usize, max: usize },
}

/// What the translator knows about the state's lazy-flag record at the current point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyKnowledge {
    /// Block entry, or after a helper that may leave a record.
    Unknown,
    /// No record is pending; the flags image is authoritative.
    Clear,
    /// An inline operation left a record of this shape.
    Pending(RecordKind),
}

pub(crate) struct Emitter {
    buf: CodeBuffer,
    code32: bool,
    flat_stack: bool,
    used_fast_stack: bool,
    knowledge: LazyKnowledge,
}

impl Emitter {
    fn new(code32: bool, flat_stack: bool) -> Self {
        Self {
            buf: CodeBuffer::new(),
            code32,
            flat_stack,
            used_fast_stack: false,
            knowledge: LazyKnowledge::Unknown,
        }
    }

    pub(crate) fn emit(&mut self, inst: HostInst) {
        self.buf.emit(inst);
    }

    pub(crate) fn call(&mut self, helper: Helper, args: Vec<HostArg>, ret: Option<HostReg>) {
        debug_assert_eq!(args.len(), helper.arity());
        self.emit(HostInst::CallHelper { helper, args, ret });
    }

    pub(crate) fn load_field(&mut self, dst: HostReg, field: CpuField) {
        self.emit(HostInst::LoadField { dst, field });
    }

    pub(crate) fn alu_imm(&mut self, op: HostAlu, dst: HostReg, imm: u32) {
        self.emit(HostInst::AluImm { op, dst, imm });
    }

    pub(crate) fn alu_reg(&mut self, op: HostAlu, dst: HostReg, src: HostReg) {
        self.emit(HostInst::AluReg { op, dst, src });
    }

    pub(crate) fn mov(&mut self, dst: HostReg, src: HostReg) {
        self.emit(HostInst::Mov { dst, src });
    }

    /// Materializes the flags image unless no record can be pending.
    pub(crate) fn fill_flags(&mut self) {
        if self.knowledge != LazyKnowledge::Clear {
            self.call(Helper::FillFlags, vec![], None);
        }
        self.knowledge = LazyKnowledge::Clear;
    }

    /// Truncates a computed EIP to the code segment's width.
    pub(crate) fn mask_eip(&self, eip: u32) -> u32 {
        if self.code32 {
            eip
        } else {
            eip & 0xFFFF
        }
    }

    fn advance_eip(&mut self, len: u8) {
        self.alu_imm(HostAlu::Add, HostReg::Eip, u32::from(len));
        if !self.code32 {
            self.alu_imm(HostAlu::And, HostReg::Eip, 0xFFFF);
        }
    }

    /// Lowers one operation at `eip`. Returns true when the emitted code always leaves the block.
    fn lower(&mut self, op: &DecodedOp, eip: u32) -> bool {
        let next = eip.wrapping_add(u32::from(op.len));
        match op.op {
            Op::PushReg16(_)
            | Op::PushReg32(_)
            | Op::PopReg16(_)
            | Op::PopReg32(_)
            | Op::PushMem16(_)
            | Op::PushMem32(_)
            | Op::PopMem16(_)
            | Op::PopMem32(_)
            | Op::PushSeg16(_)
            | Op::PushSeg32(_)
            | Op::PopSeg16(_)
            | Op::PopSeg32(_)
            | Op::PushImm16(_)
            | Op::PushImm32(_)
            | Op::PushA16
            | Op::PushA32
            | Op::PopA16
            | Op::PopA32
            | Op::Pushf16
            | Op::Pushf32
            | Op::Popf16
            | Op::Popf32 => {
                self.lower_stack(&op.op);
                false
            }
            Op::AluRegImm32 { .. }
            | Op::IncReg32(_)
            | Op::DecReg32(_)
            | Op::NegReg32(_)
            | Op::ShiftRegImm32 { .. }
            | Op::Flag(_) => {
                self.lower_alu(&op.op);
                false
            }
            Op::Jcc { cond, rel } => {
                self.lower_jcc(cond, rel, next);
                true
            }
            _ => self.lower_control(&op.op, next),
        }
    }

    fn finish(self) -> (CodeBuffer, bool) {
        (self.buf, self.used_fast_stack)
    }
}

/// Translates the block starting at `cpu.eip`.
///
/// `ops` are the decoded operations from that address on; only the prefix up to and including
/// the first block-ending operation is translated.
pub fn translate_block<T: GuestThread + ?Sized>(
    cpu: &CpuState,
    thread: &T,
    ops: &[DecodedOp],
    config: &EmitterConfig,
) -> Result<TranslatedBlock, TranslateError> {
    if ops.is_empty() {
        return Err(TranslateError::Empty);
    }
    let len = ops
        .iter()
        .position(|op| op.op.is_block_end())
        .map_or(ops.len(), |end| end + 1);
    if len > config.max_block_ops {
        return Err(TranslateError::TooLong {
            len,
            max: config.max_block_ops,
        });
    }

    let flat_stack = config.stack_fast_path && thread.process_flags().flat_stack();
    debug!(
        start_eip = cpu.eip,
        path = if flat_stack { "fast" } else { "general" },
        "stack access path"
    );

    let mut emitter = Emitter::new(cpu.big, flat_stack);
    let mut eip = cpu.eip;
    let mut exited = false;
    for op in &ops[..len] {
        exited = emitter.lower(op, eip);
        if !exited {
            emitter.advance_eip(op.len);
        }
        eip = emitter.mask_eip(eip.wrapping_add(u32::from(op.len)));
    }
    if !exited {
        emitter.emit(HostInst::Exit {
            exit: ExitKind::Completed,
        });
    }

    let (mut buf, used_fast_stack) = emitter.finish();
    if config.elide_dead_flags {
        opt::optimize(buf.insts_mut());
    }
    Ok(buf.publish(cpu.eip, cpu.big, used_fast_stack, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vx86_cpu_core::{AluOp, Condition, Gpr, SegReg, StandaloneThread};

    fn translate(ops: &[DecodedOp], config: &EmitterConfig) -> TranslatedBlock {
        let cpu = CpuState::new();
        let thread = StandaloneThread::new(0x100);
        translate_block(&cpu, &thread, ops, config).unwrap()
    }

    #[test]
    fn empty_and_oversized_blocks_are_rejected() {
        let cpu = CpuState::new();
        let thread = StandaloneThread::new(0x100);
        let config = EmitterConfig {
            max_block_ops: 2,
            ..EmitterConfig::default()
        };
        assert_eq!(
            translate_block(&cpu, &thread, &[], &config),
            Err(TranslateError::Empty)
        );
        let ops = [DecodedOp::new(1, Op::PushReg32(Gpr::Eax)); 3];
        assert_eq!(
            translate_block(&cpu, &thread, &ops, &config),
            Err(TranslateError::TooLong { len: 3, max: 2 })
        );
    }

    #[test]
    fn translation_stops_at_block_end() {
        let ops = [
            DecodedOp::new(1, Op::PopSeg32(SegReg::Ss)),
            DecodedOp::new(1, Op::PushReg32(Gpr::Eax)),
        ];
        let block = translate(&ops, &EmitterConfig::default());
        assert_eq!(block.guest_ops, 1);
        assert_eq!(
            block.insts().last(),
            Some(&HostInst::Exit {
                exit: ExitKind::Completed
            })
        );
    }

    #[test]
    fn fast_path_inlines_push() {
        let ops = [DecodedOp::new(1, Op::PushReg32(Gpr::Eax))];
        let block = translate(&ops, &EmitterConfig::default());
        assert!(block.assumes_flat_stack);
        assert!(!block
            .insts()
            .iter()
            .any(|i| matches!(i, HostInst::CallHelper { .. })));

        let general = EmitterConfig {
            stack_fast_path: false,
            ..EmitterConfig::default()
        };
        let block = translate(&ops, &general);
        assert!(!block.assumes_flat_stack);
        assert!(block.insts().iter().any(|i| matches!(
            i,
            HostInst::CallHelper {
                helper: Helper::Push32,
                ..
            }
        )));
    }

    #[test]
    fn jcc_targets_are_static() {
        let ops = [DecodedOp::new(
            2,
            Op::Jcc {
                cond: Condition::Nz,
                rel: -4,
            },
        )];
        let block = translate(&ops, &EmitterConfig::default());
        assert_eq!(
            block.insts().last(),
            Some(&HostInst::ExitBranch {
                cond: Condition::Nz,
                flags: HostReg::Src,
                taken: 2u32.wrapping_sub(4),
                not_taken: 2,
            })
        );
    }

    #[test]
    fn pushf_after_pushf_skips_second_fill() {
        let ops = [
            DecodedOp::new(
                3,
                Op::AluRegImm32 {
                    op: AluOp::Add,
                    reg: Gpr::Eax,
                    imm: 1,
                },
            ),
            DecodedOp::new(1, Op::Pushf32),
            DecodedOp::new(1, Op::Pushf32),
        ];
        let block = translate(&ops, &EmitterConfig::default());
        let fills = block
            .insts()
            .iter()
            .filter(|i| {
                matches!(
                    i,
                    HostInst::CallHelper {
                        helper: Helper::FillFlags,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(fills, 1);
    }
}
