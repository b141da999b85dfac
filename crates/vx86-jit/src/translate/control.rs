//! Far control transfers and the remaining helper-only operations.

use vx86_cpu_core::Op;

use super::{Emitter, LazyKnowledge};
use crate::helpers::Helper;
use crate::ir::{ExitKind, HostInst, HostReg};

impl Emitter {
    /// Calls a transfer helper, then leaves the block: as `Faulted` when the helper delivered a
    /// fault, otherwise as `Branched` with the helper's EIP.
    fn transfer(&mut self, helper: Helper) {
        self.call(helper, vec![], Some(HostReg::Result));
        self.emit(HostInst::ExitIfZero {
            reg: HostReg::Result,
            exit: ExitKind::Faulted,
        });
        self.emit(HostInst::Exit {
            exit: ExitKind::Branched,
        });
        self.knowledge = LazyKnowledge::Unknown;
    }

    /// Returns true when the lowered code always leaves the block.
    pub(super) fn lower_control(&mut self, op: &Op, next: u32) -> bool {
        match *op {
            Op::CallFar {
                big,
                selector,
                offset,
            } => self.transfer(Helper::CallFar {
                big,
                selector,
                offset,
                return_eip: next,
            }),
            Op::JmpFar {
                big,
                selector,
                offset,
            } => self.transfer(Helper::JmpFar {
                big,
                selector,
                offset,
            }),
            Op::RetFar { big, bytes } => self.transfer(Helper::RetFar { big, bytes }),
            Op::Iret { big } => self.transfer(Helper::Iret { big }),
            Op::Enter { big, bytes, level } => {
                self.call(Helper::Enter { big, bytes, level }, vec![], None);
                return false;
            }
            Op::Leave { big } => {
                self.call(Helper::Leave { big }, vec![], None);
                return false;
            }
            Op::Lar { dst, src } | Op::Lsl { dst, src } => {
                let helper = if matches!(op, Op::Lar { .. }) {
                    Helper::Lar { dst, src }
                } else {
                    Helper::Lsl { dst, src }
                };
                self.call(helper, vec![], None);
                // Both leave ZF materialized.
                self.knowledge = LazyKnowledge::Clear;
                return false;
            }
            Op::Cpuid => {
                self.call(Helper::Cpuid, vec![], None);
                return false;
            }
            _ => unreachable!("{op:?} is not a control operation"),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn far_call_passes_unmasked_return_address() {
        let mut e = Emitter::new(false, true);
        let exits = e.lower_control(
            &Op::CallFar {
                big: false,
                selector: 0x0F,
                offset: 0x20,
            },
            0x1_0003,
        );
        assert!(exits);
        assert!(matches!(
            e.buf.insts(),
            [
                HostInst::CallHelper {
                    helper: Helper::CallFar {
                        return_eip: 0x1_0003,
                        ..
                    },
                    ret: Some(HostReg::Result),
                    ..
                },
                HostInst::ExitIfZero {
                    exit: ExitKind::Faulted,
                    ..
                },
                HostInst::Exit {
                    exit: ExitKind::Branched
                },
            ]
        ));
    }

    #[test]
    fn enter_falls_through() {
        let mut e = Emitter::new(true, true);
        assert!(!e.lower_control(
            &Op::Enter {
                big: true,
                bytes: 8,
                level: 0
            },
            4
        ));
    }
}
