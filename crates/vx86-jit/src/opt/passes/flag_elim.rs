//! Dead lazy-flag record elimination.
//!
//! A record is dead when the next thing to touch the record slot, scanning forward, is another
//! record or a discard. Helper calls and block exits count as readers: helpers may materialize
//! flags, and an exit publishes the record to whoever runs next.

use crate::ir::HostInst;

/// Removes dead `RecordFlags` and returns how many were removed.
pub fn run(insts: &mut Vec<HostInst>) -> usize {
    // Falling off the end behaves like an exit.
    let mut live = true;
    let mut dead = vec![false; insts.len()];

    for (i, inst) in insts.iter().enumerate().rev() {
        match inst {
            HostInst::RecordFlags { .. } => {
                dead[i] = !live;
                live = false;
            }
            HostInst::DiscardLazyFlags => live = false,
            _ if inst.observes_flags() => live = true,
            _ => {}
        }
    }

    let before = insts.len();
    let mut index = 0;
    insts.retain(|_| {
        let keep = !dead[index];
        index += 1;
        keep
    });
    before - insts.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::Helper;
    use crate::ir::{ExitKind, HostAlu, HostReg, RecordKind};

    fn record(kind: RecordKind) -> HostInst {
        HostInst::RecordFlags {
            kind,
            lhs: HostReg::Dest,
            rhs: HostReg::Src,
            result: HostReg::Result,
        }
    }

    fn exit() -> HostInst {
        HostInst::Exit {
            exit: ExitKind::Completed,
        }
    }

    #[test]
    fn overwritten_record_is_removed() {
        let mut insts = vec![
            record(RecordKind::Add),
            HostInst::AluImm {
                op: HostAlu::Add,
                dst: HostReg::Eip,
                imm: 3,
            },
            record(RecordKind::Logic),
            exit(),
        ];
        assert_eq!(run(&mut insts), 1);
        assert_eq!(insts.len(), 3);
        assert_eq!(insts[1], record(RecordKind::Logic));
    }

    #[test]
    fn helper_call_keeps_record_alive() {
        let mut insts = vec![
            record(RecordKind::Add),
            HostInst::CallHelper {
                helper: Helper::FillFlags,
                args: vec![],
                ret: None,
            },
            record(RecordKind::Sub),
            exit(),
        ];
        assert_eq!(run(&mut insts), 0);
    }

    #[test]
    fn discard_kills_preceding_record() {
        let mut insts = vec![record(RecordKind::Neg), HostInst::DiscardLazyFlags, exit()];
        assert_eq!(run(&mut insts), 1);
        assert_eq!(insts, vec![HostInst::DiscardLazyFlags, exit()]);
    }

    #[test]
    fn last_record_survives_without_exit() {
        let mut insts = vec![record(RecordKind::Add)];
        assert_eq!(run(&mut insts), 0);
    }
}
