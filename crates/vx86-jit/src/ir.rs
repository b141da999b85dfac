//! Host instruction set emitted by the translator.
//!
//! The host is a small register machine: six 32-bit registers, two of which (`Esp`, `Eip`) are
//! pinned to guest state for the whole block, plus loads/stores of named [`CpuField`]s and guest
//! linear memory, and calls into [`Helper`] routines for everything not worth inlining.

use vx86_cpu_core::{Condition, CpuField, Width};

use crate::helpers::Helper;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostReg {
    /// Computed guest linear address.
    Address,
    Src,
    Dest,
    /// Return value of the last helper call.
    Result,
    /// Pinned copy of guest ESP.
    Esp,
    /// Pinned copy of guest EIP.
    Eip,
}

impl HostReg {
    pub const COUNT: usize = 6;

    pub fn index(self) -> usize {
        match self {
            HostReg::Address => 0,
            HostReg::Src => 1,
            HostReg::Dest => 2,
            HostReg::Result => 3,
            HostReg::Esp => 4,
            HostReg::Eip => 5,
        }
    }
}

/// A helper argument, tagged by where its value comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostArg {
    Imm(u32),
    Reg(HostReg),
    /// Read from the state at call time.
    Field(CpuField),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostAlu {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
}

impl HostAlu {
    pub fn apply(self, a: u32, b: u32) -> u32 {
        match self {
            HostAlu::Add => a.wrapping_add(b),
            HostAlu::Sub => a.wrapping_sub(b),
            HostAlu::And => a & b,
            HostAlu::Or => a | b,
            HostAlu::Xor => a ^ b,
            HostAlu::Shl => a.wrapping_shl(b & 31),
        }
    }
}

/// Shape of an inline lazy-flag record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Add,
    Sub,
    Logic,
    Neg,
}

/// How a block hands control back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitKind {
    /// Fell off the end; EIP names the next operation.
    Completed,
    /// A control transfer or taken/untaken branch set EIP.
    Branched,
    /// A helper delivered a fault; EIP names the faulting operation.
    Faulted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostInst {
    LoadField {
        dst: HostReg,
        field: CpuField,
    },
    StoreField {
        field: CpuField,
        src: HostReg,
    },
    Mov {
        dst: HostReg,
        src: HostReg,
    },
    MovImm {
        dst: HostReg,
        imm: u32,
    },
    /// `dst = dst op imm`.
    AluImm {
        op: HostAlu,
        dst: HostReg,
        imm: u32,
    },
    /// `dst = dst op src`.
    AluReg {
        op: HostAlu,
        dst: HostReg,
        src: HostReg,
    },
    Load {
        dst: HostReg,
        addr: HostReg,
        width: Width,
    },
    Store {
        addr: HostReg,
        src: HostReg,
        width: Width,
    },
    StoreImm {
        addr: HostReg,
        imm: u32,
        width: Width,
    },
    CallHelper {
        helper: Helper,
        args: Vec<HostArg>,
        ret: Option<HostReg>,
    },
    /// Leaves a 32-bit lazy-flag record describing `result = lhs op rhs`.
    RecordFlags {
        kind: RecordKind,
        lhs: HostReg,
        rhs: HostReg,
        result: HostReg,
    },
    DiscardLazyFlags,
    /// Exits with `exit` when `reg` is zero.
    ExitIfZero {
        reg: HostReg,
        exit: ExitKind,
    },
    /// Sets EIP to `taken` or `not_taken` depending on `cond` over the flags in `flags`, then exits.
    ExitBranch {
        cond: Condition,
        flags: HostReg,
        taken: u32,
        not_taken: u32,
    },
    Exit {
        exit: ExitKind,
    },
}

impl HostInst {
    /// Whether executing this instruction can observe the pending lazy-flag record.
    pub fn observes_flags(&self) -> bool {
        match self {
            HostInst::LoadField { field, .. } | HostInst::StoreField { field, .. } => {
                *field == CpuField::Flags
            }
            HostInst::CallHelper { .. }
            | HostInst::ExitIfZero { .. }
            | HostInst::ExitBranch { .. }
            | HostInst::Exit { .. } => true,
            _ => false,
        }
    }
}
