//! Decoded guest operations, as produced by the external decoder.

use serde::{Deserialize, Serialize};

use crate::flags::{AluOp, ShiftOp};
use crate::state::{
    CpuState, Gpr, SegReg, EFLAGS_CF, EFLAGS_OF, EFLAGS_PF, EFLAGS_SF, EFLAGS_ZF,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaledIndex {
    pub reg: Gpr,
    /// log2 of the scale factor.
    #[serde(default)]
    pub shift: u8,
}

/// `seg:[base + index << shift + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveAddress {
    pub seg: SegReg,
    #[serde(default)]
    pub base: Option<Gpr>,
    #[serde(default)]
    pub index: Option<ScaledIndex>,
    #[serde(default)]
    pub disp: u32,
    /// 16-bit address size: the offset wraps at 64K before the segment base is added.
    #[serde(default)]
    pub addr16: bool,
}

impl EffectiveAddress {
    pub fn offset(&self, cpu: &CpuState) -> u32 {
        let mut offset = self.disp;
        if let Some(base) = self.base {
            offset = offset.wrapping_add(cpu.reg(base));
        }
        if let Some(index) = self.index {
            offset = offset.wrapping_add(cpu.reg(index.reg) << (index.shift & 3));
        }
        if self.addr16 {
            offset &= 0xFFFF;
        }
        offset
    }

    pub fn linear(&self, cpu: &CpuState) -> u32 {
        cpu.seg(self.seg).base.wrapping_add(self.offset(cpu))
    }

    pub fn uses(&self, reg: Gpr) -> bool {
        self.base == Some(reg) || self.index.is_some_and(|i| i.reg == reg)
    }
}

/// Jcc condition codes, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    O,
    No,
    B,
    Nb,
    Z,
    Nz,
    Be,
    Nbe,
    S,
    Ns,
    P,
    Np,
    L,
    Nl,
    Le,
    Nle,
}

impl Condition {
    /// Evaluates the condition against a materialized flags image.
    pub fn test(self, flags: u32) -> bool {
        let bit = |b: u32| flags & b != 0;
        match self {
            Condition::O => bit(EFLAGS_OF),
            Condition::No => !bit(EFLAGS_OF),
            Condition::B => bit(EFLAGS_CF),
            Condition::Nb => !bit(EFLAGS_CF),
            Condition::Z => bit(EFLAGS_ZF),
            Condition::Nz => !bit(EFLAGS_ZF),
            Condition::Be => bit(EFLAGS_CF) || bit(EFLAGS_ZF),
            Condition::Nbe => !(bit(EFLAGS_CF) || bit(EFLAGS_ZF)),
            Condition::S => bit(EFLAGS_SF),
            Condition::Ns => !bit(EFLAGS_SF),
            Condition::P => bit(EFLAGS_PF),
            Condition::Np => !bit(EFLAGS_PF),
            Condition::L => bit(EFLAGS_SF) != bit(EFLAGS_OF),
            Condition::Nl => bit(EFLAGS_SF) == bit(EFLAGS_OF),
            Condition::Le => bit(EFLAGS_ZF) || bit(EFLAGS_SF) != bit(EFLAGS_OF),
            Condition::Nle => !bit(EFLAGS_ZF) && bit(EFLAGS_SF) == bit(EFLAGS_OF),
        }
    }
}

/// Single-flag control instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagOp {
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    PushReg16(Gpr),
    PushReg32(Gpr),
    PopReg16(Gpr),
    PopReg32(Gpr),
    PushMem16(EffectiveAddress),
    PushMem32(EffectiveAddress),
    PopMem16(EffectiveAddress),
    PopMem32(EffectiveAddress),
    PushSeg16(SegReg),
    PushSeg32(SegReg),
    PopSeg16(SegReg),
    PopSeg32(SegReg),
    PushImm16(u16),
    PushImm32(u32),
    PushA16,
    PushA32,
    PopA16,
    PopA32,
    Pushf16,
    Pushf32,
    Popf16,
    Popf32,
    AluRegImm32 {
        op: AluOp,
        reg: Gpr,
        imm: u32,
    },
    IncReg32(Gpr),
    DecReg32(Gpr),
    NegReg32(Gpr),
    ShiftRegImm32 {
        op: ShiftOp,
        reg: Gpr,
        count: u8,
    },
    Flag(FlagOp),
    Jcc {
        cond: Condition,
        rel: i32,
    },
    CallFar {
        big: bool,
        selector: u16,
        offset: u32,
    },
    JmpFar {
        big: bool,
        selector: u16,
        offset: u32,
    },
    RetFar {
        big: bool,
        #[serde(default)]
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

impl Op {
    /// Operations after which the rest of a translated block cannot be assumed to run.
    ///
    /// POP SS also ends a block: it can fault, and a successful load changes the stack width
    /// assumptions later operations were translated under.
    pub fn is_block_end(&self) -> bool {
        matches!(
            self,
            Op::Jcc { .. }
                | Op::CallFar { .. }
                | Op::JmpFar { .. }
                | Op::RetFar { .. }
                | Op::Iret { .. }
                | Op::PopSeg16(SegReg::Ss)
                | Op::PopSeg32(SegReg::Ss)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedOp {
    /// Encoded length in bytes.
    pub len: u8,
    pub op: Op,
}

impl DecodedOp {
    pub fn new(len: u8, op: Op) -> Self {
        Self { len, op }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_conditions() {
        assert!(Condition::L.test(EFLAGS_SF));
        assert!(!Condition::L.test(EFLAGS_SF | EFLAGS_OF));
        assert!(Condition::Le.test(EFLAGS_ZF));
        assert!(Condition::Nle.test(0));
        assert!(Condition::Be.test(EFLAGS_CF));
    }

    #[test]
    fn addr16_offsets_wrap() {
        let mut cpu = CpuState::new();
        cpu.set_reg(Gpr::Ebx, 0xFFFF);
        let ea = EffectiveAddress {
            seg: SegReg::Ds,
            base: Some(Gpr::Ebx),
            index: None,
            disp: 2,
            addr16: true,
        };
        assert_eq!(ea.offset(&cpu), 1);
    }

    #[test]
    fn ops_deserialize_from_scenario_json() {
        let op: DecodedOp =
            serde_json::from_str(r#"{"len": 1, "op": {"pop_seg32": "ds"}}"#).unwrap();
        assert_eq!(op, DecodedOp::new(1, Op::PopSeg32(SegReg::Ds)));
        let op: Op =
            serde_json::from_str(r#"{"alu_reg_imm32": {"op": "add", "reg": "eax", "imm": 1}}"#)
                .unwrap();
        assert!(matches!(op, Op::AluRegImm32 { op: AluOp::Add, .. }));
    }
}
