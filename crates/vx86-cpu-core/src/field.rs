//! Named access to individual state slots.
//!
//! The code emitter never computes offsets into [`CpuState`]. It names a [`CpuField`] and the
//! backend goes through [`CpuState::read_field`] / [`CpuState::write_field`], which use the same
//! register views as the interpreter.

use serde::{Deserialize, Serialize};

use crate::state::{CpuState, Gpr, Reg8, SegReg, Width, FMASK_ALL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "field", content = "of")]
pub enum CpuField {
    Reg32(Gpr),
    Reg16(Gpr),
    Reg8(Reg8),
    SegSelector(SegReg),
    SegBase(SegReg),
    Eip,
    /// The flags image; condition bits must be materialized before it is read.
    Flags,
    Df,
    Cpl,
    StackMask,
    StackNotMask,
    /// Non-zero when the code segment is 32-bit.
    Big,
}

/// A host register that permanently shadows part of the state while a block runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinnedReg {
    Esp,
    Eip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("{0:?} can only change through a control transfer")]
    ReadOnly(CpuField),
}

impl CpuField {
    pub fn width(self) -> Width {
        match self {
            CpuField::Reg8(_) => Width::Byte,
            CpuField::Reg16(_) | CpuField::SegSelector(_) => Width::Word,
            _ => Width::Dword,
        }
    }

    /// The pinned host register this field overlaps, if any.
    pub fn pinned_alias(self) -> Option<PinnedReg> {
        match self {
            CpuField::Reg32(Gpr::Esp) | CpuField::Reg16(Gpr::Esp) => Some(PinnedReg::Esp),
            CpuField::Eip => Some(PinnedReg::Eip),
            _ => None,
        }
    }

    /// CPL, segments and the stack masks are only written by segment loads and control
    /// transfers, which run as helpers.
    pub fn is_writable(self) -> bool {
        !matches!(
            self,
            CpuField::SegSelector(_)
                | CpuField::SegBase(_)
                | CpuField::Cpl
                | CpuField::StackMask
                | CpuField::StackNotMask
                | CpuField::Big
                | CpuField::Df
        )
    }
}

impl CpuState {
    pub fn read_field(&self, field: CpuField) -> u32 {
        match field {
            CpuField::Reg32(r) => self.reg(r),
            CpuField::Reg16(r) => u32::from(self.reg16(r)),
            CpuField::Reg8(r) => u32::from(self.reg8(r)),
            CpuField::SegSelector(s) => u32::from(self.seg(s).selector),
            CpuField::SegBase(s) => self.seg(s).base,
            CpuField::Eip => self.eip,
            CpuField::Flags => self.flags(),
            CpuField::Df => self.df as u32,
            CpuField::Cpl => u32::from(self.cpl),
            CpuField::StackMask => self.stack_mask,
            CpuField::StackNotMask => self.stack_not_mask,
            CpuField::Big => u32::from(self.big),
        }
    }

    /// Writes `value`, truncated to the field's width.
    pub fn write_field(&mut self, field: CpuField, value: u32) -> Result<(), FieldError> {
        match field {
            CpuField::Reg32(r) => self.set_reg(r, value),
            CpuField::Reg16(r) => self.set_reg16(r, value as u16),
            CpuField::Reg8(r) => self.set_reg8(r, value as u8),
            CpuField::Eip => self.eip = value,
            CpuField::Flags => self.set_flags(value, FMASK_ALL),
            other => return Err(FieldError::ReadOnly(other)),
        }
        Ok(())
    }
}
