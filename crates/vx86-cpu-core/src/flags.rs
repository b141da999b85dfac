//! Lazy condition-flag engine.
//!
//! Arithmetic does not compute SF/ZF/AF/PF/CF/OF eagerly. It stores a [`LazyFlags`] record
//! describing the operation instead, and the flags are only derived when something reads them.
//!
//! The `fill_flags*` entry points flush the record into `flags`. The partial variants exist for
//! callers that are about to overwrite one flag themselves: the excluded bit is left *cleared*,
//! not preserved, so the caller must write it next.
//!
//! Direct setters require that no record is pending. Calling one while a record is pending is a
//! translation defect and trips a debug assertion; it is never reconciled by flushing.

use serde::{Deserialize, Serialize};

use crate::state::{
    CpuState, Width, EFLAGS_AF, EFLAGS_CF, EFLAGS_DF, EFLAGS_OF, EFLAGS_PF, EFLAGS_RESERVED1,
    EFLAGS_SF, EFLAGS_ZF, FMASK_TEST,
};

/// A pending flag computation, or `None` when `flags` is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LazyFlags {
    #[default]
    None,
    Add {
        width: Width,
        lhs: u32,
        rhs: u32,
        result: u32,
    },
    Adc {
        width: Width,
        lhs: u32,
        rhs: u32,
        carry: bool,
        result: u32,
    },
    Sub {
        width: Width,
        lhs: u32,
        rhs: u32,
        result: u32,
    },
    Sbb {
        width: Width,
        lhs: u32,
        rhs: u32,
        borrow: bool,
        result: u32,
    },
    Logic {
        width: Width,
        result: u32,
    },
    /// INC leaves CF alone, so the record carries the CF that was current.
    Inc {
        width: Width,
        result: u32,
        carry: bool,
    },
    Dec {
        width: Width,
        result: u32,
        carry: bool,
    },
    Neg {
        width: Width,
        src: u32,
        result: u32,
    },
    Shl {
        width: Width,
        value: u32,
        count: u8,
        result: u32,
    },
    Shr {
        width: Width,
        value: u32,
        count: u8,
        result: u32,
    },
    Sar {
        width: Width,
        value: u32,
        count: u8,
        result: u32,
    },
}

fn parity(value: u32) -> bool {
    (value as u8).count_ones() % 2 == 0
}

fn sign_extend(value: u32, width: Width) -> i32 {
    match width {
        Width::Byte => value as u8 as i8 as i32,
        Width::Word => value as u16 as i16 as i32,
        Width::Dword => value as i32,
    }
}

impl LazyFlags {
    pub fn is_pending(&self) -> bool {
        !matches!(self, LazyFlags::None)
    }

    fn width_and_result(&self) -> Option<(Width, u32)> {
        match *self {
            LazyFlags::None => None,
            LazyFlags::Add { width, result, .. }
            | LazyFlags::Adc { width, result, .. }
            | LazyFlags::Sub { width, result, .. }
            | LazyFlags::Sbb { width, result, .. }
            | LazyFlags::Logic { width, result }
            | LazyFlags::Inc { width, result, .. }
            | LazyFlags::Dec { width, result, .. }
            | LazyFlags::Neg { width, result, .. }
            | LazyFlags::Shl { width, result, .. }
            | LazyFlags::Shr { width, result, .. }
            | LazyFlags::Sar { width, result, .. } => Some((width, result & width.mask())),
        }
    }

    fn cf(&self) -> bool {
        match *self {
            LazyFlags::None | LazyFlags::Logic { .. } => false,
            LazyFlags::Add {
                width, lhs, result, ..
            } => (result & width.mask()) < (lhs & width.mask()),
            LazyFlags::Adc {
                width,
                lhs,
                carry,
                result,
                ..
            } => {
                let (lhs, result) = (lhs & width.mask(), result & width.mask());
                result < lhs || (carry && result == lhs)
            }
            LazyFlags::Sub { width, lhs, rhs, .. } => (lhs & width.mask()) < (rhs & width.mask()),
            LazyFlags::Sbb {
                width,
                lhs,
                rhs,
                borrow,
                ..
            } => {
                u64::from(lhs & width.mask()) < u64::from(rhs & width.mask()) + u64::from(borrow)
            }
            LazyFlags::Inc { carry, .. } | LazyFlags::Dec { carry, .. } => carry,
            LazyFlags::Neg { width, src, .. } => src & width.mask() != 0,
            LazyFlags::Shl {
                width,
                value,
                count,
                ..
            } => {
                let count = u32::from(count);
                count <= width.bits() && (value >> (width.bits() - count)) & 1 != 0
            }
            LazyFlags::Shr {
                width,
                value,
                count,
                ..
            } => {
                let count = u32::from(count);
                count <= width.bits() && ((value & width.mask()) >> (count - 1)) & 1 != 0
            }
            LazyFlags::Sar {
                width,
                value,
                count,
                ..
            } => {
                let shift = (u32::from(count) - 1).min(31);
                (sign_extend(value, width) >> shift) & 1 != 0
            }
        }
    }

    fn af(&self) -> bool {
        match *self {
            LazyFlags::Add {
                lhs, rhs, result, ..
            }
            | LazyFlags::Adc {
                lhs, rhs, result, ..
            }
            | LazyFlags::Sub {
                lhs, rhs, result, ..
            }
            | LazyFlags::Sbb {
                lhs, rhs, result, ..
            } => (lhs ^ rhs ^ result) & 0x10 != 0,
            LazyFlags::Inc { result, .. } => result & 0x0F == 0,
            LazyFlags::Dec { result, .. } => result & 0x0F == 0x0F,
            LazyFlags::Neg { src, .. } => src & 0x0F != 0,
            _ => false,
        }
    }

    fn of(&self) -> bool {
        match *self {
            LazyFlags::Add {
                width,
                lhs,
                rhs,
                result,
            }
            | LazyFlags::Adc {
                width,
                lhs,
                rhs,
                result,
                ..
            } => (!(lhs ^ rhs) & (lhs ^ result)) & width.sign_bit() != 0,
            LazyFlags::Sub {
                width,
                lhs,
                rhs,
                result,
            }
            | LazyFlags::Sbb {
                width,
                lhs,
                rhs,
                result,
                ..
            } => ((lhs ^ rhs) & (lhs ^ result)) & width.sign_bit() != 0,
            LazyFlags::Inc { width, result, .. } => result & width.mask() == width.sign_bit(),
            LazyFlags::Dec { width, result, .. } => {
                result & width.mask() == width.sign_bit() - 1
            }
            LazyFlags::Neg { width, src, .. } => src & width.mask() == width.sign_bit(),
            LazyFlags::Shl { width, result, .. } => {
                (result & width.sign_bit() != 0) != self.cf()
            }
            LazyFlags::Shr {
                width,
                value,
                count,
                ..
            } => count == 1 && value & width.sign_bit() != 0,
            _ => false,
        }
    }

    /// The six condition bits implied by this record. `None` implies nothing.
    pub fn evaluate(&self) -> u32 {
        let Some((width, result)) = self.width_and_result() else {
            return 0;
        };
        let mut out = 0;
        if self.cf() {
            out |= EFLAGS_CF;
        }
        if parity(result) {
            out |= EFLAGS_PF;
        }
        if self.af() {
            out |= EFLAGS_AF;
        }
        if result == 0 {
            out |= EFLAGS_ZF;
        }
        if result & width.sign_bit() != 0 {
            out |= EFLAGS_SF;
        }
        if self.of() {
            out |= EFLAGS_OF;
        }
        out
    }
}

/// Two-operand integer operations that produce a lazy flag record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    /// CMP only updates flags.
    pub fn writes_result(self) -> bool {
        self != AluOp::Cmp
    }

    /// ADC and SBB consume the incoming carry.
    pub fn reads_carry(self) -> bool {
        matches!(self, AluOp::Adc | AluOp::Sbb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
}

impl CpuState {
    fn fill_keeping(&mut self, keep: u32) {
        if self.lazy.is_pending() {
            let computed = self.lazy.evaluate();
            self.flags = (self.flags & !FMASK_TEST) | (computed & keep);
            self.lazy = LazyFlags::None;
        }
    }

    /// Materializes all six condition flags.
    pub fn fill_flags(&mut self) {
        self.fill_keeping(FMASK_TEST);
    }

    pub fn fill_flags_no_cf_of(&mut self) {
        self.fill_keeping(FMASK_TEST & !(EFLAGS_CF | EFLAGS_OF));
    }

    pub fn fill_flags_no_cf(&mut self) {
        self.fill_keeping(FMASK_TEST & !EFLAGS_CF);
    }

    pub fn fill_flags_no_zf(&mut self) {
        self.fill_keeping(FMASK_TEST & !EFLAGS_ZF);
    }

    pub fn fill_flags_no_of(&mut self) {
        self.fill_keeping(FMASK_TEST & !EFLAGS_OF);
    }

    pub fn lazy_flags(&self) -> LazyFlags {
        self.lazy
    }

    pub fn set_lazy_flags(&mut self, lazy: LazyFlags) {
        self.lazy = lazy;
    }

    /// Drops a pending record without materializing it.
    ///
    /// Only valid when every condition flag is about to be overwritten (POPF, IRET).
    pub fn discard_lazy_flags(&mut self) {
        self.lazy = LazyFlags::None;
    }

    /// The flags register image. All condition bits must have been materialized.
    pub fn flags(&self) -> u32 {
        debug_assert!(
            !self.lazy.is_pending(),
            "fill_flags must be called before reading the flags image"
        );
        self.flags | EFLAGS_RESERVED1
    }

    fn condition(&self, bit: u32) -> bool {
        if self.lazy.is_pending() {
            self.lazy.evaluate() & bit != 0
        } else {
            self.flags & bit != 0
        }
    }

    pub fn cf(&self) -> bool {
        if self.lazy.is_pending() {
            self.lazy.cf()
        } else {
            self.flags & EFLAGS_CF != 0
        }
    }

    pub fn zf(&self) -> bool {
        self.condition(EFLAGS_ZF)
    }

    pub fn sf(&self) -> bool {
        self.condition(EFLAGS_SF)
    }

    pub fn of(&self) -> bool {
        self.condition(EFLAGS_OF)
    }

    pub fn af(&self) -> bool {
        self.condition(EFLAGS_AF)
    }

    pub fn pf(&self) -> bool {
        self.condition(EFLAGS_PF)
    }

    fn assert_materialized(&self, setter: &str) {
        debug_assert!(
            !self.lazy.is_pending(),
            "fill_flags must be called before {setter}"
        );
    }

    fn put(&mut self, bit: u32, value: bool) {
        if value {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }

    pub fn set_cf(&mut self, value: bool) {
        self.assert_materialized("set_cf");
        self.put(EFLAGS_CF, value);
    }

    pub fn set_of(&mut self, value: bool) {
        self.assert_materialized("set_of");
        self.put(EFLAGS_OF, value);
    }

    pub fn set_sf(&mut self, value: bool) {
        self.assert_materialized("set_sf");
        self.put(EFLAGS_SF, value);
    }

    pub fn set_zf(&mut self, value: bool) {
        self.assert_materialized("set_zf");
        self.put(EFLAGS_ZF, value);
    }

    pub fn set_pf_on_value(&mut self, value: u32) {
        self.assert_materialized("set_pf_on_value");
        self.put(EFLAGS_PF, parity(value));
    }

    /// Replaces the bits selected by `mask` with those of `value`.
    pub fn set_flags(&mut self, value: u32, mask: u32) {
        self.assert_materialized("set_flags");
        self.flags = (self.flags & !mask) | (value & mask) | EFLAGS_RESERVED1;
        self.sync_df();
    }

    pub fn add_flag(&mut self, bits: u32) {
        self.assert_materialized("add_flag");
        self.flags |= bits;
        self.sync_df();
    }

    pub fn remove_flag(&mut self, bits: u32) {
        self.assert_materialized("remove_flag");
        self.flags &= !bits;
        self.sync_df();
    }

    fn sync_df(&mut self) {
        self.df = if self.flags & EFLAGS_DF != 0 { -1 } else { 1 };
    }

    /// Performs `op` at `width` and leaves the flag record pending.
    pub fn alu(&mut self, op: AluOp, width: Width, lhs: u32, rhs: u32) -> u32 {
        let mask = width.mask();
        let (lhs, rhs) = (lhs & mask, rhs & mask);
        let (result, record) = match op {
            AluOp::Add => {
                let result = lhs.wrapping_add(rhs) & mask;
                (
                    result,
                    LazyFlags::Add {
                        width,
                        lhs,
                        rhs,
                        result,
                    },
                )
            }
            AluOp::Adc => {
                let carry = self.cf();
                let result = lhs.wrapping_add(rhs).wrapping_add(u32::from(carry)) & mask;
                (
                    result,
                    LazyFlags::Adc {
                        width,
                        lhs,
                        rhs,
                        carry,
                        result,
                    },
                )
            }
            AluOp::Sub | AluOp::Cmp => {
                let result = lhs.wrapping_sub(rhs) & mask;
                (
                    result,
                    LazyFlags::Sub {
                        width,
                        lhs,
                        rhs,
                        result,
                    },
                )
            }
            AluOp::Sbb => {
                let borrow = self.cf();
                let result = lhs.wrapping_sub(rhs).wrapping_sub(u32::from(borrow)) & mask;
                (
                    result,
                    LazyFlags::Sbb {
                        width,
                        lhs,
                        rhs,
                        borrow,
                        result,
                    },
                )
            }
            AluOp::And => (lhs & rhs, LazyFlags::Logic { width, result: lhs & rhs }),
            AluOp::Or => (lhs | rhs, LazyFlags::Logic { width, result: lhs | rhs }),
            AluOp::Xor => (lhs ^ rhs, LazyFlags::Logic { width, result: lhs ^ rhs }),
        };
        self.lazy = record;
        result
    }

    pub fn inc(&mut self, width: Width, value: u32) -> u32 {
        let carry = self.cf();
        let result = value.wrapping_add(1) & width.mask();
        self.lazy = LazyFlags::Inc {
            width,
            result,
            carry,
        };
        result
    }

    pub fn dec(&mut self, width: Width, value: u32) -> u32 {
        let carry = self.cf();
        let result = value.wrapping_sub(1) & width.mask();
        self.lazy = LazyFlags::Dec {
            width,
            result,
            carry,
        };
        result
    }

    pub fn neg(&mut self, width: Width, value: u32) -> u32 {
        let src = value & width.mask();
        let result = src.wrapping_neg() & width.mask();
        self.lazy = LazyFlags::Neg { width, src, result };
        result
    }

    /// Shifts by `count & 0x1F`. A zero count leaves both the value and the flags untouched.
    pub fn shift(&mut self, op: ShiftOp, width: Width, value: u32, count: u8) -> u32 {
        let count = count & 0x1F;
        let value = value & width.mask();
        if count == 0 {
            return value;
        }
        let shift = u32::from(count);
        let (result, record) = match op {
            ShiftOp::Shl => {
                let result = value.checked_shl(shift).unwrap_or(0) & width.mask();
                (
                    result,
                    LazyFlags::Shl {
                        width,
                        value,
                        count,
                        result,
                    },
                )
            }
            ShiftOp::Shr => {
                let result = value.checked_shr(shift).unwrap_or(0);
                (
                    result,
                    LazyFlags::Shr {
                        width,
                        value,
                        count,
                        result,
                    },
                )
            }
            ShiftOp::Sar => {
                let result = (sign_extend(value, width) >> shift.min(31)) as u32 & width.mask();
                (
                    result,
                    LazyFlags::Sar {
                        width,
                        value,
                        count,
                        result,
                    },
                )
            }
        };
        self.lazy = record;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags_after(f: impl FnOnce(&mut CpuState)) -> u32 {
        let mut cpu = CpuState::new();
        f(&mut cpu);
        cpu.fill_flags();
        cpu.flags() & FMASK_TEST
    }

    #[test]
    fn add_carry_and_overflow() {
        let flags = flags_after(|cpu| {
            cpu.alu(AluOp::Add, Width::Dword, 0xFFFF_FFFF, 1);
        });
        assert_eq!(flags, EFLAGS_CF | EFLAGS_ZF | EFLAGS_PF | EFLAGS_AF);

        let flags = flags_after(|cpu| {
            cpu.alu(AluOp::Add, Width::Byte, 0x7F, 1);
        });
        assert_eq!(flags, EFLAGS_OF | EFLAGS_SF | EFLAGS_AF);
    }

    #[test]
    fn sub_borrow_sets_cf() {
        let flags = flags_after(|cpu| {
            cpu.alu(AluOp::Cmp, Width::Dword, 1, 2);
        });
        assert_ne!(flags & EFLAGS_CF, 0);
        assert_ne!(flags & EFLAGS_SF, 0);
        assert_eq!(flags & EFLAGS_ZF, 0);
    }

    #[test]
    fn sbb_consumes_borrow() {
        let mut cpu = CpuState::new();
        cpu.set_cf(true);
        let result = cpu.alu(AluOp::Sbb, Width::Dword, 5, 5);
        assert_eq!(result, 0xFFFF_FFFF);
        assert!(cpu.cf());

        cpu.fill_flags();
        cpu.set_cf(true);
        let result = cpu.alu(AluOp::Adc, Width::Word, 0xFFFF, 0);
        assert_eq!(result, 0);
        assert!(cpu.cf());
        assert!(cpu.zf());
    }

    #[test]
    fn inc_preserves_carry() {
        let mut cpu = CpuState::new();
        cpu.set_cf(true);
        assert_eq!(cpu.inc(Width::Dword, 0x7FFF_FFFF), 0x8000_0000);
        assert!(cpu.cf());
        assert!(cpu.of());
        assert!(cpu.sf());
    }

    #[test]
    fn dec_overflow_and_aux() {
        let mut cpu = CpuState::new();
        assert_eq!(cpu.dec(Width::Byte, 0x80), 0x7F);
        assert!(cpu.of());
        assert!(cpu.af());
        assert!(!cpu.cf());
    }

    #[test]
    fn neg_of_zero_clears_carry() {
        let mut cpu = CpuState::new();
        cpu.neg(Width::Dword, 0);
        assert!(!cpu.cf());
        assert!(cpu.zf());
        cpu.neg(Width::Dword, 1);
        assert!(cpu.cf());
    }

    #[test]
    fn shifts_report_last_bit_out() {
        let mut cpu = CpuState::new();
        assert_eq!(cpu.shift(ShiftOp::Shl, Width::Byte, 0x81, 1), 0x02);
        assert!(cpu.cf());
        assert!(cpu.of());

        assert_eq!(cpu.shift(ShiftOp::Shr, Width::Dword, 0x3, 1), 0x1);
        assert!(cpu.cf());

        assert_eq!(cpu.shift(ShiftOp::Sar, Width::Byte, 0x80, 7), 0xFF);
        assert!(!cpu.cf());
        assert_eq!(cpu.shift(ShiftOp::Sar, Width::Byte, 0x80, 8), 0xFF);
        assert!(cpu.cf());
        assert!(!cpu.of());
    }

    #[test]
    fn zero_shift_keeps_previous_record() {
        let mut cpu = CpuState::new();
        cpu.alu(AluOp::Add, Width::Dword, 1, 1);
        let before = cpu.lazy_flags();
        assert_eq!(cpu.shift(ShiftOp::Shl, Width::Dword, 5, 32), 5);
        assert_eq!(cpu.lazy_flags(), before);
    }

    #[test]
    fn partial_fill_clears_excluded_bit() {
        let mut cpu = CpuState::new();
        cpu.alu(AluOp::Add, Width::Dword, 0xFFFF_FFFF, 1);
        cpu.fill_flags_no_cf();
        assert!(!cpu.lazy_flags().is_pending());
        assert_eq!(cpu.flags() & EFLAGS_CF, 0);
        assert_ne!(cpu.flags() & EFLAGS_ZF, 0);

        cpu.alu(AluOp::Sub, Width::Dword, 0, 0);
        cpu.fill_flags_no_zf();
        assert_eq!(cpu.flags() & EFLAGS_ZF, 0);
    }

    #[test]
    fn fill_preserves_non_condition_bits() {
        let mut cpu = CpuState::new();
        cpu.add_flag(EFLAGS_DF);
        cpu.alu(AluOp::Xor, Width::Dword, 3, 3);
        cpu.fill_flags();
        assert_ne!(cpu.flags() & EFLAGS_DF, 0);
        assert_eq!(cpu.df(), -1);
    }

    #[test]
    fn set_flags_recomputes_direction() {
        let mut cpu = CpuState::new();
        cpu.set_flags(EFLAGS_DF, EFLAGS_DF);
        assert_eq!(cpu.df(), -1);
        cpu.set_flags(0, EFLAGS_DF);
        assert_eq!(cpu.df(), 1);
        assert_ne!(cpu.flags() & EFLAGS_RESERVED1, 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "fill_flags must be called before set_cf")]
    fn direct_setter_with_pending_record_panics() {
        let mut cpu = CpuState::new();
        cpu.alu(AluOp::Add, Width::Dword, 1, 2);
        cpu.set_cf(true);
    }
}
