//! Architectural state of one emulated 32-bit x86 execution context.
//!
//! A [`CpuState`] is owned by exactly one guest thread. It never holds a reference back to that
//! thread: operations that need the descriptor table, guest memory or signal delivery receive the
//! thread as an explicit argument (see [`crate::thread::GuestThread`]).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::flags::LazyFlags;
use crate::fpu::FpuState;

pub const EFLAGS_CF: u32 = 1 << 0;
pub const EFLAGS_RESERVED1: u32 = 1 << 1;
pub const EFLAGS_PF: u32 = 1 << 2;
pub const EFLAGS_AF: u32 = 1 << 4;
pub const EFLAGS_ZF: u32 = 1 << 6;
pub const EFLAGS_SF: u32 = 1 << 7;
pub const EFLAGS_TF: u32 = 1 << 8;
pub const EFLAGS_IF: u32 = 1 << 9;
pub const EFLAGS_DF: u32 = 1 << 10;
pub const EFLAGS_OF: u32 = 1 << 11;
pub const EFLAGS_IOPL: u32 = 3 << 12;
pub const EFLAGS_NT: u32 = 1 << 14;
pub const EFLAGS_RF: u32 = 1 << 16;
pub const EFLAGS_VM: u32 = 1 << 17;
pub const EFLAGS_AC: u32 = 1 << 18;
pub const EFLAGS_ID: u32 = 1 << 21;

/// The six condition bits owned by the lazy flag engine.
pub const FMASK_TEST: u32 = EFLAGS_CF | EFLAGS_PF | EFLAGS_AF | EFLAGS_ZF | EFLAGS_SF | EFLAGS_OF;
/// Bits unprivileged code may change.
pub const FMASK_NORMAL: u32 = FMASK_TEST | EFLAGS_DF | EFLAGS_TF | EFLAGS_IF | EFLAGS_AC | EFLAGS_ID;
pub const FMASK_ALL: u32 = FMASK_NORMAL | EFLAGS_IOPL | EFLAGS_NT;

/// Number of general purpose register slots (eight architectural registers plus a scratch slot).
pub const GPR_COUNT: usize = 9;
/// Number of segment register slots (six architectural segments plus the flat zero segment).
pub const SEG_COUNT: usize = 7;

pub const INITIAL_CS: u16 = 0x0F;
pub const INITIAL_DATA_SELECTOR: u16 = 0x17;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Cr0: u32 {
        const PROTECTION = 1 << 0;
        /// Extension type bit; reported as "FPU present".
        const FPU_PRESENT = 1 << 4;
        const PAGING = 1 << 31;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
    /// Scratch slot used by multi-step operations; never visible to guest code.
    Tmp = 8,
}

impl Gpr {
    pub const ALL: [Gpr; GPR_COUNT] = [
        Gpr::Eax,
        Gpr::Ecx,
        Gpr::Edx,
        Gpr::Ebx,
        Gpr::Esp,
        Gpr::Ebp,
        Gpr::Esi,
        Gpr::Edi,
        Gpr::Tmp,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// 8-bit register views. The first four name the low bytes of EAX..EBX, the next four the high
/// bytes of the same registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reg8 {
    Al = 0,
    Cl = 1,
    Dl = 2,
    Bl = 3,
    Ah = 4,
    Ch = 5,
    Dh = 6,
    Bh = 7,
    TmpL = 8,
}

impl Reg8 {
    /// Backing 32-bit register and bit shift of this view.
    pub fn location(self) -> (Gpr, u32) {
        match self {
            Reg8::Al => (Gpr::Eax, 0),
            Reg8::Cl => (Gpr::Ecx, 0),
            Reg8::Dl => (Gpr::Edx, 0),
            Reg8::Bl => (Gpr::Ebx, 0),
            Reg8::Ah => (Gpr::Eax, 8),
            Reg8::Ch => (Gpr::Ecx, 8),
            Reg8::Dh => (Gpr::Edx, 8),
            Reg8::Bh => (Gpr::Ebx, 8),
            Reg8::TmpL => (Gpr::Tmp, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
    /// Pseudo segment with a permanently zero base, used for flat addressing.
    Zero = 6,
}

impl SegReg {
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Segment {
    pub selector: u16,
    /// Resolved linear base address.
    pub base: u32,
}

/// Operand width of a register view, memory access or lazily evaluated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    pub fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
            Width::Dword => 0xFFFF_FFFF,
        }
    }

    pub fn sign_bit(self) -> u32 {
        match self {
            Width::Byte => 0x80,
            Width::Word => 0x8000,
            Width::Dword => 0x8000_0000,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            Width::Byte => 8,
            Width::Word => 16,
            Width::Dword => 32,
        }
    }

    pub fn bytes(self) -> u32 {
        self.bits() / 8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuState {
    pub regs: [u32; GPR_COUNT],
    pub(crate) segs: [Segment; SEG_COUNT],
    pub eip: u32,
    pub(crate) flags: u32,
    pub(crate) lazy: LazyFlags,
    /// Current code segment is 32-bit.
    pub big: bool,
    /// +1 when DF is clear, -1 when set.
    pub(crate) df: i32,
    pub(crate) cpl: u8,
    pub(crate) stack_mask: u32,
    pub(crate) stack_not_mask: u32,
    pub cr0: Cr0,
    pub fpu: FpuState,
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuState {
    pub fn new() -> Self {
        let mut cpu = Self {
            regs: [0; GPR_COUNT],
            segs: [Segment::default(); SEG_COUNT],
            eip: 0,
            flags: 0,
            lazy: LazyFlags::None,
            big: true,
            df: 1,
            cpl: 3,
            stack_mask: 0xFFFF_FFFF,
            stack_not_mask: 0,
            cr0: Cr0::empty(),
            fpu: FpuState::default(),
        };
        cpu.reset();
        cpu
    }

    /// Puts the context into the state a freshly created user-mode thread starts in.
    pub fn reset(&mut self) {
        self.regs = [0; GPR_COUNT];
        self.segs = [Segment::default(); SEG_COUNT];
        self.eip = 0;
        self.flags = EFLAGS_IF;
        self.lazy = LazyFlags::None;
        self.big = true;
        self.df = 1;
        self.segs[SegReg::Cs.index()].selector = INITIAL_CS;
        self.segs[SegReg::Ss.index()].selector = INITIAL_DATA_SELECTOR;
        self.segs[SegReg::Ds.index()].selector = INITIAL_DATA_SELECTOR;
        self.segs[SegReg::Es.index()].selector = INITIAL_DATA_SELECTOR;
        self.cpl = 3;
        self.cr0 = Cr0::PROTECTION | Cr0::FPU_PRESENT | Cr0::PAGING;
        self.fpu.finit();
        self.stack_mask = 0xFFFF_FFFF;
        self.stack_not_mask = 0;
    }

    /// Builds a context that starts executing at `cpl`.
    ///
    /// This is how a kernel-side loader sets up a thread that does not start in user mode; once
    /// running, the privilege level only changes through control transfers.
    pub fn with_cpl(mut self, cpl: u8) -> Self {
        self.cpl = cpl & 3;
        if let Some(cs) = self.segs.get_mut(SegReg::Cs.index()) {
            cs.selector = (cs.selector & !3) | u16::from(self.cpl);
        }
        self
    }

    pub fn reg(&self, reg: Gpr) -> u32 {
        self.regs[reg.index()]
    }

    pub fn set_reg(&mut self, reg: Gpr, value: u32) {
        self.regs[reg.index()] = value;
    }

    pub fn reg16(&self, reg: Gpr) -> u16 {
        self.regs[reg.index()] as u16
    }

    pub fn set_reg16(&mut self, reg: Gpr, value: u16) {
        let slot = &mut self.regs[reg.index()];
        *slot = (*slot & 0xFFFF_0000) | u32::from(value);
    }

    pub fn reg8(&self, reg: Reg8) -> u8 {
        let (gpr, shift) = reg.location();
        (self.regs[gpr.index()] >> shift) as u8
    }

    pub fn set_reg8(&mut self, reg: Reg8, value: u8) {
        let (gpr, shift) = reg.location();
        let slot = &mut self.regs[gpr.index()];
        *slot = (*slot & !(0xFF << shift)) | (u32::from(value) << shift);
    }

    pub fn seg(&self, seg: SegReg) -> Segment {
        self.segs[seg.index()]
    }

    pub fn cpl(&self) -> u8 {
        self.cpl
    }

    pub fn stack_mask(&self) -> u32 {
        self.stack_mask
    }

    pub fn stack_not_mask(&self) -> u32 {
        self.stack_not_mask
    }

    /// String-operation direction multiplier.
    pub fn df(&self) -> i32 {
        self.df
    }

    pub fn in_vm86(&self) -> bool {
        self.flags & EFLAGS_VM != 0
    }

    pub fn iopl(&self) -> u8 {
        ((self.flags & EFLAGS_IOPL) >> 12) as u8
    }

    /// Linear address of the current stack top.
    pub fn stack_top(&self) -> u32 {
        self.seg(SegReg::Ss)
            .base
            .wrapping_add(self.reg(Gpr::Esp) & self.stack_mask)
    }

    /// Derives the stack wrap masks from the width of the stack segment.
    pub(crate) fn set_stack_width(&mut self, seg_32bit: bool) {
        if seg_32bit {
            self.stack_mask = 0xFFFF_FFFF;
            self.stack_not_mask = 0;
        } else {
            self.stack_mask = 0xFFFF;
            self.stack_not_mask = 0xFFFF_0000;
        }
    }

    /// Applies `delta` to ESP under the current stack mask.
    pub(crate) fn adjust_esp(&mut self, delta: u32) {
        let esp = self.reg(Gpr::Esp);
        self.set_reg(
            Gpr::Esp,
            (esp & self.stack_not_mask) | (esp.wrapping_add(delta) & self.stack_mask),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_views_alias_low_and_high_halves() {
        let mut cpu = CpuState::new();
        cpu.set_reg(Gpr::Eax, 0x1234_5678);
        assert_eq!(cpu.reg8(Reg8::Al), 0x78);
        assert_eq!(cpu.reg8(Reg8::Ah), 0x56);

        cpu.set_reg8(Reg8::Ah, 0xAA);
        assert_eq!(cpu.reg(Gpr::Eax), 0x1234_AA78);
        cpu.set_reg16(Gpr::Eax, 0xBEEF);
        assert_eq!(cpu.reg(Gpr::Eax), 0x1234_BEEF);
    }

    #[test]
    fn stack_masks_stay_complementary() {
        let mut cpu = CpuState::new();
        for seg_32bit in [false, true, false] {
            cpu.set_stack_width(seg_32bit);
            assert_eq!(cpu.stack_mask() ^ cpu.stack_not_mask(), 0xFFFF_FFFF);
            assert_eq!(cpu.stack_mask() & cpu.stack_not_mask(), 0);
        }
    }

    #[test]
    fn adjust_esp_wraps_inside_16bit_stack() {
        let mut cpu = CpuState::new();
        cpu.set_stack_width(false);
        cpu.set_reg(Gpr::Esp, 0xABCD_0002);
        cpu.adjust_esp(4u32.wrapping_neg());
        assert_eq!(cpu.reg(Gpr::Esp), 0xABCD_FFFE);
    }

    #[test]
    fn with_cpl_rewrites_cs_rpl() {
        let cpu = CpuState::new().with_cpl(0);
        assert_eq!(cpu.cpl(), 0);
        assert_eq!(cpu.seg(SegReg::Cs).selector, 0x0C);
    }
}
