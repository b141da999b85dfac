//! Floating-point unit state.
//!
//! The FPU is opaque to this crate: it is reset on thread creation and copied when a thread forks.
//! Instruction semantics live with the x87 emulation, not here.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpuState {
    pub control: u16,
    pub status: u16,
    pub tag: u16,
    pub top: u8,
    /// Eight 80-bit registers in physical (not stack-relative) order.
    pub regs: [[u8; 10]; 8],
}

impl Default for FpuState {
    fn default() -> Self {
        let mut fpu = Self {
            control: 0,
            status: 0,
            tag: 0,
            top: 0,
            regs: [[0; 10]; 8],
        };
        fpu.finit();
        fpu
    }
}

impl FpuState {
    /// FNINIT: default control word, every register tagged empty.
    pub fn finit(&mut self) {
        self.control = 0x037F;
        self.status = 0;
        self.tag = 0xFFFF;
        self.top = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finit_restores_defaults() {
        let mut fpu = FpuState::default();
        fpu.control = 0;
        fpu.top = 5;
        fpu.finit();
        assert_eq!(fpu.control, 0x037F);
        assert_eq!(fpu.tag, 0xFFFF);
        assert_eq!(fpu.top, 0);
    }
}
