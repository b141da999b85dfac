use tracing::warn;

use crate::state::{CpuState, Gpr};

/// FPU, TSC, MSR, CX8, PGE, CMOV and MMX.
const FEATURES_EDX: u32 = 0x11 | (1 << 5) | (1 << 8) | (1 << 13) | (1 << 15) | (1 << 23);

impl CpuState {
    /// CPUID for the leaf in EAX.
    pub fn cpuid(&mut self) {
        let (eax, ebx, ecx, edx) = match self.reg(Gpr::Eax) {
            0 => (
                2,
                u32::from_le_bytes(*b"Genu"),
                u32::from_le_bytes(*b"ntel"),
                u32::from_le_bytes(*b"ineI"),
            ),
            // Family 6, model 3, stepping 3.
            1 => (0x633, 0, 0, FEATURES_EDX),
            2 => (0x0302_0101, 0, 0, 0x0C04_0843),
            // No extended leaves; only EAX is reported.
            0x8000_0000 => {
                self.set_reg(Gpr::Eax, 0);
                return;
            }
            leaf => {
                warn!(leaf = format_args!("{leaf:#x}"), "unhandled CPUID leaf");
                (0, 0, 0, 0)
            }
        };
        self.set_reg(Gpr::Eax, eax);
        self.set_reg(Gpr::Ebx, ebx);
        self.set_reg(Gpr::Ecx, ecx);
        self.set_reg(Gpr::Edx, edx);
    }
}
