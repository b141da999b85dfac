//! Stack-segment relative push/pop and frame construction.
//!
//! Every access is `SS.base + (ESP & stack_mask)`, and every ESP update only replaces the bits
//! selected by the stack mask, so a 16-bit stack wraps at 64K without disturbing ESP's high half.

use crate::mem::GuestMemory;
use crate::state::{CpuState, Gpr, SegReg};

impl CpuState {
    fn stack_address(&self, esp: u32) -> u32 {
        self.seg(SegReg::Ss)
            .base
            .wrapping_add(esp & self.stack_mask)
    }

    fn step_esp(&self, esp: u32, delta: u32) -> u32 {
        (esp & self.stack_not_mask) | (esp.wrapping_add(delta) & self.stack_mask)
    }

    /// Pushes relative to `esp` and returns the new stack pointer without committing it.
    pub fn push16_at<M: GuestMemory + ?Sized>(&self, mem: &mut M, esp: u32, value: u16) -> u32 {
        let new_esp = self.step_esp(esp, 2u32.wrapping_neg());
        mem.write_u16(self.stack_address(new_esp), value);
        new_esp
    }

    pub fn push32_at<M: GuestMemory + ?Sized>(&self, mem: &mut M, esp: u32, value: u32) -> u32 {
        let new_esp = self.step_esp(esp, 4u32.wrapping_neg());
        mem.write_u32(self.stack_address(new_esp), value);
        new_esp
    }

    pub fn push16<M: GuestMemory + ?Sized>(&mut self, mem: &mut M, value: u16) {
        let esp = self.push16_at(mem, self.reg(Gpr::Esp), value);
        self.set_reg(Gpr::Esp, esp);
    }

    pub fn push32<M: GuestMemory + ?Sized>(&mut self, mem: &mut M, value: u32) {
        let esp = self.push32_at(mem, self.reg(Gpr::Esp), value);
        self.set_reg(Gpr::Esp, esp);
    }

    pub fn pop16<M: GuestMemory + ?Sized>(&mut self, mem: &M) -> u16 {
        let value = mem.read_u16(self.stack_address(self.reg(Gpr::Esp)));
        self.adjust_esp(2);
        value
    }

    pub fn pop32<M: GuestMemory + ?Sized>(&mut self, mem: &M) -> u32 {
        let value = mem.read_u32(self.stack_address(self.reg(Gpr::Esp)));
        self.adjust_esp(4);
        value
    }

    /// Reads the `index`th word above the stack top.
    pub fn peek16<M: GuestMemory + ?Sized>(&self, mem: &M, index: u32) -> u16 {
        self.read_stack16(mem, index.wrapping_mul(2))
    }

    /// Reads the `index`th dword above the stack top.
    pub fn peek32<M: GuestMemory + ?Sized>(&self, mem: &M, index: u32) -> u32 {
        self.read_stack32(mem, index.wrapping_mul(4))
    }

    pub(crate) fn read_stack16<M: GuestMemory + ?Sized>(&self, mem: &M, offset: u32) -> u16 {
        mem.read_u16(self.stack_address(self.reg(Gpr::Esp).wrapping_add(offset)))
    }

    pub(crate) fn read_stack32<M: GuestMemory + ?Sized>(&self, mem: &M, offset: u32) -> u32 {
        mem.read_u32(self.stack_address(self.reg(Gpr::Esp).wrapping_add(offset)))
    }

    pub fn push_a16<M: GuestMemory + ?Sized>(&mut self, mem: &mut M) {
        let old_sp = self.reg16(Gpr::Esp);
        let mut esp = self.reg(Gpr::Esp);
        for reg in [Gpr::Eax, Gpr::Ecx, Gpr::Edx, Gpr::Ebx] {
            esp = self.push16_at(mem, esp, self.reg16(reg));
        }
        esp = self.push16_at(mem, esp, old_sp);
        for reg in [Gpr::Ebp, Gpr::Esi, Gpr::Edi] {
            esp = self.push16_at(mem, esp, self.reg16(reg));
        }
        self.set_reg(Gpr::Esp, esp);
    }

    pub fn push_a32<M: GuestMemory + ?Sized>(&mut self, mem: &mut M) {
        let old_esp = self.reg(Gpr::Esp);
        let mut esp = old_esp;
        for reg in [Gpr::Eax, Gpr::Ecx, Gpr::Edx, Gpr::Ebx] {
            esp = self.push32_at(mem, esp, self.reg(reg));
        }
        esp = self.push32_at(mem, esp, old_esp);
        for reg in [Gpr::Ebp, Gpr::Esi, Gpr::Edi] {
            esp = self.push32_at(mem, esp, self.reg(reg));
        }
        self.set_reg(Gpr::Esp, esp);
    }

    /// POPA; the saved SP slot is skipped.
    pub fn pop_a16<M: GuestMemory + ?Sized>(&mut self, mem: &M) {
        for reg in [Gpr::Edi, Gpr::Esi, Gpr::Ebp] {
            let v = self.pop16(mem);
            self.set_reg16(reg, v);
        }
        self.adjust_esp(2);
        for reg in [Gpr::Ebx, Gpr::Edx, Gpr::Ecx, Gpr::Eax] {
            let v = self.pop16(mem);
            self.set_reg16(reg, v);
        }
    }

    pub fn pop_a32<M: GuestMemory + ?Sized>(&mut self, mem: &M) {
        for reg in [Gpr::Edi, Gpr::Esi, Gpr::Ebp] {
            let v = self.pop32(mem);
            self.set_reg(reg, v);
        }
        self.adjust_esp(4);
        for reg in [Gpr::Ebx, Gpr::Edx, Gpr::Ecx, Gpr::Eax] {
            let v = self.pop32(mem);
            self.set_reg(reg, v);
        }
    }

    /// ENTER: pushes the caller's frame pointer, copies `level - 1` enclosing frame pointers,
    /// then reserves `bytes` of locals.
    pub fn enter<M: GuestMemory + ?Sized>(&mut self, mem: &mut M, big: bool, bytes: u32, level: u32) {
        let level = level & 0x1F;
        let mut sp = self.reg(Gpr::Esp);
        let mut bp = self.reg(Gpr::Ebp);

        if big {
            sp = sp.wrapping_sub(4);
            mem.write_u32(self.stack_address(sp), self.reg(Gpr::Ebp));
            let frame = self.reg(Gpr::Esp).wrapping_sub(4);
            self.set_reg(Gpr::Ebp, frame);
            if level != 0 {
                for _ in 1..level {
                    sp = sp.wrapping_sub(4);
                    bp = bp.wrapping_sub(4);
                    let saved = mem.read_u32(self.stack_address(bp));
                    mem.write_u32(self.stack_address(sp), saved);
                }
                sp = sp.wrapping_sub(4);
                mem.write_u32(self.stack_address(sp), frame);
            }
        } else {
            sp = sp.wrapping_sub(2);
            mem.write_u16(self.stack_address(sp), self.reg16(Gpr::Ebp));
            let frame = self.reg16(Gpr::Esp).wrapping_sub(2);
            self.set_reg16(Gpr::Ebp, frame);
            if level != 0 {
                for _ in 1..level {
                    sp = sp.wrapping_sub(2);
                    bp = bp.wrapping_sub(2);
                    let saved = mem.read_u16(self.stack_address(bp));
                    mem.write_u16(self.stack_address(sp), saved);
                }
                sp = sp.wrapping_sub(2);
                mem.write_u16(self.stack_address(sp), frame);
            }
        }

        sp = sp.wrapping_sub(bytes);
        let esp = self.reg(Gpr::Esp);
        self.set_reg(
            Gpr::Esp,
            (esp & self.stack_not_mask) | (sp & self.stack_mask),
        );
    }

    /// LEAVE: ESP := EBP under the stack mask, then pop the frame pointer.
    pub fn leave<M: GuestMemory + ?Sized>(&mut self, mem: &M, big: bool) {
        let esp = self.reg(Gpr::Esp);
        let ebp = self.reg(Gpr::Ebp);
        self.set_reg(
            Gpr::Esp,
            (esp & self.stack_not_mask) | (ebp & self.stack_mask),
        );
        if big {
            let v = self.pop32(mem);
            self.set_reg(Gpr::Ebp, v);
        } else {
            let v = self.pop16(mem);
            self.set_reg16(Gpr::Ebp, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatMemory;

    #[test]
    fn push_pop_16bit_stack_wraps() {
        let mut cpu = CpuState::new();
        let mut mem = FlatMemory::new(0x1_0000);
        cpu.set_stack_width(false);
        cpu.set_reg(Gpr::Esp, 0x5555_0000);

        cpu.push16(&mut mem, 0xBEEF);
        assert_eq!(cpu.reg(Gpr::Esp), 0x5555_FFFE);
        assert_eq!(mem.read_u16(0xFFFE), 0xBEEF);
        assert_eq!(cpu.peek16(&mem, 0), 0xBEEF);

        assert_eq!(cpu.pop16(&mem), 0xBEEF);
        assert_eq!(cpu.reg(Gpr::Esp), 0x5555_0000);
    }

    #[test]
    fn push_at_does_not_commit() {
        let cpu = CpuState::new();
        let mut mem = FlatMemory::new(0x100);
        let esp = cpu.push32_at(&mut mem, 0x80, 7);
        assert_eq!(esp, 0x7C);
        assert_eq!(cpu.reg(Gpr::Esp), 0);
        assert_eq!(mem.read_u32(0x7C), 7);
    }

    #[test]
    fn pusha_popa_round_trip_skips_saved_esp() {
        let mut cpu = CpuState::new();
        let mut mem = FlatMemory::new(0x1000);
        for (i, reg) in Gpr::ALL[..8].iter().enumerate() {
            cpu.set_reg(*reg, 0x100 * (i as u32 + 1));
        }
        cpu.set_reg(Gpr::Esp, 0x800);
        cpu.push_a32(&mut mem);
        assert_eq!(cpu.reg(Gpr::Esp), 0x800 - 32);
        assert_eq!(cpu.peek32(&mem, 3), 0x800);

        let mut expected = cpu.regs;
        expected[Gpr::Esp.index()] = 0x800;
        for reg in [Gpr::Eax, Gpr::Ecx, Gpr::Edx, Gpr::Ebx, Gpr::Ebp, Gpr::Esi, Gpr::Edi] {
            cpu.set_reg(reg, 0);
        }
        cpu.pop_a32(&mem);
        assert_eq!(cpu.regs, expected);
    }

    #[test]
    fn enter_with_nesting_copies_frame_pointers() {
        let mut cpu = CpuState::new();
        let mut mem = FlatMemory::new(0x4000);
        mem.write_u32(0x1FFC, 0xAAAA_0001);
        cpu.set_reg(Gpr::Ebp, 0x2000);
        cpu.set_reg(Gpr::Esp, 0x3000);

        cpu.enter(&mut mem, true, 4, 2);

        assert_eq!(mem.read_u32(0x2FFC), 0x2000);
        assert_eq!(mem.read_u32(0x2FF8), 0xAAAA_0001);
        assert_eq!(mem.read_u32(0x2FF4), 0x2FFC);
        assert_eq!(cpu.reg(Gpr::Ebp), 0x2FFC);
        assert_eq!(cpu.reg(Gpr::Esp), 0x2FF0);
    }

    #[test]
    fn leave_unwinds_enter() {
        let mut cpu = CpuState::new();
        let mut mem = FlatMemory::new(0x4000);
        cpu.set_reg(Gpr::Ebp, 0x2000);
        cpu.set_reg(Gpr::Esp, 0x3000);
        cpu.enter(&mut mem, true, 0x20, 0);
        cpu.leave(&mem, true);
        assert_eq!(cpu.reg(Gpr::Ebp), 0x2000);
        assert_eq!(cpu.reg(Gpr::Esp), 0x3000);
    }
}
