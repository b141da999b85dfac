//! Far control transfers: CALL, JMP, RET and IRET.
//!
//! Every protected-mode transfer follows the same discipline: read the return frame with peeks,
//! validate every selector it names, and only then pop and commit. A rejected transfer raises a
//! fault with ESP, EIP, CS and the flags exactly as they were before the instruction.

use crate::descriptors::{Descriptor, Selector};
use crate::exceptions::{guard, reject, Abort, Completion, CpuExit, Fault};
use crate::mem::GuestMemory;
use crate::segmentation::note_stack_load;
use crate::state::{
    CpuState, Gpr, SegReg, EFLAGS_IF, EFLAGS_NT, EFLAGS_VM, FMASK_ALL, FMASK_NORMAL,
};
use crate::thread::GuestThread;

/// Looks up the target of a far transfer.
fn code_descriptor<T: GuestThread + ?Sized>(
    thread: &T,
    selector: Selector,
    op: &str,
) -> Result<Descriptor, Fault> {
    guard(
        !selector.is_null(),
        op,
        "CS selector zero",
        Fault::GeneralProtection(0),
    )?;
    guard(
        selector.in_table(),
        op,
        "CS selector outside descriptor table",
        Fault::GeneralProtection(selector.error_code()),
    )?;
    thread
        .descriptor(selector.index())
        .copied()
        .filter(Descriptor::is_present)
        .ok_or_else(|| {
            reject(
                op,
                "CS segment not present",
                Fault::SegmentNotPresent(selector.error_code()),
            )
        })
}

/// Looks up the stack segment an outer-level return switches to.
fn outer_stack_descriptor<T: GuestThread + ?Sized>(
    thread: &T,
    ss: Selector,
    cs: Selector,
    op: &str,
    absent: Fault,
) -> Result<Descriptor, Fault> {
    guard(!ss.is_null(), op, "SS selector zero", Fault::GeneralProtection(0))?;
    guard(
        ss.in_table(),
        op,
        "SS selector outside descriptor table",
        Fault::GeneralProtection(ss.error_code()),
    )?;
    guard(
        ss.rpl() == cs.rpl(),
        op,
        "SS RPL differs from CS RPL",
        Fault::GeneralProtection(ss.error_code()),
    )?;
    thread
        .descriptor(ss.index())
        .copied()
        .filter(Descriptor::is_present)
        .ok_or_else(|| reject(op, "SS segment not present", absent))
}

fn operand_bytes(big: bool) -> u32 {
    if big {
        4
    } else {
        2
    }
}

impl CpuState {
    fn frame_value<M: GuestMemory + ?Sized>(&self, mem: &M, big: bool, offset: u32) -> u32 {
        if big {
            self.read_stack32(mem, offset)
        } else {
            u32::from(self.read_stack16(mem, offset))
        }
    }

    fn push_return_address<T: GuestThread + ?Sized>(&mut self, thread: &mut T, big: bool, eip: u32) {
        let cs = self.seg(SegReg::Cs).selector;
        let mem = thread.memory_mut();
        let esp = self.reg(Gpr::Esp);
        let esp = if big {
            let esp = self.push32_at(mem, esp, u32::from(cs));
            self.push32_at(mem, esp, eip)
        } else {
            let esp = self.push16_at(mem, esp, cs);
            self.push16_at(mem, esp, eip as u16)
        };
        self.set_reg(Gpr::Esp, esp);
    }

    /// Replaces ESP with `value` under the (already switched) stack mask.
    fn load_stack_pointer(&mut self, value: u32) {
        let esp = self.reg(Gpr::Esp);
        self.set_reg(
            Gpr::Esp,
            (esp & self.stack_not_mask) | (value & self.stack_mask),
        );
    }

    fn switch_stack<T: GuestThread + ?Sized>(
        &mut self,
        thread: &mut T,
        selector: u16,
        desc: Descriptor,
        esp: u32,
    ) {
        self.commit_segment(SegReg::Ss, selector, desc.base);
        self.set_stack_width(desc.seg_32bit);
        note_stack_load(thread, desc.seg_32bit);
        self.load_stack_pointer(esp);
    }

    fn enter_vm86_code(&mut self, selector: u16, offset: u32) {
        self.commit_segment(SegReg::Cs, selector, u32::from(selector) << 4);
        self.eip = offset;
        self.big = false;
    }

    /// Far CALL to `selector:offset`. `old_eip` is the address of the next instruction.
    pub fn call<T: GuestThread + ?Sized>(
        &mut self,
        thread: &mut T,
        big: bool,
        selector: u32,
        offset: u32,
        old_eip: u32,
    ) -> Result<Completion, CpuExit> {
        let result = self
            .far_call(thread, big, Selector(selector as u16), offset, old_eip)
            .map_err(Abort::from);
        self.complete(thread, result)
    }

    fn far_call<T: GuestThread + ?Sized>(
        &mut self,
        thread: &mut T,
        big: bool,
        selector: Selector,
        offset: u32,
        old_eip: u32,
    ) -> Result<(), Fault> {
        let offset = if big { offset } else { offset & 0xFFFF };
        if self.in_vm86() {
            self.push_return_address(thread, big, old_eip);
            self.enter_vm86_code(selector.0, offset);
            return Ok(());
        }

        let desc = code_descriptor(&*thread, selector, "CALL")?;
        self.push_return_address(thread, big, old_eip);
        let cs = selector.error_code() | u16::from(self.cpl);
        self.commit_segment(SegReg::Cs, cs, desc.base);
        self.big = desc.seg_32bit;
        self.eip = offset;
        Ok(())
    }

    /// Far JMP to `selector:offset`.
    pub fn jmp<T: GuestThread + ?Sized>(
        &mut self,
        thread: &mut T,
        big: bool,
        selector: u32,
        offset: u32,
    ) -> Result<Completion, CpuExit> {
        let result = self
            .far_jmp(&*thread, big, Selector(selector as u16), offset)
            .map_err(Abort::from);
        self.complete(thread, result)
    }

    fn far_jmp<T: GuestThread + ?Sized>(
        &mut self,
        thread: &T,
        big: bool,
        selector: Selector,
        offset: u32,
    ) -> Result<(), Fault> {
        let offset = if big { offset } else { offset & 0xFFFF };
        if self.in_vm86() {
            self.enter_vm86_code(selector.0, offset);
            return Ok(());
        }

        let desc = code_descriptor(&*thread, selector, "JMP")?;
        let cs = selector.error_code() | u16::from(self.cpl);
        self.commit_segment(SegReg::Cs, cs, desc.base);
        self.big = desc.seg_32bit;
        self.eip = offset;
        Ok(())
    }

    /// Far RET, releasing `bytes` of parameters from the stack.
    pub fn ret<T: GuestThread + ?Sized>(
        &mut self,
        thread: &mut T,
        big: bool,
        bytes: u32,
    ) -> Result<Completion, CpuExit> {
        let result = self.far_ret(thread, big, bytes).map_err(Abort::from);
        self.complete(thread, result)
    }

    fn far_ret<T: GuestThread + ?Sized>(
        &mut self,
        thread: &mut T,
        big: bool,
        bytes: u32,
    ) -> Result<(), Fault> {
        let w = operand_bytes(big);
        let mem = thread.memory();
        let offset = self.frame_value(mem, big, 0);
        let selector = Selector(self.frame_value(mem, big, w) as u16);

        if self.in_vm86() {
            self.adjust_esp((2 * w).wrapping_add(bytes));
            self.enter_vm86_code(selector.0, offset);
            return Ok(());
        }

        guard(
            selector.rpl() >= self.cpl,
            "RET",
            "return to more privileged level",
            Fault::GeneralProtection(selector.error_code()),
        )?;
        let desc = code_descriptor(&*thread, selector, "RET")?;

        if selector.rpl() == self.cpl {
            self.adjust_esp((2 * w).wrapping_add(bytes));
            self.commit_segment(SegReg::Cs, selector.0, desc.base);
            self.big = desc.seg_32bit;
            self.eip = offset;
            return Ok(());
        }

        let mem = thread.memory();
        let new_esp = self.frame_value(mem, big, (2 * w).wrapping_add(bytes));
        let ss = Selector(self.frame_value(mem, big, (3 * w).wrapping_add(bytes)) as u16);
        let ss_desc = outer_stack_descriptor(
            &*thread,
            ss,
            selector,
            "RET",
            Fault::StackFault(ss.error_code()),
        )?;

        self.cpl = selector.rpl();
        self.commit_segment(SegReg::Cs, selector.0, desc.base);
        self.big = desc.seg_32bit;
        self.eip = offset;
        self.switch_stack(thread, ss.0, ss_desc, new_esp.wrapping_add(bytes));
        Ok(())
    }

    /// IRET.
    pub fn iret<T: GuestThread + ?Sized>(
        &mut self,
        thread: &mut T,
        big: bool,
    ) -> Result<Completion, CpuExit> {
        let result = self.interrupt_return(thread, big);
        self.complete(thread, result)
    }

    fn interrupt_return<T: GuestThread + ?Sized>(
        &mut self,
        thread: &mut T,
        big: bool,
    ) -> Result<(), Abort> {
        let w = operand_bytes(big);

        if self.in_vm86() {
            guard(
                self.iopl() == 3,
                "IRET",
                "virtual-8086 IRET with IOPL below 3",
                Fault::GeneralProtection(0),
            )?;
            let mem = thread.memory();
            let eip = self.frame_value(mem, big, 0);
            let cs = self.frame_value(mem, big, w) as u16;
            let flags = self.frame_value(mem, big, 2 * w);
            let mask = if big {
                FMASK_NORMAL | EFLAGS_NT
            } else {
                (FMASK_NORMAL | EFLAGS_NT) & 0xFFFF
            };
            self.adjust_esp(3 * w);
            self.enter_vm86_code(cs, eip);
            self.discard_lazy_flags();
            self.set_flags(flags, mask);
            return Ok(());
        }

        if self.flags & EFLAGS_NT != 0 {
            return Err(CpuExit::TaskSwitch.into());
        }

        let mem = thread.memory();
        let new_eip = self.frame_value(mem, big, 0);
        let selector = Selector(self.frame_value(mem, big, w) as u16);
        let mut new_flags = self.frame_value(mem, big, 2 * w);
        if !big {
            new_flags |= self.flags & 0xFFFF_0000;
        }

        if new_flags & EFLAGS_VM != 0 {
            if !big {
                return Err(CpuExit::Vm86In16BitFrame.into());
            }
            if self.cpl != 0 {
                return Err(CpuExit::Vm86ReturnFromCpl { cpl: self.cpl }.into());
            }
            return self.return_to_vm86(thread, new_eip, selector.0, new_flags);
        }

        guard(
            !selector.is_null(),
            "IRET",
            "CS selector zero",
            Fault::GeneralProtection(0),
        )?;
        guard(
            selector.in_table(),
            "IRET",
            "CS selector outside descriptor table",
            Fault::GeneralProtection(selector.error_code()),
        )?;
        guard(
            selector.rpl() >= self.cpl,
            "IRET",
            "return to more privileged level",
            Fault::GeneralProtection(selector.error_code()),
        )?;
        let desc = code_descriptor(&*thread, selector, "IRET")?;

        let mut mask = if self.cpl == 0 {
            FMASK_ALL
        } else {
            FMASK_NORMAL | EFLAGS_NT
        };
        if self.iopl() < self.cpl {
            mask &= !EFLAGS_IF;
        }
        if !big {
            mask &= 0xFFFF;
        }

        if selector.rpl() == self.cpl {
            self.adjust_esp(3 * w);
            self.commit_segment(SegReg::Cs, selector.0, desc.base);
            self.big = desc.seg_32bit;
            self.eip = new_eip;
            self.discard_lazy_flags();
            self.set_flags(new_flags, mask);
            return Ok(());
        }

        let mem = thread.memory();
        let new_esp = self.frame_value(mem, big, 3 * w);
        let ss = Selector(self.frame_value(mem, big, 4 * w) as u16);
        let ss_desc = outer_stack_descriptor(
            &*thread,
            ss,
            selector,
            "IRET",
            Fault::SegmentNotPresent(ss.error_code()),
        )?;

        self.commit_segment(SegReg::Cs, selector.0, desc.base);
        self.big = desc.seg_32bit;
        self.eip = new_eip;
        self.discard_lazy_flags();
        self.set_flags(new_flags, mask);
        self.cpl = selector.rpl();
        self.switch_stack(thread, ss.0, ss_desc, new_esp);
        Ok(())
    }

    /// Protected-mode IRET whose frame re-enters virtual-8086 mode at CPL 3.
    fn return_to_vm86<T: GuestThread + ?Sized>(
        &mut self,
        thread: &mut T,
        new_eip: u32,
        cs: u16,
        new_flags: u32,
    ) -> Result<(), Abort> {
        let mem = thread.memory();
        let new_esp = self.read_stack32(mem, 12);
        let selectors = [
            (SegReg::Ss, self.read_stack32(mem, 16)),
            (SegReg::Es, self.read_stack32(mem, 20)),
            (SegReg::Ds, self.read_stack32(mem, 24)),
            (SegReg::Fs, self.read_stack32(mem, 28)),
            (SegReg::Gs, self.read_stack32(mem, 32)),
        ];

        self.discard_lazy_flags();
        self.set_flags(new_flags, FMASK_NORMAL | EFLAGS_VM);
        self.cpl = 3;
        for (seg, value) in selectors {
            self.load_segment(thread, seg, value & 0xFFFF)?;
        }
        self.set_reg(Gpr::Esp, new_esp);
        self.enter_vm86_code(cs, new_eip & 0xFFFF);
        Ok(())
    }
}
