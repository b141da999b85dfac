//! Segment register loads and the non-faulting descriptor queries (LAR/LSL).

use crate::descriptors::{Descriptor, Selector};
use crate::exceptions::{guard, reject, Abort, Completion, CpuExit, Fault};
use crate::state::{CpuState, Segment, SegReg, EFLAGS_ZF};
use crate::thread::GuestThread;

/// Records an SS load in the process-wide stack tracking flags.
pub(crate) fn note_stack_load<T: GuestThread + ?Sized>(thread: &mut T, seg_32bit: bool) {
    let flags = thread.process_flags_mut();
    flags.has_set_seg[SegReg::Ss.index()] = true;
    if !seg_32bit {
        flags.has_set_stack_mask = true;
    }
}

impl CpuState {
    pub(crate) fn commit_segment(&mut self, seg: SegReg, selector: u16, base: u32) {
        self.segs[seg.index()] = Segment { selector, base };
    }

    /// Loads `seg` from `value` without dispatching a fault.
    ///
    /// On failure nothing is modified.
    pub fn load_segment<T: GuestThread + ?Sized>(
        &mut self,
        thread: &mut T,
        seg: SegReg,
        value: u32,
    ) -> Result<(), Fault> {
        let selector = Selector(value as u16);

        if self.in_vm86() {
            self.commit_segment(seg, selector.0, u32::from(selector.0) << 4);
            if seg == SegReg::Ss {
                self.set_stack_width(false);
                note_stack_load(thread, false);
            }
            return Ok(());
        }

        if selector.is_null() {
            self.commit_segment(seg, 0, 0);
            return Ok(());
        }

        let desc = thread.descriptor(selector.index()).copied().ok_or_else(|| {
            reject(
                "segment load",
                "descriptor missing",
                Fault::GeneralProtection(selector.error_code()),
            )
        })?;
        let absent = if seg == SegReg::Ss {
            Fault::StackFault(selector.error_code())
        } else {
            Fault::SegmentNotPresent(selector.error_code())
        };
        guard(desc.is_present(), "segment load", "segment not present", absent)?;

        self.commit_segment(seg, selector.0, desc.base);
        thread.process_flags_mut().has_set_seg[seg.index()] = true;
        if seg == SegReg::Ss {
            self.set_stack_width(desc.seg_32bit);
            note_stack_load(thread, desc.seg_32bit);
        }
        Ok(())
    }

    /// Loads `seg`, delivering any fault to the guest.
    pub fn set_segment<T: GuestThread + ?Sized>(
        &mut self,
        thread: &mut T,
        seg: SegReg,
        value: u32,
    ) -> Result<Completion, CpuExit> {
        let result = self.load_segment(thread, seg, value).map_err(Abort::from);
        self.complete(thread, result)
    }

    fn query_descriptor<T: GuestThread + ?Sized>(
        &self,
        thread: &T,
        selector: u32,
    ) -> Option<Descriptor> {
        let sel = Selector(selector as u16);
        if sel.0 == 0 || !sel.in_table() {
            return None;
        }
        thread.descriptor(sel.index()).copied()
    }

    /// LAR. ZF reports whether `selector` names a descriptor; `ar` is returned unchanged if not.
    pub fn lar<T: GuestThread + ?Sized>(&mut self, thread: &T, selector: u32, ar: u32) -> u32 {
        self.fill_flags_no_zf();
        match self.query_descriptor(thread, selector) {
            None => {
                self.remove_flag(EFLAGS_ZF);
                ar
            }
            Some(desc) => {
                self.add_flag(EFLAGS_ZF);
                let mut ar = 0;
                if desc.is_present() {
                    ar |= 0x0100;
                }
                // DPL 3, code/data, accessed.
                ar | 0x0600 | 0x0800 | 0x8000
            }
        }
    }

    /// LSL. ZF reports whether `selector` names a descriptor; `limit` is returned unchanged if
    /// not.
    pub fn lsl<T: GuestThread + ?Sized>(&mut self, thread: &T, selector: u32, limit: u32) -> u32 {
        self.fill_flags_no_zf();
        match self.query_descriptor(thread, selector) {
            None => {
                self.remove_flag(EFLAGS_ZF);
                limit
            }
            Some(desc) => {
                self.add_flag(EFLAGS_ZF);
                desc.limit
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::StandaloneThread;

    fn thread() -> StandaloneThread {
        let mut t = StandaloneThread::new(0x1000);
        t.set_descriptor(
            2,
            Descriptor {
                base: 0x1000,
                limit: 0xFFFF,
                seg_32bit: false,
                not_present: false,
            },
        );
        t.set_descriptor(
            3,
            Descriptor {
                not_present: true,
                ..Descriptor::flat32()
            },
        );
        t
    }

    #[test]
    fn ss_load_derives_stack_width_and_marks_process() {
        let mut cpu = CpuState::new();
        let mut t = thread();
        cpu.load_segment(&mut t, SegReg::Ss, 0x17).unwrap();
        assert_eq!(cpu.seg(SegReg::Ss), Segment { selector: 0x17, base: 0x1000 });
        assert_eq!(cpu.stack_mask(), 0xFFFF);
        assert!(t.process_flags.has_set_stack_mask);
        assert!(!t.process_flags.flat_stack());
    }

    #[test]
    fn not_present_fault_depends_on_register() {
        let mut cpu = CpuState::new();
        let mut t = thread();
        assert_eq!(
            cpu.load_segment(&mut t, SegReg::Ss, 0x1F),
            Err(Fault::StackFault(0x1C))
        );
        assert_eq!(
            cpu.load_segment(&mut t, SegReg::Ds, 0x1F),
            Err(Fault::SegmentNotPresent(0x1C))
        );
        assert!(t.process_flags.flat_stack());
    }

    #[test]
    fn vm86_loads_shift_selector() {
        let mut cpu = CpuState::new();
        let mut t = thread();
        cpu.set_flags(crate::state::EFLAGS_VM, crate::state::EFLAGS_VM);
        cpu.load_segment(&mut t, SegReg::Es, 0xB800).unwrap();
        assert_eq!(cpu.seg(SegReg::Es).base, 0xB_8000);
    }

    #[test]
    fn lar_reports_presence_bits() {
        let mut cpu = CpuState::new();
        let t = thread();
        assert_eq!(cpu.lar(&t, 0x17, 0), 0x8F00);
        assert!(cpu.zf());
        assert_eq!(cpu.lar(&t, 0x1F, 0), 0x8E00);

        assert_eq!(cpu.lar(&t, 0, 0x55), 0x55);
        assert!(!cpu.zf());
        assert_eq!(cpu.lar(&t, 0x27, 0x66), 0x66);
        assert!(!cpu.zf());
    }

    #[test]
    fn lsl_returns_limit() {
        let mut cpu = CpuState::new();
        let t = thread();
        assert_eq!(cpu.lsl(&t, 0x17, 0), 0xFFFF);
        assert!(cpu.zf());
        assert_eq!(cpu.lsl(&t, 0x2F, 7), 7);
        assert!(!cpu.zf());
    }
}
