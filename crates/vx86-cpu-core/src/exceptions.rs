//! CPU fault dispatch.
//!
//! A [`Fault`] is always synchronous and tied to the instruction that raised it. If the guest
//! process has a handler installed for the corresponding signal the fault is delivered as that
//! signal; otherwise the frame-pointer chain is logged and emulation of the process stops with a
//! [`CpuExit`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::state::{CpuState, Gpr, SegReg};
use crate::thread::GuestThread;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivideKind {
    /// Division by zero (`#DE` from a zero divisor).
    Zero,
    /// Quotient does not fit the destination.
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    #[error("general protection fault (error {0:#06x})")]
    GeneralProtection(u16),
    #[error("segment not present (error {0:#06x})")]
    SegmentNotPresent(u16),
    #[error("stack fault (error {0:#06x})")]
    StackFault(u16),
    #[error("divide error ({0:?})")]
    Divide(DivideKind),
}

impl Fault {
    pub fn vector(self) -> u8 {
        match self {
            Fault::Divide(_) => 0,
            Fault::SegmentNotPresent(_) => 11,
            Fault::StackFault(_) => 12,
            Fault::GeneralProtection(_) => 13,
        }
    }

    pub fn error_code(self) -> u32 {
        match self {
            Fault::GeneralProtection(e) | Fault::SegmentNotPresent(e) | Fault::StackFault(e) => {
                u32::from(e)
            }
            Fault::Divide(DivideKind::Zero) => 0,
            Fault::Divide(DivideKind::Overflow) => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Fpe,
    Segv,
}

impl Signal {
    /// Linux signal number.
    pub fn number(self) -> u32 {
        match self {
            Signal::Fpe => 8,
            Signal::Segv => 11,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalDisposition {
    #[default]
    Default,
    Ignore,
    Handler,
}

impl SignalDisposition {
    /// Only a guest-installed handler can take a CPU fault; default and ignore are fatal.
    pub fn is_handler(self) -> bool {
        self == SignalDisposition::Handler
    }
}

/// What the guest handler receives for a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalInfo {
    pub signal: Signal,
    /// x86 trap number reported in the signal context.
    pub trap: u32,
    pub error: u32,
    /// Faulting instruction pointer, for faults that report one.
    pub address: Option<u32>,
}

impl SignalInfo {
    pub fn for_fault(fault: Fault, eip: u32) -> Self {
        let (signal, trap, address) = match fault {
            Fault::GeneralProtection(_) => (Signal::Segv, 13, None),
            Fault::Divide(DivideKind::Zero) => (Signal::Fpe, 0, Some(eip)),
            Fault::Divide(DivideKind::Overflow) => (Signal::Segv, 4, Some(eip)),
            Fault::SegmentNotPresent(_) => (Signal::Segv, 11, Some(eip)),
            Fault::StackFault(_) => (Signal::Segv, 12, Some(eip)),
        };
        Self {
            signal,
            trap,
            error: fault.error_code(),
            address,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub module: String,
    pub function: String,
    pub eip: u32,
    pub module_offset: u32,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<20} {:<40} {:08x} / {:08x}",
            self.module, self.function, self.eip, self.module_offset
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StackTrace {
    pub frames: Vec<StackFrame>,
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(f, "  {frame}")?;
        }
        Ok(())
    }
}

/// Non-resumable end of emulation for the current process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CpuExit {
    #[error("unhandled exception: {fault} at eip {eip:#010x}")]
    UnhandledFault {
        fault: Fault,
        eip: u32,
        stack_trace: StackTrace,
    },
    #[error("cpu tasks not implemented")]
    TaskSwitch,
    #[error("IRET from protected mode to virtual-8086 mode with CPL {cpl}")]
    Vm86ReturnFromCpl { cpl: u8 },
    #[error("VM flag in 16-bit IRET frame")]
    Vm86In16BitFrame,
}

/// How an instruction that validates its operands finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    /// A fault was raised and delivered to the guest; no state was committed.
    FaultDelivered,
}

/// Internal result of a control transfer before dispatch.
#[derive(Debug)]
pub(crate) enum Abort {
    Fault(Fault),
    Exit(CpuExit),
}

impl From<Fault> for Abort {
    fn from(fault: Fault) -> Self {
        Abort::Fault(fault)
    }
}

impl From<CpuExit> for Abort {
    fn from(exit: CpuExit) -> Self {
        Abort::Exit(exit)
    }
}

/// Logs a failed check of `op` and hands back the fault it raises.
pub(crate) fn reject(op: &str, what: &str, fault: Fault) -> Fault {
    warn!(%fault, "{op}: {what}");
    fault
}

/// Fails with `fault` unless `ok`.
pub(crate) fn guard(ok: bool, op: &str, what: &str, fault: Fault) -> Result<(), Fault> {
    if ok {
        Ok(())
    } else {
        Err(reject(op, what, fault))
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl CpuState {
    /// Routes `fault` to the guest or, without a handler, ends emulation.
    pub fn prepare_exception<T: GuestThread + ?Sized>(
        &mut self,
        thread: &mut T,
        fault: Fault,
    ) -> Result<(), CpuExit> {
        let info = SignalInfo::for_fault(fault, self.eip);
        if thread.disposition(info.signal).is_handler() {
            debug!(%fault, signal = info.signal.number(), trap = info.trap, "delivering fault");
            thread.run_signal(self, info);
            return Ok(());
        }

        let stack_trace = self.walk_stack(&*thread, self.eip, self.reg(Gpr::Ebp));
        for frame in &stack_trace.frames {
            error!("  {frame}");
        }
        error!(%fault, eip = self.eip, "unhandled exception");
        Err(CpuExit::UnhandledFault {
            fault,
            eip: self.eip,
            stack_trace,
        })
    }

    pub(crate) fn complete<T: GuestThread + ?Sized>(
        &mut self,
        thread: &mut T,
        result: Result<(), Abort>,
    ) -> Result<Completion, CpuExit> {
        match result {
            Ok(()) => Ok(Completion::Done),
            Err(Abort::Fault(fault)) => {
                self.prepare_exception(thread, fault)?;
                Ok(Completion::FaultDelivered)
            }
            Err(Abort::Exit(exit)) => Err(exit),
        }
    }

    /// Follows the saved-EBP chain starting at `eip`/`ebp`.
    ///
    /// Stops at a null saved frame pointer, at unreadable memory, or after the configured number
    /// of frames.
    pub fn walk_stack<T: GuestThread + ?Sized>(&self, thread: &T, eip: u32, ebp: u32) -> StackTrace {
        let config = thread.engine_config();
        let cs_base = self.seg(SegReg::Cs).base;
        let (mut eip, mut ebp) = (eip, ebp);
        let mut frames = Vec::new();

        while frames.len() < config.backtrace_limit {
            let linear = cs_base.wrapping_add(eip);
            let frame = match thread.module_at(linear) {
                Some(location) => {
                    let function = if config.symbolize_backtraces {
                        thread.function_name(&location.path, location.offset)
                    } else {
                        None
                    };
                    StackFrame {
                        module: file_name(&location.path).to_string(),
                        function: function.unwrap_or_else(|| "Unknown".to_string()),
                        eip,
                        module_offset: location.offset,
                    }
                }
                None => StackFrame {
                    module: "Unknown".to_string(),
                    function: "Unknown".to_string(),
                    eip,
                    module_offset: linear,
                },
            };
            frames.push(frame);

            let mem = thread.memory();
            if !mem.is_readable(ebp, 8) {
                break;
            }
            let prev_ebp = mem.read_u32(ebp);
            let return_eip = mem.read_u32(ebp.wrapping_add(4));
            if prev_ebp == 0 {
                break;
            }
            eip = return_eip;
            ebp = prev_ebp;
        }

        StackTrace { frames }
    }
}
