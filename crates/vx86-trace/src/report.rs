//! Final-state summary printed by the binary.

use std::collections::BTreeMap;

use serde::Serialize;
use vx86_cpu_core::{StackTrace, CpuExit, CpuState, Gpr, SegReg, Segment, SignalInfo, StandaloneThread};

use crate::driver::{RunSummary, Stop};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReport {
    OutOfCode {
        eip: u32,
    },
    FaultDelivered {
        eip: u32,
    },
    StepLimit,
    Fatal {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        backtrace: Option<StackTrace>,
    },
}

impl From<&Stop> for StopReport {
    fn from(stop: &Stop) -> Self {
        match stop {
            Stop::OutOfCode { eip } => StopReport::OutOfCode { eip: *eip },
            Stop::FaultDelivered { eip } => StopReport::FaultDelivered { eip: *eip },
            Stop::StepLimit => StopReport::StepLimit,
            Stop::Fatal(exit) => StopReport::Fatal {
                reason: exit.to_string(),
                backtrace: match exit {
                    CpuExit::UnhandledFault { stack_trace, .. } => Some(stack_trace.clone()),
                    _ => None,
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub steps: usize,
    pub stop: StopReport,
    pub eip: u32,
    pub cpl: u8,
    pub flags: u32,
    pub regs: BTreeMap<Gpr, u32>,
    pub segments: BTreeMap<SegReg, Segment>,
    pub signals: Vec<SignalInfo>,
}

impl Report {
    /// Materializes the flags, so `cpu` is left without a pending record.
    pub fn new(summary: &RunSummary, cpu: &mut CpuState, thread: &StandaloneThread) -> Self {
        cpu.fill_flags();
        let regs = Gpr::ALL
            .into_iter()
            .filter(|reg| *reg != Gpr::Tmp)
            .map(|reg| (reg, cpu.reg(reg)))
            .collect();
        let segments = [
            SegReg::Es,
            SegReg::Cs,
            SegReg::Ss,
            SegReg::Ds,
            SegReg::Fs,
            SegReg::Gs,
        ]
        .into_iter()
        .map(|seg| (seg, cpu.seg(seg)))
        .collect();
        Self {
            steps: summary.steps,
            stop: StopReport::from(&summary.stop),
            eip: cpu.eip,
            cpl: cpu.cpl(),
            flags: cpu.flags(),
            regs,
            segments,
            signals: thread.delivered().to_vec(),
        }
    }
}
