//! Runs a scenario's code through one of the engines.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};
use vx86_cpu_core::interp::{self, StepOutcome};
use vx86_cpu_core::{CpuExit, CpuState, DecodedOp, StandaloneThread};
use vx86_jit::{execute_block, translate_block, ExecError, ExitKind, TranslatedBlock};

use crate::scenario::Scenario;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Reference interpreter, one operation at a time.
    Interp,
    /// Translate blocks and run them on the reference backend.
    Jit,
}

/// Why the run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stop {
    /// EIP left every code region.
    OutOfCode { eip: u32 },
    /// A fault was delivered to the guest's handler.
    FaultDelivered { eip: u32 },
    StepLimit,
    Fatal(CpuExit),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub steps: usize,
    pub stop: Stop,
}

/// Code regions indexed by the address of each operation.
struct Program<'a> {
    regions: Vec<&'a [DecodedOp]>,
    at: HashMap<u32, (usize, usize)>,
}

impl<'a> Program<'a> {
    fn new(scenario: &'a Scenario, code32: bool) -> Self {
        let mut regions = Vec::new();
        let mut at = HashMap::new();
        for (r, region) in scenario.code.iter().enumerate() {
            let mut eip = region.at;
            for (i, op) in region.ops.iter().enumerate() {
                at.insert(eip, (r, i));
                eip = eip.wrapping_add(u32::from(op.len));
                if !code32 {
                    eip &= 0xFFFF;
                }
            }
            regions.push(region.ops.as_slice());
        }
        Self { regions, at }
    }

    /// The operations from `eip` to the end of its region.
    fn ops_at(&self, eip: u32) -> Option<&'a [DecodedOp]> {
        let (r, i) = *self.at.get(&eip)?;
        self.regions.get(r).and_then(|ops| ops.get(i..))
    }

    /// Operations from `start` up to and including the one at `last`, within one region.
    fn count_through(&self, start: u32, last: u32) -> Option<usize> {
        let (r0, i0) = *self.at.get(&start)?;
        let (r1, i1) = *self.at.get(&last)?;
        (r0 == r1 && i1 >= i0).then(|| i1 - i0 + 1)
    }
}

pub fn run(
    scenario: &Scenario,
    engine: Engine,
    cpu: &mut CpuState,
    thread: &mut StandaloneThread,
) -> Result<RunSummary> {
    let program = Program::new(scenario, cpu.big);
    info!(?engine, entry = cpu.eip, "running scenario");
    let summary = match engine {
        Engine::Interp => run_interp(&program, scenario.max_steps, cpu, thread),
        Engine::Jit => run_jit(&program, scenario, cpu, thread)?,
    };
    info!(steps = summary.steps, stop = ?summary.stop, "scenario finished");
    Ok(summary)
}

fn run_interp(
    program: &Program<'_>,
    max_steps: usize,
    cpu: &mut CpuState,
    thread: &mut StandaloneThread,
) -> RunSummary {
    let mut steps = 0;
    while steps < max_steps {
        let Some(op) = program.ops_at(cpu.eip).and_then(|ops| ops.first()) else {
            return RunSummary {
                steps,
                stop: Stop::OutOfCode { eip: cpu.eip },
            };
        };
        steps += 1;
        match interp::step(cpu, thread, op) {
            Ok(StepOutcome::Faulted) => {
                return RunSummary {
                    steps,
                    stop: Stop::FaultDelivered { eip: cpu.eip },
                }
            }
            Ok(_) => {}
            Err(exit) => {
                return RunSummary {
                    steps,
                    stop: Stop::Fatal(exit),
                }
            }
        }
    }
    RunSummary {
        steps,
        stop: Stop::StepLimit,
    }
}

fn run_jit(
    program: &Program<'_>,
    scenario: &Scenario,
    cpu: &mut CpuState,
    thread: &mut StandaloneThread,
) -> Result<RunSummary> {
    let config = &scenario.emitter;
    // Keyed by entry EIP and code size.
    let mut cache: HashMap<(u32, bool), TranslatedBlock> = HashMap::new();
    let mut steps = 0;

    while steps < scenario.max_steps {
        let eip = cpu.eip;
        let Some(ops) = program.ops_at(eip) else {
            return Ok(RunSummary {
                steps,
                stop: Stop::OutOfCode { eip },
            });
        };
        let remaining = scenario.max_steps - steps;
        let ops = &ops[..ops.len().min(remaining.min(config.max_block_ops).max(1))];

        let key = (eip, cpu.big);
        if cache.get(&key).is_some_and(|block| block.guest_ops > remaining) {
            debug!(eip, remaining, "cached block overruns the step limit");
            cache.remove(&key);
        }
        let block = match cache.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let block = translate_block(&*cpu, &*thread, ops, config)
                    .with_context(|| format!("translating block at {eip:#x}"))?;
                entry.insert(block)
            }
        };
        let guest_ops = block.guest_ops;

        match execute_block(block, cpu, thread) {
            Ok(ExitKind::Faulted) => {
                // The block stops at the faulting operation.
                steps += program.count_through(eip, cpu.eip).unwrap_or(guest_ops);
                return Ok(RunSummary {
                    steps,
                    stop: Stop::FaultDelivered { eip: cpu.eip },
                });
            }
            Ok(_) => steps += guest_ops,
            Err(ExecError::StaleBlock(start)) => {
                debug!(start, "retranslating stale block");
                cache.remove(&key);
            }
            Err(ExecError::Fatal(exit)) => {
                return Ok(RunSummary {
                    steps: steps + program.count_through(eip, cpu.eip).unwrap_or(0),
                    stop: Stop::Fatal(exit),
                });
            }
            Err(err) => return Err(err).context("executing translated block"),
        }
    }
    Ok(RunSummary {
        steps,
        stop: Stop::StepLimit,
    })
}
