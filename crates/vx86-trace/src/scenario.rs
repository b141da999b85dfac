//! Scenario file format.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use vx86_cpu_core::{
    Completion, CpuState, DecodedOp, Descriptor, EngineConfig, Gpr, GuestMemory, SegReg, Signal,
    SignalDisposition, StandaloneThread,
};
use vx86_jit::EmitterConfig;

fn default_memory_size() -> usize {
    0x10_0000
}

fn default_max_steps() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_cpl() -> u8 {
    3
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub emitter: EmitterConfig,
    #[serde(default = "default_memory_size")]
    pub memory_size: usize,
    /// Upper bound on executed guest operations.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default)]
    pub cpu: InitialCpu,
    /// Segment registers loaded, in order, before the first operation runs.
    #[serde(default)]
    pub segments: Vec<SegmentLoad>,
    #[serde(default)]
    pub ldt: Vec<LdtEntry>,
    #[serde(default)]
    pub memory: Vec<MemoryChunk>,
    #[serde(default)]
    pub signals: BTreeMap<Signal, SignalDisposition>,
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
    pub code: Vec<CodeRegion>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitialCpu {
    #[serde(default)]
    pub eip: u32,
    #[serde(default = "default_true")]
    pub big: bool,
    #[serde(default = "default_cpl")]
    pub cpl: u8,
    #[serde(default)]
    pub regs: BTreeMap<Gpr, u32>,
}

impl Default for InitialCpu {
    fn default() -> Self {
        Self {
            eip: 0,
            big: true,
            cpl: default_cpl(),
            regs: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentLoad {
    pub seg: SegReg,
    pub selector: u16,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LdtEntry {
    pub index: u32,
    #[serde(flatten)]
    pub descriptor: Descriptor,
}

/// Little-endian dwords stored from `addr` upwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryChunk {
    pub addr: u32,
    pub dwords: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleSpec {
    pub path: String,
    pub base: u32,
    pub size: u32,
    /// Function names keyed by offset within the module.
    #[serde(default)]
    pub symbols: BTreeMap<u32, String>,
}

/// Decoded operations laid out back to back from `at`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeRegion {
    pub at: u32,
    pub ops: Vec<DecodedOp>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid scenario {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let scenario: Scenario = serde_json::from_str(text)?;
        if scenario.code.iter().all(|region| region.ops.is_empty()) {
            bail!("scenario has no code");
        }
        Ok(scenario)
    }

    /// Builds the initial CPU state and thread.
    pub fn build(&self) -> Result<(CpuState, StandaloneThread)> {
        let mut thread = StandaloneThread::new(self.memory_size).with_config(self.engine.clone());
        for entry in &self.ldt {
            thread.set_descriptor(entry.index, entry.descriptor);
        }
        for (signal, disposition) in &self.signals {
            thread.set_disposition(*signal, *disposition);
        }
        for module in &self.modules {
            thread.map_module(&module.path, module.base, module.size);
            for (offset, name) in &module.symbols {
                thread.add_symbol(&module.path, *offset, name);
            }
        }
        for chunk in &self.memory {
            for (i, value) in chunk.dwords.iter().enumerate() {
                let addr = chunk.addr.wrapping_add(4 * i as u32);
                thread.memory.write_u32(addr, *value);
            }
        }

        let mut cpu = CpuState::new().with_cpl(self.cpu.cpl);
        cpu.eip = self.cpu.eip;
        cpu.big = self.cpu.big;
        for (reg, value) in &self.cpu.regs {
            cpu.set_reg(*reg, *value);
        }
        for load in &self.segments {
            let done = cpu
                .set_segment(&mut thread, load.seg, u32::from(load.selector))
                .with_context(|| format!("loading {:?}", load.seg))?;
            if done == Completion::FaultDelivered {
                bail!(
                    "initial load of {:?} with selector {:#x} faulted",
                    load.seg,
                    load.selector
                );
            }
        }
        Ok((cpu, thread))
    }
}
