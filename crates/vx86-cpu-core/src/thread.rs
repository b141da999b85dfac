//! Collaborators owned by the guest thread/process subsystem.
//!
//! The CPU core never owns these. Every operation that needs them borrows the thread for the
//! duration of one instruction step.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::descriptors::{Descriptor, DescriptorLookup, LocalDescriptorTable};
use crate::exceptions::{Signal, SignalDisposition, SignalInfo};
use crate::mem::{FlatMemory, GuestMemory};
use crate::state::{CpuState, SegReg, SEG_COUNT};

/// Per-process record of stack-addressing changes, consulted by the code emitter.
///
/// Both markers are sticky: once a thread of the process reloads SS or switches to a 16-bit
/// stack, every later translation uses the general stack path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessFlags {
    pub has_set_stack_mask: bool,
    pub has_set_seg: [bool; SEG_COUNT],
}

impl ProcessFlags {
    /// ESP can be used directly as a linear address.
    pub fn flat_stack(&self) -> bool {
        !self.has_set_stack_mask && !self.has_set_seg[SegReg::Ss.index()]
    }
}

pub trait SignalDelivery {
    fn disposition(&self, signal: Signal) -> SignalDisposition;

    /// Runs the guest handler for `info`. May redirect `cpu` to the handler.
    fn run_signal(&mut self, cpu: &mut CpuState, info: SignalInfo);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLocation {
    pub path: String,
    pub offset: u32,
}

/// Diagnostic symbol lookup, used only while reporting a fatal fault.
pub trait SymbolResolver {
    fn module_at(&self, linear: u32) -> Option<ModuleLocation>;
    fn function_name(&self, module: &str, offset: u32) -> Option<String>;
}

pub trait GuestThread: DescriptorLookup + SignalDelivery + SymbolResolver {
    fn memory(&self) -> &dyn GuestMemory;
    fn memory_mut(&mut self) -> &mut dyn GuestMemory;
    fn process_flags(&self) -> &ProcessFlags;
    fn process_flags_mut(&mut self) -> &mut ProcessFlags;
    fn engine_config(&self) -> &EngineConfig;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Module {
    path: String,
    base: u32,
    size: u32,
    symbols: BTreeMap<u32, String>,
}

/// Self-contained thread: flat memory, a private LDT, a signal table that records deliveries and
/// a static module map.
#[derive(Debug, Clone)]
pub struct StandaloneThread {
    pub memory: FlatMemory,
    pub ldt: LocalDescriptorTable,
    pub process_flags: ProcessFlags,
    pub config: EngineConfig,
    dispositions: HashMap<Signal, SignalDisposition>,
    delivered: Vec<SignalInfo>,
    modules: Vec<Module>,
}

impl StandaloneThread {
    pub fn new(memory_size: usize) -> Self {
        Self {
            memory: FlatMemory::new(memory_size),
            ldt: LocalDescriptorTable::new(),
            process_flags: ProcessFlags::default(),
            config: EngineConfig::default(),
            dispositions: HashMap::new(),
            delivered: Vec::new(),
            modules: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn set_descriptor(&mut self, index: u32, desc: Descriptor) {
        self.ldt.set(index, desc);
    }

    pub fn set_disposition(&mut self, signal: Signal, disposition: SignalDisposition) {
        self.dispositions.insert(signal, disposition);
    }

    /// Signals delivered so far, oldest first.
    pub fn delivered(&self) -> &[SignalInfo] {
        &self.delivered
    }

    pub fn map_module(&mut self, path: &str, base: u32, size: u32) {
        self.modules.push(Module {
            path: path.to_string(),
            base,
            size,
            symbols: BTreeMap::new(),
        });
    }

    /// Registers `name` as the function starting at `offset` within `module`.
    pub fn add_symbol(&mut self, module: &str, offset: u32, name: &str) {
        if let Some(m) = self.modules.iter_mut().find(|m| m.path == module) {
            m.symbols.insert(offset, name.to_string());
        }
    }
}

impl DescriptorLookup for StandaloneThread {
    fn descriptor(&self, index: u32) -> Option<&Descriptor> {
        self.ldt.descriptor(index)
    }
}

impl SignalDelivery for StandaloneThread {
    fn disposition(&self, signal: Signal) -> SignalDisposition {
        self.dispositions.get(&signal).copied().unwrap_or_default()
    }

    fn run_signal(&mut self, _cpu: &mut CpuState, info: SignalInfo) {
        self.delivered.push(info);
    }
}

impl SymbolResolver for StandaloneThread {
    fn module_at(&self, linear: u32) -> Option<ModuleLocation> {
        self.modules
            .iter()
            .find(|m| linear >= m.base && linear - m.base < m.size)
            .map(|m| ModuleLocation {
                path: m.path.clone(),
                offset: linear - m.base,
            })
    }

    fn function_name(&self, module: &str, offset: u32) -> Option<String> {
        let m = self.modules.iter().find(|m| m.path == module)?;
        m.symbols
            .range(..=offset)
            .next_back()
            .map(|(_, name)| name.clone())
    }
}

impl GuestThread for StandaloneThread {
    fn memory(&self) -> &dyn GuestMemory {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut dyn GuestMemory {
        &mut self.memory
    }

    fn process_flags(&self) -> &ProcessFlags {
        &self.process_flags
    }

    fn process_flags_mut(&mut self) -> &mut ProcessFlags {
        &mut self.process_flags
    }

    fn engine_config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_lookup_uses_enclosing_function() {
        let mut thread = StandaloneThread::new(0);
        thread.map_module("/lib/libfoo.so", 0x1000, 0x1000);
        thread.add_symbol("/lib/libfoo.so", 0x100, "foo_init");
        thread.add_symbol("/lib/libfoo.so", 0x200, "foo_run");

        let loc = thread.module_at(0x1250).unwrap();
        assert_eq!(loc.offset, 0x250);
        assert_eq!(
            thread.function_name(&loc.path, loc.offset).as_deref(),
            Some("foo_run")
        );
        assert_eq!(thread.function_name(&loc.path, 0x10), None);
        assert!(thread.module_at(0x2000).is_none());
    }

    #[test]
    fn unset_dispositions_are_default() {
        let mut thread = StandaloneThread::new(0);
        assert_eq!(thread.disposition(Signal::Segv), SignalDisposition::Default);
        thread.set_disposition(Signal::Segv, SignalDisposition::Handler);
        assert!(thread.disposition(Signal::Segv).is_handler());
    }
}
