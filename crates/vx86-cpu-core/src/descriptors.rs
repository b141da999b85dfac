//! Local descriptor table entries and selector decoding.

use serde::{Deserialize, Serialize};

/// Number of slots in a local descriptor table.
pub const LDT_ENTRIES: u32 = 8192;

/// One LDT slot as the guest installed it (via `modify_ldt` / `set_thread_area`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Descriptor {
    pub base: u32,
    pub limit: u32,
    #[serde(default = "default_true")]
    pub seg_32bit: bool,
    #[serde(default)]
    pub not_present: bool,
}

fn default_true() -> bool {
    true
}

impl Descriptor {
    pub fn flat32() -> Self {
        Self {
            base: 0,
            limit: 0xF_FFFF,
            seg_32bit: true,
            not_present: false,
        }
    }

    pub fn is_present(&self) -> bool {
        !self.not_present
    }
}

/// Selector decoding helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selector(pub u16);

impl Selector {
    pub fn index(self) -> u32 {
        u32::from(self.0 >> 3)
    }

    pub fn rpl(self) -> u8 {
        (self.0 & 3) as u8
    }

    /// Index and table bits are zero; the RPL is ignored.
    pub fn is_null(self) -> bool {
        self.0 & 0xFFFC == 0
    }

    /// The selector as reported in a fault error code.
    pub fn error_code(self) -> u16 {
        self.0 & 0xFFFC
    }

    pub fn in_table(self) -> bool {
        self.index() < LDT_ENTRIES
    }
}

/// Read access to a process's local descriptor table.
///
/// The returned reference is only valid for the current instruction step; callers copy what they
/// need and never keep it across a scheduling point.
pub trait DescriptorLookup {
    fn descriptor(&self, index: u32) -> Option<&Descriptor>;
}

/// Sparse owned LDT.
#[derive(Debug, Clone, Default)]
pub struct LocalDescriptorTable {
    entries: Vec<Option<Descriptor>>,
}

impl LocalDescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `desc` at `index`. Indices beyond the table size are ignored.
    pub fn set(&mut self, index: u32, desc: Descriptor) {
        if index >= LDT_ENTRIES {
            return;
        }
        let index = index as usize;
        if self.entries.len() <= index {
            self.entries.resize(index + 1, None);
        }
        self.entries[index] = Some(desc);
    }

    pub fn clear(&mut self, index: u32) {
        if let Some(slot) = self.entries.get_mut(index as usize) {
            *slot = None;
        }
    }
}

impl DescriptorLookup for LocalDescriptorTable {
    fn descriptor(&self, index: u32) -> Option<&Descriptor> {
        self.entries.get(index as usize).and_then(Option::as_ref)
    }
}
