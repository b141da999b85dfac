use serde::{Deserialize, Serialize};

/// Translation options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Inline 32-bit stack accesses when the process has a flat stack.
    pub stack_fast_path: bool,
    /// Drop lazy-flag records that are overwritten before anything observes them.
    pub elide_dead_flags: bool,
    /// Longest block (in guest operations) a single translation may produce.
    pub max_block_ops: usize,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            stack_fast_path: true,
            elide_dead_flags: true,
            max_block_ops: 256,
        }
    }
}
