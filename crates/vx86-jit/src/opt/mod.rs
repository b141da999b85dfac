//! Optimization passes over a block's host instructions.

pub mod passes;

use tracing::debug;

use crate::ir::HostInst;

/// Runs every pass once. Returns whether anything changed.
pub fn optimize(insts: &mut Vec<HostInst>) -> bool {
    let removed = passes::flag_elim::run(insts);
    if removed > 0 {
        debug!(removed, "eliminated dead flag records");
    }
    removed > 0
}
