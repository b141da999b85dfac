//! Code buffer written by one translation and the immutable block it publishes.

use std::sync::Arc;

use tracing::debug;

use crate::ir::HostInst;

/// Append-only buffer owned by a single translation request.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    insts: Vec<HostInst>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, inst: HostInst) {
        self.insts.push(inst);
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn insts(&self) -> &[HostInst] {
        &self.insts
    }

    pub(crate) fn insts_mut(&mut self) -> &mut Vec<HostInst> {
        &mut self.insts
    }

    /// Freezes the buffer. The returned block can be shared between threads and is never written
    /// again.
    pub fn publish(
        self,
        start_eip: u32,
        code32: bool,
        assumes_flat_stack: bool,
        guest_ops: usize,
    ) -> TranslatedBlock {
        debug!(
            start_eip,
            code32,
            assumes_flat_stack,
            guest_ops,
            host_insts = self.insts.len(),
            "publish block"
        );
        TranslatedBlock {
            start_eip,
            code32,
            assumes_flat_stack,
            guest_ops,
            insts: self.insts.into(),
        }
    }
}

/// A published translation of one guest block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedBlock {
    pub start_eip: u32,
    /// Translated for a 32-bit code segment.
    pub code32: bool,
    /// Contains inlined stack accesses that treat ESP as a linear address.
    pub assumes_flat_stack: bool,
    /// Number of guest operations the block covers.
    pub guest_ops: usize,
    insts: Arc<[HostInst]>,
}

impl TranslatedBlock {
    pub fn insts(&self) -> &[HostInst] {
        &self.insts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ExitKind, HostReg};

    #[test]
    fn published_blocks_share_code() {
        let mut buf = CodeBuffer::new();
        buf.emit(HostInst::MovImm {
            dst: HostReg::Src,
            imm: 7,
        });
        buf.emit(HostInst::Exit {
            exit: ExitKind::Completed,
        });
        let block = buf.publish(0x1000, true, true, 1);
        let copy = block.clone();
        assert_eq!(copy.insts().len(), 2);
        assert!(std::ptr::eq(block.insts(), copy.insts()));
    }
}
