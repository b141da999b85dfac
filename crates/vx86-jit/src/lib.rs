#![forbid(unsafe_code)]

//! Block translator for `vx86-cpu-core`.
//!
//! Decoded guest operations are lowered ([`translate_block`]) into a small host instruction set
//! ([`ir`]), optionally cleaned up by [`opt`], and published as an immutable
//! [`TranslatedBlock`]. [`execute_block`] runs a published block against the same
//! [`vx86_cpu_core::CpuState`] the interpreter uses, so both engines can be checked against each
//! other instruction for instruction.

pub mod buffer;
pub mod config;
pub mod exec;
pub mod helpers;
pub mod ir;
pub mod opt;
pub mod translate;

pub use buffer::{CodeBuffer, TranslatedBlock};
pub use config::EmitterConfig;
pub use exec::{execute_block, ExecError};
pub use helpers::Helper;
pub use ir::{ExitKind, HostArg, HostInst, HostReg};
pub use translate::{translate_block, LazyKnowledge, TranslateError};
