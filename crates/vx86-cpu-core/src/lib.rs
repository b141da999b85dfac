#![forbid(unsafe_code)]

//! Emulation core for a 32-bit x86 guest running protected-mode and virtual-8086-mode code.
//!
//! The crate is centered around [`state::CpuState`], the one state layout shared by:
//! - the reference interpreter ([`interp`]), which executes decoded operations directly
//! - the code emitter (`vx86-jit`), which reaches the same state only through [`field`]
//!
//! Everything owned by the guest process (descriptor table, memory, signal handlers, symbols)
//! stays outside the core and is passed in per step as a [`thread::GuestThread`].

mod cpuid;
mod segmentation;
mod stack;
mod transfer;

pub mod config;
pub mod descriptors;
pub mod exceptions;
pub mod field;
pub mod flags;
pub mod fpu;
pub mod interp;
pub mod mem;
pub mod op;
pub mod state;
pub mod thread;

pub use config::EngineConfig;
pub use descriptors::{Descriptor, DescriptorLookup, LocalDescriptorTable, Selector};
pub use exceptions::{StackTrace, Completion, CpuExit, Fault, Signal, SignalDisposition, SignalInfo};
pub use field::{CpuField, FieldError, PinnedReg};
pub use flags::{AluOp, LazyFlags, ShiftOp};
pub use interp::StepOutcome;
pub use mem::{FlatMemory, GuestMemory};
pub use op::{Condition, DecodedOp, EffectiveAddress, FlagOp, Op};
pub use state::{CpuState, Gpr, Reg8, SegReg, Segment, Width};
pub use thread::{GuestThread, ProcessFlags, StandaloneThread};
