#![forbid(unsafe_code)]

//! Scenario runner for the vx86 engines.
//!
//! A scenario is a JSON document describing an initial thread (registers, descriptor table,
//! memory, signal dispositions, modules) and the decoded code regions it executes. [`driver`]
//! runs it through either the interpreter or the translator and [`report`] summarizes the result.

pub mod driver;
pub mod report;
pub mod scenario;

pub use driver::{run, Engine, RunSummary, Stop};
pub use report::Report;
pub use scenario::Scenario;
