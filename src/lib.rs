//! Resource supervisor for monitored process trees.
//!
//! `vigil` samples a root process and all of its live descendants, aggregates
//! per-role CPU and memory usage, detects stalls, enforces per-unit resource
//! limits and escalates termination of a whole run that exceeds its session
//! deadline.

pub(crate) mod prelude;

pub mod cli;
pub mod config;
pub mod enforcement;
pub mod logger;
pub mod monitor;
pub mod retry;
pub mod run_environment;
pub mod shared;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
