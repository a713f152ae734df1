//! Sampling, aggregation and per-unit limit enforcement.

mod aggregate;
mod evaluator;
mod roles;
mod sampler;
mod stall;
mod supervisor;

pub use aggregate::MetricAggregate;
pub use evaluator::{LimitEvaluator, Verdict, ViolationKind};
pub use roles::ProcessRole;
pub use sampler::{ProcessRecord, ProcessTreeSampler, Snapshot};
pub use stall::StallDetector;
pub use supervisor::{Supervisor, UnitMonitor, VerdictEvent};
