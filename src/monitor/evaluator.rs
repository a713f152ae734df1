//! Verdicts: per-tick evaluation of an aggregate against its limit set.

use serde::Serialize;

use super::aggregate::MetricAggregate;
use crate::config::LimitSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Timeout,
    MemoryExceeded,
    CpuExceeded,
    Stalled,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ViolationKind::Timeout => "timeout",
            ViolationKind::MemoryExceeded => "memory exceeded",
            ViolationKind::CpuExceeded => "cpu exceeded",
            ViolationKind::Stalled => "stalled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Verdict {
    Ok,
    Violation {
        kind: ViolationKind,
        limit: f64,
        observed: f64,
    },
}

impl Verdict {
    pub fn is_violation(&self) -> bool {
        matches!(self, Verdict::Violation { .. })
    }
}

/// Compares sampled aggregates against the resolved limit set for the current
/// unit. Checked every sampling tick so a runaway unit is aborted early, not
/// after natural completion. Unset limit fields are never violated.
pub struct LimitEvaluator {
    limits: LimitSet,
}

impl LimitEvaluator {
    pub fn new(limits: LimitSet) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &LimitSet {
        &self.limits
    }

    /// `stalled` is the stall detector's confirmed verdict for this tick.
    pub fn evaluate(&self, aggregate: &MetricAggregate, stalled: bool) -> Verdict {
        let duration = aggregate.duration_s();
        if let Some(timeout_s) = self.limits.timeout_s {
            if duration > timeout_s {
                return Verdict::Violation {
                    kind: ViolationKind::Timeout,
                    limit: timeout_s,
                    observed: duration,
                };
            }
        }
        if let Some(memory_mb) = self.limits.memory_mb {
            if aggregate.max_memory_total_mb > memory_mb {
                return Verdict::Violation {
                    kind: ViolationKind::MemoryExceeded,
                    limit: memory_mb,
                    observed: aggregate.max_memory_total_mb,
                };
            }
        }
        if let Some(cpu_percent) = self.limits.cpu_percent {
            if aggregate.max_cpu_total > cpu_percent {
                return Verdict::Violation {
                    kind: ViolationKind::CpuExceeded,
                    limit: cpu_percent,
                    observed: aggregate.max_cpu_total,
                };
            }
        }
        if stalled {
            if let Some(stall_timeout_s) = self.limits.stall_timeout_s {
                return Verdict::Violation {
                    kind: ViolationKind::Stalled,
                    limit: stall_timeout_s,
                    observed: duration,
                };
            }
        }
        Verdict::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::roles::ProcessRole;
    use crate::monitor::sampler::{ProcessRecord, Snapshot};

    fn tick(aggregate: &mut MetricAggregate, cpu: f64, memory_mb: f64) {
        aggregate.observe(&Snapshot {
            records: vec![ProcessRecord {
                pid: 1,
                parent: None,
                role: ProcessRole::Main,
                cpu_percent: cpu,
                memory_mb,
            }],
        });
    }

    #[test]
    fn unset_limits_never_violate() {
        let evaluator = LimitEvaluator::new(LimitSet::unlimited());
        let mut aggregate = MetricAggregate::new("unit");
        tick(&mut aggregate, 5000.0, 1_000_000.0);
        assert_eq!(evaluator.evaluate(&aggregate, false), Verdict::Ok);
    }

    #[test]
    fn cpu_violation_fires_on_the_tick_it_is_first_exceeded() {
        let evaluator = LimitEvaluator::new(LimitSet {
            cpu_percent: Some(50.0),
            ..LimitSet::unlimited()
        });
        let mut aggregate = MetricAggregate::new("unit");
        let mut violation_tick = None;
        for (index, cpu) in [10.0, 20.0, 80.0, 90.0].iter().enumerate() {
            tick(&mut aggregate, *cpu, 10.0);
            if evaluator.evaluate(&aggregate, false).is_violation() && violation_tick.is_none() {
                violation_tick = Some(index);
            }
        }
        // Third tick (index 2), where observed first exceeds the limit.
        assert_eq!(violation_tick, Some(2));
        match evaluator.evaluate(&aggregate, false) {
            Verdict::Violation {
                kind,
                limit,
                observed,
            } => {
                assert_eq!(kind, ViolationKind::CpuExceeded);
                assert_eq!(limit, 50.0);
                assert_eq!(observed, 90.0);
            }
            Verdict::Ok => panic!("expected a violation"),
        }
    }

    #[test]
    fn memory_violation_reports_limit_and_observed() {
        let evaluator = LimitEvaluator::new(LimitSet {
            memory_mb: Some(100.0),
            ..LimitSet::unlimited()
        });
        let mut aggregate = MetricAggregate::new("unit");
        tick(&mut aggregate, 0.0, 250.0);
        assert_eq!(
            evaluator.evaluate(&aggregate, false),
            Verdict::Violation {
                kind: ViolationKind::MemoryExceeded,
                limit: 100.0,
                observed: 250.0,
            }
        );
    }

    #[test]
    fn timeout_compares_duration_against_the_limit() {
        let evaluator = LimitEvaluator::new(LimitSet {
            timeout_s: Some(0.05),
            ..LimitSet::unlimited()
        });
        let mut aggregate = MetricAggregate::new("unit");
        tick(&mut aggregate, 0.0, 0.0);
        assert_eq!(evaluator.evaluate(&aggregate, false), Verdict::Ok);
        std::thread::sleep(std::time::Duration::from_millis(80));
        match evaluator.evaluate(&aggregate, false) {
            Verdict::Violation { kind, .. } => assert_eq!(kind, ViolationKind::Timeout),
            Verdict::Ok => panic!("expected a timeout violation"),
        }
    }

    #[test]
    fn stall_verdict_requires_a_configured_stall_timeout() {
        let aggregate = MetricAggregate::new("unit");
        let without = LimitEvaluator::new(LimitSet::unlimited());
        assert_eq!(without.evaluate(&aggregate, true), Verdict::Ok);

        let with = LimitEvaluator::new(LimitSet {
            stall_timeout_s: Some(1.0),
            ..LimitSet::unlimited()
        });
        match with.evaluate(&aggregate, true) {
            Verdict::Violation { kind, limit, .. } => {
                assert_eq!(kind, ViolationKind::Stalled);
                assert_eq!(limit, 1.0);
            }
            Verdict::Ok => panic!("expected a stall violation"),
        }
    }
}
