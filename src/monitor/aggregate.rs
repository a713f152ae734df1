//! Running metric aggregates for one unit of work.

use std::collections::BTreeMap;
use std::time::{Instant, SystemTime};

use serde::Serialize;

use super::roles::ProcessRole;
use super::sampler::Snapshot;

/// Peak resource usage observed over one unit's lifetime.
///
/// Owned exclusively by the supervising loop while the unit runs; frozen via
/// [`MetricAggregate::finalize`] when the unit ends and handed to the
/// reporting collaborator. All `max_*` values are monotonically
/// non-decreasing across ticks.
#[derive(Debug, Clone, Serialize)]
pub struct MetricAggregate {
    pub unit: String,
    /// Peak of the summed CPU percent across every process in the tree.
    pub max_cpu_total: f64,
    /// Peak of the summed resident memory across the tree, in MB.
    pub max_memory_total_mb: f64,
    /// Peak per-role CPU percent (each role summed across its processes).
    pub peak_cpu_by_role: BTreeMap<ProcessRole, f64>,
    pub started_at: SystemTime,
    pub duration_s: f64,
    pub ticks: u64,
    #[serde(skip)]
    start: Instant,
}

impl MetricAggregate {
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            max_cpu_total: 0.0,
            max_memory_total_mb: 0.0,
            peak_cpu_by_role: BTreeMap::new(),
            started_at: SystemTime::now(),
            duration_s: 0.0,
            ticks: 0,
            start: Instant::now(),
        }
    }

    /// Folds one tick's snapshot into the running peaks.
    pub fn observe(&mut self, snapshot: &Snapshot) {
        self.max_cpu_total = self.max_cpu_total.max(snapshot.total_cpu());
        self.max_memory_total_mb = self.max_memory_total_mb.max(snapshot.total_memory_mb());
        for (role, cpu) in snapshot.cpu_by_role() {
            let peak = self.peak_cpu_by_role.entry(role).or_insert(0.0);
            *peak = peak.max(cpu);
        }
        self.duration_s = self.start.elapsed().as_secs_f64();
        self.ticks += 1;
    }

    pub fn duration_s(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Freezes the aggregate at the unit's end.
    pub fn finalize(mut self) -> Self {
        self.duration_s = self.start.elapsed().as_secs_f64();
        self
    }
}
