//! Process tree sampling.
//!
//! Each call to [`ProcessTreeSampler::sample`] enumerates the root process and
//! every live descendant and reads interval-based CPU usage plus resident
//! memory for each. A descendant that exits between enumeration and read is a
//! zero contribution, never an error.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System, UpdateKind};

use super::roles::{self, ProcessRole};
use crate::prelude::*;

/// Metrics for one process at one sampling tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub parent: Option<u32>,
    pub role: ProcessRole,
    /// Usage over the interval since the previous sample of this pid; exceeds
    /// 100 on multi-core.
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// All records for one sampling tick, ordered by pid. Not persisted across
/// ticks: pids may be reused by the OS, only aggregates carry over.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub records: Vec<ProcessRecord>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_cpu(&self) -> f64 {
        self.records.iter().map(|record| record.cpu_percent).sum()
    }

    pub fn total_memory_mb(&self) -> f64 {
        self.records.iter().map(|record| record.memory_mb).sum()
    }

    /// Summed CPU percent per role for this tick.
    pub fn cpu_by_role(&self) -> BTreeMap<ProcessRole, f64> {
        let mut by_role = BTreeMap::new();
        for record in &self.records {
            *by_role.entry(record.role).or_insert(0.0) += record.cpu_percent;
        }
        by_role
    }
}

/// Read-only sampler over the process table. Owns its [`System`] so that
/// sysinfo can compute per-pid CPU deltas between consecutive refreshes.
pub struct ProcessTreeSampler {
    system: System,
    root_pid: u32,
}

fn process_refresh_kind() -> ProcessRefreshKind {
    ProcessRefreshKind::nothing()
        .with_cpu()
        .with_memory()
        .with_cmd(UpdateKind::Always)
}

impl ProcessTreeSampler {
    pub fn new(root_pid: u32) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_processes(process_refresh_kind()),
        );
        Self { system, root_pid }
    }

    pub fn root_pid(&self) -> u32 {
        self.root_pid
    }

    /// Samples the tree rooted at `root_pid`. An empty snapshot means the
    /// root is gone; the caller decides whether that ends the unit.
    pub fn sample(&mut self) -> Snapshot {
        let refreshed = self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            process_refresh_kind(),
        );
        trace!("refreshed {refreshed} processes");

        let processes = self.system.processes();
        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in processes {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let root = Pid::from_u32(self.root_pid);
        let mut records = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(pid) = queue.pop_front() {
            // Stale pid between enumeration and read: zero contribution.
            let Some(process) = processes.get(&pid) else {
                continue;
            };
            let name = process.name().to_string_lossy().to_string();
            let cmdline = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            records.push(ProcessRecord {
                pid: pid.as_u32(),
                parent: process.parent().map(|parent| parent.as_u32()),
                role: roles::classify(pid.as_u32(), self.root_pid, &name, &cmdline),
                cpu_percent: f64::from(process.cpu_usage()),
                memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
            });
            if let Some(child_pids) = children.get(&pid) {
                queue.extend(child_pids.iter().copied());
            }
        }
        records.sort_by_key(|record| record.pid);
        Snapshot { records }
    }
}
