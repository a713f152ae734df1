//! Per-unit supervision loop.
//!
//! One supervisor instance monitors one root process (a worker running units
//! in parallel owns its own instance). For every unit it runs a
//! fixed-interval sampling loop on a dedicated thread that only reads OS
//! process tables and never waits on the monitored process's own
//! synchronization.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;

use super::aggregate::MetricAggregate;
use super::evaluator::{LimitEvaluator, Verdict, ViolationKind};
use super::sampler::ProcessTreeSampler;
use super::stall::StallDetector;
use crate::config::LimitSet;
use crate::enforcement::{ProcessControl, capture_thread_dump};
use crate::prelude::*;
use crate::shared::{Cancel, CurrentUnit};

pub const DEFAULT_SAMPLING_INTERVAL: Duration = Duration::from_millis(100);

/// sysinfo cannot compute meaningful per-interval CPU usage for refreshes
/// spaced closer than its minimum, and near-zero readings would feed the
/// stall detector false idle samples.
fn clamp_interval(interval: Duration) -> Duration {
    interval.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL)
}

/// Violation notification handed to collaborators (retry policy, reporters).
#[derive(Debug, Clone, Serialize)]
pub struct VerdictEvent {
    pub unit: String,
    pub kind: ViolationKind,
    pub observed: f64,
    pub limit: f64,
    pub timestamp: SystemTime,
    /// Thread dump of the monitored process captured at violation time.
    pub thread_dump: Option<String>,
}

pub struct Supervisor {
    root_pid: u32,
    control: Arc<dyn ProcessControl>,
    current_unit: CurrentUnit,
    interval: Duration,
}

impl Supervisor {
    pub fn new(
        root_pid: u32,
        control: Arc<dyn ProcessControl>,
        current_unit: CurrentUnit,
    ) -> Self {
        Self {
            root_pid,
            control,
            current_unit,
            interval: clamp_interval(DEFAULT_SAMPLING_INTERVAL),
        }
    }

    /// Intervals below sysinfo's minimum CPU update interval are raised to it.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = clamp_interval(interval);
        self
    }

    pub fn root_pid(&self) -> u32 {
        self.root_pid
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts monitoring one unit. Resets all per-unit state, publishes the
    /// unit as currently executing and spawns the sampling loop. Violations
    /// are delivered on `events`; the caller collects the frozen aggregate
    /// with [`UnitMonitor::finish`].
    pub fn start_unit(
        &self,
        unit: &str,
        limits: LimitSet,
        events: Sender<VerdictEvent>,
    ) -> UnitMonitor {
        self.current_unit.set(unit);
        let cancel = Cancel::new();
        let violation = Arc::new(AtomicBool::new(false));

        let loop_state = UnitLoop {
            unit: unit.to_string(),
            root_pid: self.root_pid,
            control: Arc::clone(&self.control),
            interval: self.interval,
            limits,
            events,
            cancel: cancel.clone(),
            violation: Arc::clone(&violation),
        };
        let thread = std::thread::Builder::new()
            .name(format!("vigil-monitor-{unit}"))
            .spawn(move || loop_state.run())
            .map_err(|err| error!("could not spawn monitor thread for {unit}: {err}"))
            .ok();

        UnitMonitor {
            unit: unit.to_string(),
            thread,
            cancel,
            violation,
        }
    }
}

/// Handle to one unit's running sampling loop.
pub struct UnitMonitor {
    unit: String,
    thread: Option<JoinHandle<MetricAggregate>>,
    cancel: Cancel,
    violation: Arc<AtomicBool>,
}

impl UnitMonitor {
    /// True once the loop confirmed a violation and asked the tree to stop.
    pub fn violation_detected(&self) -> bool {
        self.violation.load(Ordering::SeqCst)
    }

    /// Ends monitoring for this unit (pass, fail or violation alike) and
    /// returns the frozen aggregate.
    pub fn finish(mut self) -> MetricAggregate {
        self.cancel.cancel();
        match self.thread.take().map(|thread| thread.join()) {
            Some(Ok(aggregate)) => aggregate,
            _ => {
                error!("monitor thread for {} was lost; aggregate is empty", self.unit);
                MetricAggregate::new(&self.unit).finalize()
            }
        }
    }
}

struct UnitLoop {
    unit: String,
    root_pid: u32,
    control: Arc<dyn ProcessControl>,
    interval: Duration,
    limits: LimitSet,
    events: Sender<VerdictEvent>,
    cancel: Cancel,
    violation: Arc<AtomicBool>,
}

impl UnitLoop {
    fn run(self) -> MetricAggregate {
        let mut sampler = ProcessTreeSampler::new(self.root_pid);
        let mut aggregate = MetricAggregate::new(&self.unit);
        let evaluator = LimitEvaluator::new(self.limits);
        let mut stall_detector = self.limits.stall_timeout_s.map(|stall_timeout_s| {
            StallDetector::new(
                Duration::from_secs_f64(stall_timeout_s),
                self.limits.stall_cpu_threshold_percent,
            )
        });

        // Prime the CPU counters; the first refresh of a pid has no interval
        // to compute usage over.
        sampler.sample();

        loop {
            if self.cancel.wait_timeout(self.interval) {
                break;
            }
            let snapshot = sampler.sample();
            aggregate.observe(&snapshot);
            let stalled = stall_detector
                .as_mut()
                .map(|detector| detector.observe(Instant::now(), snapshot.total_cpu()))
                .unwrap_or(false);

            match evaluator.evaluate(&aggregate, stalled) {
                Verdict::Ok => {}
                Verdict::Violation {
                    kind,
                    limit,
                    observed,
                } => {
                    self.on_violation(kind, limit, observed);
                    break;
                }
            }
        }
        aggregate.finalize()
    }

    /// Finalizes immediately on violation: capture a postmortem thread dump,
    /// guarantee the monitored tree is asked to stop before the loop exits,
    /// then emit the event.
    fn on_violation(&self, kind: ViolationKind, limit: f64, observed: f64) {
        self.violation.store(true, Ordering::SeqCst);
        warn!(
            "unit {} violated {kind}: observed {observed:.1}, limit {limit:.1}",
            self.unit
        );

        let thread_dump = capture_thread_dump(self.root_pid);
        if let Some(dump) = &thread_dump {
            debug!("thread dump for pid {}:\n{dump}", self.root_pid);
        }

        for pid in self.control.enumerate_descendants(self.root_pid) {
            if let Err(err) = self.control.send_graceful(pid) {
                warn!("could not stop pid {pid}: {err}");
            }
        }

        // The receiver may already be gone when the run is shutting down.
        let _ = self.events.send(VerdictEvent {
            unit: self.unit.clone(),
            kind,
            observed,
            limit,
            timestamp: SystemTime::now(),
            thread_dump,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::UnixProcessControl;

    #[test]
    fn sampling_interval_is_clamped_to_the_cpu_refresh_minimum() {
        let supervisor = Supervisor::new(
            std::process::id(),
            Arc::new(UnixProcessControl::new()),
            CurrentUnit::new(),
        )
        .with_interval(Duration::from_millis(10));
        assert_eq!(supervisor.interval(), sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);

        let slow = Supervisor::new(
            std::process::id(),
            Arc::new(UnixProcessControl::new()),
            CurrentUnit::new(),
        )
        .with_interval(Duration::from_secs(1));
        assert_eq!(slow.interval(), Duration::from_secs(1));
    }

    #[test]
    fn finish_without_a_monitor_thread_yields_an_empty_aggregate() {
        let monitor = UnitMonitor {
            unit: "unit".to_string(),
            thread: None,
            cancel: Cancel::new(),
            violation: Arc::new(AtomicBool::new(false)),
        };
        assert!(!monitor.violation_detected());
        let aggregate = monitor.finish();
        assert_eq!(aggregate.unit, "unit");
        assert_eq!(aggregate.ticks, 0);
    }
}
