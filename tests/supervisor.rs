//! End-to-end tests for the per-unit supervision loop against real
//! processes.

use std::process::Command;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use vigil::config::LimitSet;
use vigil::enforcement::{ProcessControl, UnixProcessControl};
use vigil::monitor::{Supervisor, ViolationKind};
use vigil::shared::CurrentUnit;

fn control() -> Arc<dyn ProcessControl> {
    Arc::new(UnixProcessControl::new())
}

fn spawn_sleep() -> std::process::Child {
    Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("failed to spawn sleep")
}

#[test_log::test]
fn timeout_violation_is_emitted_mid_run_and_the_tree_is_stopped() {
    let mut child = spawn_sleep();
    let control = control();
    let current_unit = CurrentUnit::new();

    let supervisor = Supervisor::new(child.id(), Arc::clone(&control), current_unit.clone())
        .with_interval(Duration::from_millis(50));
    let limits = LimitSet {
        timeout_s: Some(0.3),
        ..LimitSet::unlimited()
    };
    let (events_tx, events_rx) = mpsc::channel();
    let started = Instant::now();
    let monitor = supervisor.start_unit("suite::test_timeout", limits, events_tx);

    let event = events_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("no verdict event before the deadline");
    assert_eq!(event.kind, ViolationKind::Timeout);
    assert_eq!(event.unit, "suite::test_timeout");
    assert_eq!(event.limit, 0.3);
    assert!(event.observed > 0.3);
    // Emitted mid-run, well before the 30s the child would naturally take.
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(monitor.violation_detected());
    let aggregate = monitor.finish();
    assert_eq!(aggregate.unit, "suite::test_timeout");
    assert!(aggregate.duration_s >= 0.3);
    assert_eq!(current_unit.get().as_deref(), Some("suite::test_timeout"));

    // The loop asked the tree to stop before exiting; sleep honors SIGTERM.
    let start = Instant::now();
    let mut alive = true;
    while alive && start.elapsed() < Duration::from_secs(2) {
        alive = child.try_wait().expect("try_wait failed").is_none();
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!alive, "monitored process survived the violation");
    child.wait().ok();
}

#[test_log::test]
fn stall_is_detected_for_an_idle_process() {
    let mut child = spawn_sleep();
    let supervisor = Supervisor::new(child.id(), control(), CurrentUnit::new())
        .with_interval(Duration::from_millis(50));
    // `sleep` consumes essentially no CPU, so any threshold this high stalls
    // once the window fills.
    let limits = LimitSet {
        stall_timeout_s: Some(0.4),
        stall_cpu_threshold_percent: 50.0,
        ..LimitSet::unlimited()
    };
    let (events_tx, events_rx) = mpsc::channel();
    let monitor = supervisor.start_unit("suite::test_stalled", limits, events_tx);

    let event = events_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("no stall verdict");
    assert_eq!(event.kind, ViolationKind::Stalled);
    assert_eq!(event.limit, 0.4);

    monitor.finish();
    child.kill().ok();
    child.wait().ok();
}

#[test_log::test]
fn a_unit_within_its_limits_produces_no_event() {
    let mut child = spawn_sleep();
    let supervisor = Supervisor::new(child.id(), control(), CurrentUnit::new())
        .with_interval(Duration::from_millis(50));
    let limits = LimitSet {
        timeout_s: Some(30.0),
        memory_mb: Some(100_000.0),
        cpu_percent: Some(100_000.0),
        ..LimitSet::unlimited()
    };
    let (events_tx, events_rx) = mpsc::channel();
    let monitor = supervisor.start_unit("suite::test_ok", limits, events_tx);

    std::thread::sleep(Duration::from_millis(400));
    assert!(!monitor.violation_detected());
    let aggregate = monitor.finish();
    assert!(aggregate.ticks > 0, "loop never sampled");
    assert!(
        events_rx.try_recv().is_err(),
        "unexpected verdict for a unit within its limits"
    );

    child.kill().ok();
    child.wait().ok();
}

#[test_log::test]
fn aggregates_survive_the_monitored_process_exiting() {
    let mut child = Command::new("sleep")
        .arg("0.2")
        .spawn()
        .expect("failed to spawn sleep");
    let supervisor = Supervisor::new(child.id(), control(), CurrentUnit::new())
        .with_interval(Duration::from_millis(50));
    let (events_tx, _events_rx) = mpsc::channel();
    let monitor = supervisor.start_unit("suite::test_quick", LimitSet::unlimited(), events_tx);

    child.wait().expect("child failed");
    // Sampling an exited root is a zero contribution, never a crash.
    std::thread::sleep(Duration::from_millis(200));
    assert!(!monitor.violation_detected());
    let aggregate = monitor.finish();
    assert_eq!(aggregate.unit, "suite::test_quick");
}
