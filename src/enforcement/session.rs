//! Run-wide deadline enforcement.
//!
//! One controller runs for the whole session regardless of how many units
//! execute. On deadline expiry it drives a graceful-to-forceful termination
//! state machine across every tracked process tree, including worker roots
//! spawned by parallel-execution infrastructure, and reaps what it kills so
//! no zombie or leaked OS synchronization object survives the run.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::process_control::ProcessControl;
use crate::prelude::*;
use crate::shared::{Cancel, CurrentUnit};

/// POSIX convention for "command timed out", so downstream tooling can tell a
/// timeout abort from a normal failure.
pub const SESSION_TIMEOUT_EXIT_CODE: i32 = 124;

const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    GracePeriod,
    ForceKilled,
    Completed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTimeoutConfig {
    /// Deadline for the whole run, already scaled by the CI multiplier.
    pub timeout: Duration,
    /// Interval between the graceful request and forceful escalation.
    pub grace_period: Duration,
    /// Bound on how long to wait for processes to disappear after SIGKILL.
    /// The controller never hangs: past this it logs a termination failure
    /// and reports completion regardless.
    pub kill_wait: Duration,
}

pub const SESSION_TIMEOUT_ENV: &str = "VIGIL_SESSION_TIMEOUT";
pub const SESSION_GRACE_PERIOD_ENV: &str = "VIGIL_SESSION_GRACE_PERIOD";

const DEFAULT_GRACE_PERIOD_S: f64 = 5.0;
const DEFAULT_KILL_WAIT: Duration = Duration::from_secs(5);

impl SessionTimeoutConfig {
    /// Resolves the session deadline with ENV < CLI precedence (there is no
    /// per-unit marker for the session-level value) and scales it by the CI
    /// multiplier. Returns `None` when no timeout is configured anywhere.
    pub fn resolve(
        cli_timeout_s: Option<f64>,
        cli_grace_period_s: Option<f64>,
        ci_multiplier: f64,
    ) -> Result<Option<Self>> {
        let timeout_s = match cli_timeout_s.or(parse_seconds_env(SESSION_TIMEOUT_ENV)?) {
            Some(timeout_s) => timeout_s,
            None => return Ok(None),
        };
        let grace_period_s = cli_grace_period_s
            .or(parse_seconds_env(SESSION_GRACE_PERIOD_ENV)?)
            .unwrap_or(DEFAULT_GRACE_PERIOD_S);
        Ok(Some(Self {
            timeout: Duration::from_secs_f64(timeout_s * ci_multiplier),
            grace_period: Duration::from_secs_f64(grace_period_s),
            kill_wait: DEFAULT_KILL_WAIT,
        }))
    }
}

fn parse_seconds_env(name: &str) -> Result<Option<f64>> {
    match std::env::var(name) {
        Ok(raw) => {
            let seconds: f64 = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid value for {name}: {raw:?}"))?;
            Ok(Some(seconds))
        }
        Err(_) => Ok(None),
    }
}

/// Diagnostic report emitted once the deadline fired.
#[derive(Debug, Clone, Serialize)]
pub struct SessionTimeoutReport {
    pub deadline_s: f64,
    pub grace_period_s: f64,
    /// True when the grace period expired and SIGKILL was needed.
    pub forced: bool,
    /// Unit executing at the moment of timeout.
    pub unit: Option<String>,
    pub exit_code: i32,
}

struct Shared {
    config: SessionTimeoutConfig,
    control: Arc<dyn ProcessControl>,
    current_unit: CurrentUnit,
    roots: Mutex<Vec<u32>>,
    state: Mutex<SessionState>,
    report: Mutex<Option<SessionTimeoutReport>>,
    cancel: Cancel,
}

impl Shared {
    /// Forward-only transition; a late writer can never move the machine
    /// backwards.
    fn advance(&self, next: SessionState) {
        if let Ok(mut state) = self.state.lock() {
            if next > *state {
                *state = next;
            }
        }
    }

    /// Union of every tracked root's tree, root first, deduplicated.
    fn tracked_pids(&self) -> Vec<u32> {
        let roots = self
            .roots
            .lock()
            .map(|roots| roots.clone())
            .unwrap_or_default();
        let mut seen = HashSet::new();
        let mut pids = Vec::new();
        for root in roots {
            for pid in self.control.enumerate_descendants(root) {
                if seen.insert(pid) {
                    pids.push(pid);
                }
            }
        }
        pids
    }

    fn reap_and_filter_alive(&self, pids: &[u32]) -> Vec<u32> {
        pids.iter()
            .copied()
            .filter(|&pid| {
                self.control.reap(pid);
                self.control.is_alive(pid)
            })
            .collect()
    }
}

/// Owns the run-wide deadline. Construct once per run, [`start`] it, and
/// [`stop`] the returned handle when the run ends naturally.
///
/// [`start`]: SessionTimeoutController::start
/// [`stop`]: SessionTimeoutHandle::stop
pub struct SessionTimeoutController {
    config: SessionTimeoutConfig,
    control: Arc<dyn ProcessControl>,
    current_unit: CurrentUnit,
    roots: Vec<u32>,
}

impl SessionTimeoutController {
    pub fn new(
        config: SessionTimeoutConfig,
        control: Arc<dyn ProcessControl>,
        current_unit: CurrentUnit,
        root_pid: u32,
    ) -> Self {
        Self {
            config,
            control,
            current_unit,
            roots: vec![root_pid],
        }
    }

    pub fn start(self) -> SessionTimeoutHandle {
        let shared = Arc::new(Shared {
            config: self.config,
            control: self.control,
            current_unit: self.current_unit,
            roots: Mutex::new(self.roots),
            state: Mutex::new(SessionState::Running),
            report: Mutex::new(None),
            cancel: Cancel::new(),
        });
        info!(
            "session timeout armed: deadline {:?}, grace period {:?}",
            shared.config.timeout, shared.config.grace_period
        );
        let thread = std::thread::Builder::new()
            .name("vigil-session-timeout".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || run(&shared)
            })
            .ok();
        SessionTimeoutHandle {
            shared,
            thread,
        }
    }
}

pub struct SessionTimeoutHandle {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl SessionTimeoutHandle {
    /// Registers the root of a worker subprocess tree so a later escalation
    /// covers it too.
    ///
    /// Registration can race with enforcement: a root arriving after the
    /// deadline fired is terminated on the spot instead of relying on the
    /// enforcement loop still being around to see it.
    pub fn add_worker_root(&self, pid: u32) {
        if let Ok(mut roots) = self.shared.roots.lock() {
            debug!("tracking worker root pid {pid}");
            roots.push(pid);
        }
        let state = self.state();
        if state == SessionState::Running {
            return;
        }
        warn!("worker root pid {pid} registered after the deadline fired ({state:?})");
        for target in self.shared.control.enumerate_descendants(pid) {
            let result = if state == SessionState::GracePeriod {
                self.shared.control.send_graceful(target)
            } else {
                self.shared.control.send_forceful(target)
            };
            if let Err(err) = result {
                warn!("late termination of pid {target} failed: {err}");
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared
            .state
            .lock()
            .map(|state| *state)
            .unwrap_or(SessionState::Completed)
    }

    pub fn timeout_report(&self) -> Option<SessionTimeoutReport> {
        self.shared
            .report
            .lock()
            .ok()
            .and_then(|report| report.clone())
    }

    /// Exit code the run should terminate with, set only after a timeout.
    pub fn exit_code(&self) -> Option<i32> {
        self.timeout_report().map(|report| report.exit_code)
    }

    /// Ends the controller because the run completed before the deadline.
    /// Joins the controller thread; if enforcement is already underway it is
    /// allowed to finish (its waits are all bounded).
    pub fn stop(mut self) -> Option<SessionTimeoutReport> {
        self.shutdown();
        self.timeout_report()
    }

    fn shutdown(&mut self) {
        self.shared.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("session timeout thread panicked");
            }
        }
    }
}

impl Drop for SessionTimeoutHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared) {
    let started = Instant::now();
    loop {
        let elapsed = started.elapsed();
        if elapsed >= shared.config.timeout {
            enforce(shared);
            return;
        }
        let remaining = shared.config.timeout - elapsed;
        if shared
            .cancel
            .wait_timeout(remaining.min(Duration::from_secs(1)))
        {
            shared.advance(SessionState::Completed);
            return;
        }
    }
}

/// One grace-period poll: re-enumerates the tracked trees, asks every pid not
/// yet signalled to stop, and returns the pids still alive after reaping.
fn request_graceful(shared: &Shared, signalled: &mut HashSet<u32>) -> Vec<u32> {
    let tracked = shared.tracked_pids();
    for &pid in &tracked {
        if signalled.insert(pid) {
            if let Err(err) = shared.control.send_graceful(pid) {
                warn!("graceful termination of pid {pid} failed: {err}");
            }
        }
    }
    shared.reap_and_filter_alive(&tracked)
}

fn enforce(shared: &Shared) {
    shared.advance(SessionState::GracePeriod);
    let unit = shared.current_unit.get();
    error!(
        "session timeout exceeded ({:?}) while running {}; requesting graceful termination",
        shared.config.timeout,
        unit.as_deref().unwrap_or("<no unit>"),
    );

    // Signals are asynchronous: poll liveness for the grace period instead of
    // assuming they were honored. Every poll re-enumerates the tracked trees
    // so roots registered mid-grace are signalled too, and reaps exited
    // children so they do not linger as zombies that would read as alive.
    let mut signalled = HashSet::new();
    let grace_deadline = Instant::now() + shared.config.grace_period;
    let mut alive = request_graceful(shared, &mut signalled);
    while !alive.is_empty() && Instant::now() < grace_deadline {
        std::thread::sleep(LIVENESS_POLL_INTERVAL);
        alive = request_graceful(shared, &mut signalled);
    }

    let forced = !alive.is_empty();
    if forced {
        shared.advance(SessionState::ForceKilled);
        // Re-enumerate: workers may have spawned new processes during the
        // grace period.
        let targets = shared.tracked_pids();
        error!(
            "grace period expired with {} process(es) still alive; killing {} tracked pid(s)",
            alive.len(),
            targets.len()
        );
        for &pid in &targets {
            if let Err(err) = shared.control.send_forceful(pid) {
                warn!("forceful termination of pid {pid} failed: {err}");
            }
        }

        let kill_deadline = Instant::now() + shared.config.kill_wait;
        let mut survivors = shared.reap_and_filter_alive(&targets);
        while !survivors.is_empty() && Instant::now() < kill_deadline {
            std::thread::sleep(LIVENESS_POLL_INTERVAL);
            survivors = shared.reap_and_filter_alive(&targets);
        }
        for pid in survivors {
            // Bounded wait exhausted: fatal for the run, but the controller
            // still reports completion instead of hanging.
            error!("termination failure: pid {pid} survived SIGKILL");
        }
    }

    shared.advance(SessionState::Completed);
    if let Ok(mut report) = shared.report.lock() {
        *report = Some(SessionTimeoutReport {
            deadline_s: shared.config.timeout.as_secs_f64(),
            grace_period_s: shared.config.grace_period.as_secs_f64(),
            forced,
            unit,
            exit_code: SESSION_TIMEOUT_EXIT_CODE,
        });
    }
}
