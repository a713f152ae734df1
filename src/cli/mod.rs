//! `vigil` binary: run a command under resource supervision.

use std::process::{Child, Command, ExitStatus};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use clap::Parser;
use console::style;
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::config::{LimitOverrides, LimitSet};
use crate::enforcement::{
    ProcessControl, SESSION_TIMEOUT_EXIT_CODE, SessionState, SessionTimeoutConfig,
    SessionTimeoutController, SessionTimeoutHandle, SessionTimeoutReport, UnixProcessControl,
};
use crate::monitor::{MetricAggregate, Supervisor, VerdictEvent};
use crate::prelude::*;
use crate::retry::{RetryDecision, RetryPolicy, UnitOutcome};
use crate::run_environment::resolve_ci_multiplier;
use crate::shared::CurrentUnit;

const CHILD_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Parser, Debug)]
#[command(
    name = "vigil",
    version,
    about = "Run a command under resource supervision"
)]
pub struct Cli {
    /// Timeout in seconds for the supervised unit
    #[arg(long, env = "VIGIL_TIMEOUT")]
    timeout: Option<f64>,

    /// Memory limit in MB for the whole supervised process tree
    #[arg(long, env = "VIGIL_MEMORY_MB")]
    memory_mb: Option<f64>,

    /// CPU limit in percent, summed across the tree (may exceed 100)
    #[arg(long, env = "VIGIL_CPU_PERCENT")]
    cpu_percent: Option<f64>,

    /// Flag the unit as stalled after this many seconds of sustained low CPU
    #[arg(long, env = "VIGIL_STALL_TIMEOUT")]
    stall_timeout: Option<f64>,

    /// CPU percent at or under which a sample counts as inactive
    #[arg(long, env = "VIGIL_STALL_CPU_THRESHOLD")]
    stall_cpu_threshold: Option<f64>,

    /// Deadline in seconds for the whole run, across all retries
    #[arg(long, env = "VIGIL_SESSION_TIMEOUT")]
    session_timeout: Option<f64>,

    /// Seconds between graceful termination and SIGKILL escalation
    #[arg(long, env = "VIGIL_SESSION_GRACE_PERIOD")]
    grace_period: Option<f64>,

    /// Scaling factor for time/memory thresholds (auto-detected in CI)
    #[arg(long, env = "VIGIL_CI_MULTIPLIER")]
    ci_multiplier: Option<f64>,

    /// Number of immediate re-runs after a failure or violation
    #[arg(long, env = "VIGIL_RETRY", default_value_t = 0)]
    retry: u32,

    /// Sampling interval in seconds
    #[arg(long, default_value_t = 0.1)]
    interval: f64,

    /// Emit the run report as JSON on stdout instead of a summary table
    #[arg(long)]
    json: bool,

    /// Command to run under supervision
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AttemptReport {
    attempt: u32,
    outcome: UnitOutcome,
    aggregate: MetricAggregate,
    verdict: Option<VerdictEvent>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    command: String,
    attempts: Vec<AttemptReport>,
    session_timeout: Option<SessionTimeoutReport>,
}

pub fn run() -> Result<i32> {
    let args = Cli::parse();
    let command_line = args.command.join(" ");

    let ci_multiplier = resolve_ci_multiplier(args.ci_multiplier);
    // Env values already flow in through clap's `env` attributes, so the CLI
    // layer contributes a single override source; a per-unit marker would
    // come from an embedding test runner, not from this binary.
    let cli_overrides = LimitOverrides {
        timeout_s: args.timeout,
        memory_mb: args.memory_mb,
        cpu_percent: args.cpu_percent,
        stall_timeout_s: args.stall_timeout,
        stall_cpu_threshold_percent: args.stall_cpu_threshold,
    };
    let limits = LimitSet::resolve(
        LimitOverrides::default(),
        cli_overrides,
        LimitOverrides::default(),
        ci_multiplier,
    );
    let session_config =
        SessionTimeoutConfig::resolve(args.session_timeout, args.grace_period, ci_multiplier)?;
    let unit_grace = Duration::from_secs_f64(args.grace_period.unwrap_or(5.0));

    let control: Arc<dyn ProcessControl> = Arc::new(UnixProcessControl::new());
    let current_unit = CurrentUnit::new();
    let policy = RetryPolicy::new(args.retry);

    let mut session: Option<SessionTimeoutHandle> = None;
    let mut attempts = Vec::new();
    let mut attempt = 1;

    let final_outcome = loop {
        let mut child = spawn_supervised(&args.command)?;
        let child_pid = child.id();

        if session.is_none() {
            if let Some(config) = session_config {
                session = Some(
                    SessionTimeoutController::new(
                        config,
                        Arc::clone(&control),
                        current_unit.clone(),
                        child_pid,
                    )
                    .start(),
                );
            }
        } else if let Some(handle) = &session {
            handle.add_worker_root(child_pid);
        }

        let unit = if attempt == 1 {
            command_line.clone()
        } else {
            format!("{command_line} (attempt {attempt})")
        };
        info!("supervising {unit} (pid {child_pid})");

        let supervisor = Supervisor::new(child_pid, Arc::clone(&control), current_unit.clone())
            .with_interval(Duration::from_secs_f64(args.interval));
        let (events_tx, events_rx) = mpsc::channel();
        let monitor = supervisor.start_unit(&unit, limits, events_tx);

        let status = wait_for_child(&mut child, &monitor, control.as_ref(), unit_grace)?;
        let aggregate = monitor.finish();
        let verdict = events_rx.try_iter().next();

        let outcome = match &verdict {
            Some(event) => UnitOutcome::Violated(event.kind),
            None if status.success() => UnitOutcome::Passed,
            None => UnitOutcome::Failed,
        };
        report_attempt_outcome(&unit, &outcome, &verdict);
        attempts.push(AttemptReport {
            attempt,
            outcome,
            aggregate,
            verdict,
        });

        // Gate on state, not on the report: the report only lands once
        // enforcement finishes, and spawning a fresh attempt while the
        // controller is mid-grace would outlive the deadline.
        let session_timed_out = session
            .as_ref()
            .is_some_and(|handle| handle.state() != SessionState::Running);
        if session_timed_out {
            break outcome;
        }
        match policy.decide(attempt, &outcome) {
            RetryDecision::Retry => {
                info!("retrying {command_line} (attempt {})", attempt + 1);
                attempt += 1;
            }
            RetryDecision::GiveUp => break outcome,
        }
    };

    let session_report = session.and_then(|handle| handle.stop());
    let report = RunReport {
        command: command_line.clone(),
        attempts,
        session_timeout: session_report.clone(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        render_summary(&report);
    }

    if let Some(session_report) = &session_report {
        eprintln!(
            "{}",
            style(format!(
                "session timed out after {:.1}s while running: {}",
                session_report.deadline_s,
                session_report.unit.as_deref().unwrap_or("<no unit>")
            ))
            .red()
            .bold()
        );
        return Ok(SESSION_TIMEOUT_EXIT_CODE);
    }

    Ok(match final_outcome {
        UnitOutcome::Passed => 0,
        UnitOutcome::Failed | UnitOutcome::Violated(_) => 1,
    })
}

fn spawn_supervised(command: &[String]) -> Result<Child> {
    let (program, arguments) = command
        .split_first()
        .context("no command to supervise")?;
    Command::new(program)
        .args(arguments)
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))
}

/// Waits for the supervised child, escalating after a violation: the
/// monitoring loop already asked the tree to stop gracefully; if the child is
/// still alive `unit_grace` later it is killed forcefully.
fn wait_for_child(
    child: &mut Child,
    monitor: &crate::monitor::UnitMonitor,
    control: &dyn ProcessControl,
    unit_grace: Duration,
) -> Result<ExitStatus> {
    let mut violation_seen_at: Option<Instant> = None;
    let mut escalated = false;
    loop {
        if let Some(status) = poll_status(child) {
            return Ok(status);
        }
        if monitor.violation_detected() && !escalated {
            let seen_at = *violation_seen_at.get_or_insert_with(Instant::now);
            if seen_at.elapsed() >= unit_grace {
                warn!("child ignored graceful termination; escalating to SIGKILL");
                for pid in control.enumerate_descendants(child.id()) {
                    let _ = control.send_forceful(pid);
                }
                escalated = true;
            }
        }
        std::thread::sleep(CHILD_WAIT_POLL_INTERVAL);
    }
}

/// `try_wait` errors when someone else (the session controller) already
/// reaped the child; report that as killed rather than failing the run.
fn poll_status(child: &mut Child) -> Option<ExitStatus> {
    match child.try_wait() {
        Ok(status) => status,
        Err(err) => {
            debug!("child status poll failed (already reaped?): {err}");
            Some(std::os::unix::process::ExitStatusExt::from_raw(9))
        }
    }
}

fn report_attempt_outcome(unit: &str, outcome: &UnitOutcome, verdict: &Option<VerdictEvent>) {
    match (outcome, verdict) {
        (UnitOutcome::Violated(kind), Some(event)) => error!(
            "{unit}: {kind} violation (observed {:.1}, limit {:.1})",
            event.observed, event.limit
        ),
        (UnitOutcome::Failed, _) => warn!("{unit}: failed"),
        _ => info!("{unit}: passed"),
    }
}

#[derive(Tabled)]
struct AttemptRow {
    #[tabled(rename = "attempt")]
    attempt: u32,
    #[tabled(rename = "outcome")]
    outcome: String,
    #[tabled(rename = "duration (s)")]
    duration: String,
    #[tabled(rename = "peak cpu (%)")]
    cpu: String,
    #[tabled(rename = "peak memory (MB)")]
    memory: String,
    #[tabled(rename = "peak cpu by role")]
    roles: String,
}

fn render_summary(report: &RunReport) {
    let rows: Vec<AttemptRow> = report
        .attempts
        .iter()
        .map(|attempt| AttemptRow {
            attempt: attempt.attempt,
            outcome: match attempt.outcome {
                UnitOutcome::Passed => "passed".into(),
                UnitOutcome::Failed => "failed".into(),
                UnitOutcome::Violated(kind) => format!("violation: {kind}"),
            },
            duration: format!("{:.2}", attempt.aggregate.duration_s),
            cpu: format!("{:.1}", attempt.aggregate.max_cpu_total),
            memory: format!("{:.1}", attempt.aggregate.max_memory_total_mb),
            roles: attempt
                .aggregate
                .peak_cpu_by_role
                .iter()
                .map(|(role, cpu)| format!("{role}: {cpu:.1}"))
                .collect::<Vec<_>>()
                .join(", "),
        })
        .collect();

    println!("\n{}", style(&report.command).bold());
    println!("{}", Table::new(rows).with(Style::sharp()));
}
