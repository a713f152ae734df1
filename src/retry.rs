//! Retry policy for failed units.
//!
//! The supervisor only detects and signals; re-execution is this separate
//! policy's decision, made from the unit's outcome. Re-runs are immediate,
//! with no backoff.

use serde::Serialize;

use crate::monitor::ViolationKind;

/// Outcome of one unit attempt, as seen by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Passed,
    Failed,
    Violated(ViolationKind),
}

impl UnitOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, UnitOutcome::Passed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    GiveUp,
}

/// Immediate re-run policy: a failing or violating unit is re-executed up to
/// `max_retries` times beyond its first attempt; `max_retries == 0` disables
/// retries entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// Same override precedence as per-unit limits: ENV < CLI < marker.
    pub fn resolve(env: Option<u32>, cli: Option<u32>, marker: Option<u32>) -> Self {
        Self::new(marker.or(cli).or(env).unwrap_or(0))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decides after a finished attempt. `attempt` is 1-based: the first
    /// execution is attempt 1.
    pub fn decide(&self, attempt: u32, outcome: &UnitOutcome) -> RetryDecision {
        if outcome.is_passed() || attempt > self.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry
        }
    }
}
