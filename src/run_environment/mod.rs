//! Detection of the environment the run executes in.
//!
//! CI machines are slower and noisier than developer workstations, so time and
//! memory thresholds are scaled by a multiplier whenever a recognized CI
//! environment is detected. Precedence for the multiplier value is ENV < CLI.

use crate::prelude::*;

pub const CI_MULTIPLIER_ENV: &str = "VIGIL_CI_MULTIPLIER";

/// Multiplier applied in CI when none is configured explicitly.
pub const DEFAULT_CI_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnvironment {
    GithubActions,
    Buildkite,
    GenericCi,
    Local,
}

fn env_is_truthy(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => {
            let value = value.trim().to_ascii_lowercase();
            !value.is_empty() && value != "false" && value != "0"
        }
        Err(_) => false,
    }
}

impl RunEnvironment {
    /// Detects the current run environment from well-known CI variables.
    pub fn detect() -> Self {
        if env_is_truthy("GITHUB_ACTIONS") {
            RunEnvironment::GithubActions
        } else if env_is_truthy("BUILDKITE") {
            RunEnvironment::Buildkite
        } else if env_is_truthy("CI") {
            RunEnvironment::GenericCi
        } else {
            RunEnvironment::Local
        }
    }

    pub fn is_ci(&self) -> bool {
        !matches!(self, RunEnvironment::Local)
    }
}

/// Resolves the CI multiplier: a CLI value wins over `VIGIL_CI_MULTIPLIER`,
/// which wins over the detection default (2.0 in CI, 1.0 locally).
pub fn resolve_ci_multiplier(cli_override: Option<f64>) -> f64 {
    if let Some(multiplier) = cli_override {
        return multiplier;
    }
    if let Ok(raw) = std::env::var(CI_MULTIPLIER_ENV) {
        match raw.trim().parse::<f64>() {
            Ok(multiplier) if multiplier > 0.0 => return multiplier,
            _ => warn!("ignoring invalid {CI_MULTIPLIER_ENV} value: {raw:?}"),
        }
    }
    let environment = RunEnvironment::detect();
    if environment.is_ci() {
        info!("CI multiplier {DEFAULT_CI_MULTIPLIER} active ({environment:?})");
        DEFAULT_CI_MULTIPLIER
    } else {
        1.0
    }
}
