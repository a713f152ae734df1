//! Per-unit resource limits and their override resolution.
//!
//! Limits come from three sources with increasing precedence: environment
//! variables, command line flags, then a per-unit marker. The merged set is
//! scaled once by the CI multiplier and is immutable for the lifetime of the
//! unit.

use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// Default CPU threshold at or under which a sample counts as inactive, in
/// percent.
///
/// Deliberately a tuning parameter rather than part of the detection
/// algorithm; raised from 0.1 to 1.0 so that default configurations do not
/// flag legitimately light workloads.
pub const DEFAULT_STALL_CPU_THRESHOLD_PERCENT: f64 = 1.0;

/// Partial limit values contributed by one configuration source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitOverrides {
    pub timeout_s: Option<f64>,
    pub memory_mb: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub stall_timeout_s: Option<f64>,
    pub stall_cpu_threshold_percent: Option<f64>,
}

impl LimitOverrides {
    /// Field-wise merge, `self` winning over `base` wherever it is set.
    fn merged_over(self, base: Self) -> Self {
        Self {
            timeout_s: self.timeout_s.or(base.timeout_s),
            memory_mb: self.memory_mb.or(base.memory_mb),
            cpu_percent: self.cpu_percent.or(base.cpu_percent),
            stall_timeout_s: self.stall_timeout_s.or(base.stall_timeout_s),
            stall_cpu_threshold_percent: self
                .stall_cpu_threshold_percent
                .or(base.stall_cpu_threshold_percent),
        }
    }

    /// Reads the `VIGIL_*` limit variables from the process environment.
    ///
    /// A variable that is present but unparsable is an error: silently
    /// ignoring it would enforce different limits than the user asked for.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            timeout_s: parse_env_var("VIGIL_TIMEOUT")?,
            memory_mb: parse_env_var("VIGIL_MEMORY_MB")?,
            cpu_percent: parse_env_var("VIGIL_CPU_PERCENT")?,
            stall_timeout_s: parse_env_var("VIGIL_STALL_TIMEOUT")?,
            stall_cpu_threshold_percent: parse_env_var("VIGIL_STALL_CPU_THRESHOLD")?,
        })
    }
}

fn parse_env_var(name: &str) -> Result<Option<f64>> {
    match std::env::var(name) {
        Ok(raw) => {
            let value: f64 = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid value for {name}: {raw:?}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

/// The resolved limit set for one unit. Unset fields are unlimited and can
/// never be violated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitSet {
    pub timeout_s: Option<f64>,
    pub memory_mb: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub stall_timeout_s: Option<f64>,
    pub stall_cpu_threshold_percent: f64,
}

impl Default for LimitSet {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl LimitSet {
    pub fn unlimited() -> Self {
        Self {
            timeout_s: None,
            memory_mb: None,
            cpu_percent: None,
            stall_timeout_s: None,
            stall_cpu_threshold_percent: DEFAULT_STALL_CPU_THRESHOLD_PERCENT,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.timeout_s.is_none()
            && self.memory_mb.is_none()
            && self.cpu_percent.is_none()
            && self.stall_timeout_s.is_none()
    }

    /// Resolves the limit set for one unit.
    ///
    /// Precedence is ENV < CLI < per-unit marker; conflicting sources are not
    /// an error, the higher-precedence value simply wins. Time and memory
    /// thresholds are then scaled by the CI multiplier; CPU percentages are
    /// left untouched since scaling a utilization threshold has no meaning.
    pub fn resolve(
        env: LimitOverrides,
        cli: LimitOverrides,
        marker: LimitOverrides,
        ci_multiplier: f64,
    ) -> Self {
        let merged = marker.merged_over(cli.merged_over(env));
        let resolved = Self {
            timeout_s: merged.timeout_s.map(|t| t * ci_multiplier),
            memory_mb: merged.memory_mb.map(|m| m * ci_multiplier),
            cpu_percent: merged.cpu_percent,
            stall_timeout_s: merged.stall_timeout_s.map(|t| t * ci_multiplier),
            stall_cpu_threshold_percent: merged
                .stall_cpu_threshold_percent
                .unwrap_or(DEFAULT_STALL_CPU_THRESHOLD_PERCENT),
        };
        debug!("resolved limits (ci multiplier {ci_multiplier}): {resolved:?}");
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(timeout_s: Option<f64>) -> LimitOverrides {
        LimitOverrides {
            timeout_s,
            ..Default::default()
        }
    }

    #[test]
    fn marker_wins_over_cli_wins_over_env() {
        let resolved = LimitSet::resolve(
            overrides(Some(10.0)),
            overrides(Some(20.0)),
            overrides(Some(30.0)),
            1.0,
        );
        assert_eq!(resolved.timeout_s, Some(30.0));

        let resolved = LimitSet::resolve(
            overrides(Some(10.0)),
            overrides(Some(20.0)),
            LimitOverrides::default(),
            1.0,
        );
        assert_eq!(resolved.timeout_s, Some(20.0));

        let resolved = LimitSet::resolve(
            overrides(Some(10.0)),
            LimitOverrides::default(),
            LimitOverrides::default(),
            1.0,
        );
        assert_eq!(resolved.timeout_s, Some(10.0));
    }

    #[test]
    fn precedence_is_per_field_not_per_source() {
        let env = LimitOverrides {
            timeout_s: Some(5.0),
            memory_mb: Some(512.0),
            ..Default::default()
        };
        let marker = LimitOverrides {
            timeout_s: Some(2.0),
            ..Default::default()
        };
        let resolved = LimitSet::resolve(env, LimitOverrides::default(), marker, 1.0);
        assert_eq!(resolved.timeout_s, Some(2.0));
        assert_eq!(resolved.memory_mb, Some(512.0));
    }

    #[test]
    fn ci_multiplier_scales_time_and_memory_but_not_cpu() {
        let cli = LimitOverrides {
            timeout_s: Some(3.0),
            memory_mb: Some(100.0),
            cpu_percent: Some(80.0),
            stall_timeout_s: Some(1.0),
            stall_cpu_threshold_percent: Some(5.0),
        };
        let resolved = LimitSet::resolve(
            LimitOverrides::default(),
            cli,
            LimitOverrides::default(),
            2.0,
        );
        assert_eq!(resolved.timeout_s, Some(6.0));
        assert_eq!(resolved.memory_mb, Some(200.0));
        assert_eq!(resolved.cpu_percent, Some(80.0));
        assert_eq!(resolved.stall_timeout_s, Some(2.0));
        assert_eq!(resolved.stall_cpu_threshold_percent, 5.0);
    }

    #[test]
    fn unset_fields_stay_unlimited() {
        let resolved = LimitSet::resolve(
            LimitOverrides::default(),
            LimitOverrides::default(),
            LimitOverrides::default(),
            2.0,
        );
        assert!(resolved.is_unlimited());
        assert_eq!(
            resolved.stall_cpu_threshold_percent,
            DEFAULT_STALL_CPU_THRESHOLD_PERCENT
        );
    }

    #[test]
    fn from_env_reads_and_validates_variables() {
        temp_env::with_vars(
            [
                ("VIGIL_TIMEOUT", Some("2.5")),
                ("VIGIL_MEMORY_MB", None),
                ("VIGIL_CPU_PERCENT", Some("150")),
            ],
            || {
                let env = LimitOverrides::from_env().unwrap();
                assert_eq!(env.timeout_s, Some(2.5));
                assert_eq!(env.memory_mb, None);
                assert_eq!(env.cpu_percent, Some(150.0));
            },
        );

        temp_env::with_var("VIGIL_TIMEOUT", Some("not-a-number"), || {
            assert!(LimitOverrides::from_env().is_err());
        });
    }
}
