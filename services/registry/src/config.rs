use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use nireg_reconcile::{PacePolicy, DEFAULT_MAX_PACE_LEVEL};

use crate::coordinator::ConflictPolicy;
use crate::reconciler::WorkerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub manifest_path: Option<PathBuf>,
    pub tick_interval: Duration,
    pub pace_policy: PacePolicy,
    pub max_pace_level: u32,
    pub conflict_policy: ConflictPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = var("NIREG_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let manifest_path = var("NIREG_MANIFEST")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let tick_interval = Duration::from_millis(parse_or(&var, "NIREG_TICK_INTERVAL_MS", 500)?);
        if tick_interval.is_zero() {
            anyhow::bail!("invalid NIREG_TICK_INTERVAL_MS: the tick interval must be non-zero");
        }

        let defaults = PacePolicy::default();
        let pace_policy = PacePolicy {
            very_short_wait: secs_or(&var, "NIREG_VERY_SHORT_WAIT_SECS", defaults.very_short_wait)?,
            short_wait: secs_or(&var, "NIREG_SHORT_WAIT_SECS", defaults.short_wait)?,
            reconcile_interval: secs_or(
                &var,
                "NIREG_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval,
            )?,
        };

        let max_pace_level = parse_or(&var, "NIREG_MAX_PACE_LEVEL", DEFAULT_MAX_PACE_LEVEL)?;

        let conflict_policy = match var("NIREG_CONFLICT_POLICY") {
            Some(v) => v
                .parse::<ConflictPolicy>()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("invalid NIREG_CONFLICT_POLICY")?,
            None => ConflictPolicy::default(),
        };

        Ok(Self {
            log_level,
            manifest_path,
            tick_interval,
            pace_policy,
            max_pace_level,
            conflict_policy,
        })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            tick_interval: self.tick_interval,
            pace_policy: self.pace_policy.clone(),
        }
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(v) => v.parse().with_context(|| format!("invalid {key}: {v:?}")),
        None => Ok(default),
    }
}

fn secs_or(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    parse_or(var, key, default.as_secs()).map(Duration::from_secs)
}
