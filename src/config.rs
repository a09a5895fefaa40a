use std::path::PathBuf;
use std::time::Duration;

use crate::limits::{DAY_MS, HOUR_MS, MAX_HOLD_WINDOW_HOURS, MAX_LOAN_PERIOD_DAYS};
use crate::model::Ms;
use crate::model::Policy;

/// `n` units of `unit_ms`, if `n` is in `1..=max`.
fn duration_ms(n: u64, max: u64, unit_ms: Ms) -> Option<Ms> {
    if n == 0 || n > max {
        return None;
    }
    i64::try_from(n).ok()?.checked_mul(unit_ms)
}

/// Process configuration, read from `SHELFD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub sweep_interval: Duration,
    pub policy: Policy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7654,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            sweep_interval: Duration::from_secs(60),
            policy: Policy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values keep their default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| get(key).and_then(|v| v.trim().parse::<u64>().ok());
        let d = Self::default();
        let policy = Policy {
            loan_period_ms: parse("SHELFD_LOAN_PERIOD_DAYS")
                .and_then(|n| duration_ms(n, MAX_LOAN_PERIOD_DAYS, DAY_MS))
                .unwrap_or(d.policy.loan_period_ms),
            hold_window_ms: parse("SHELFD_HOLD_WINDOW_HOURS")
                .and_then(|n| duration_ms(n, MAX_HOLD_WINDOW_HOURS, HOUR_MS))
                .unwrap_or(d.policy.hold_window_ms),
            max_active_loans: parse("SHELFD_MAX_ACTIVE_LOANS")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(d.policy.max_active_loans),
        };
        Self {
            bind: get("SHELFD_BIND").unwrap_or(d.bind),
            port: parse("SHELFD_PORT")
                .and_then(|n| u16::try_from(n).ok())
                .unwrap_or(d.port),
            data_dir: get("SHELFD_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            max_connections: parse("SHELFD_MAX_CONNECTIONS")
                .filter(|&n| n > 0)
                .map_or(d.max_connections, |n| n as usize),
            compact_threshold: parse("SHELFD_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            metrics_port: parse("SHELFD_METRICS_PORT").and_then(|n| u16::try_from(n).ok()),
            sweep_interval: parse("SHELFD_SWEEP_INTERVAL_SECS")
                .filter(|&n| n > 0)
                .map_or(d.sweep_interval, Duration::from_secs),
            policy,
        }
    }
}
