//! Runtime settings read from the environment (and `.env`).

use anyhow::{Context, Result, anyhow};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::scheduler::{BackoffPolicy, SchedulerSettings};
use crate::subscriptions::QuietHours;

#[derive(Debug, Clone)]
pub struct Settings {
    pub state_path: PathBuf,
    pub telegram_token: Option<String>,
    /// Time between scheduling passes.
    pub tick_interval: Duration,
    pub fetch_timeout: Duration,
    /// Datasets are re-downloaded at least this often to pick up revisions.
    pub refresh_interval: Duration,
    /// First delay before restarting a failed service.
    pub restart_delay: Duration,
    /// Quiet hours given to new subscriptions.
    pub quiet_hours: QuietHours,
    pub scheduler: SchedulerSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any key lookup; unset keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let secs = |key: &str, default: u64| -> Result<Duration> {
            Ok(Duration::from_secs(parse_or(get(key), key, default)?))
        };

        let backoff = BackoffPolicy {
            base: secs("BACKOFF_BASE_SECS", 60)?,
            cap: secs("BACKOFF_CAP_SECS", 6 * 3600)?,
        };
        if backoff.base > backoff.cap {
            return Err(anyhow!("BACKOFF_BASE_SECS must not exceed BACKOFF_CAP_SECS"));
        }

        let scheduler = SchedulerSettings {
            pending_horizon_days: parse_or(get("PENDING_HORIZON_DAYS"), "PENDING_HORIZON_DAYS", 7)?,
            max_backlog: parse_or(get("MAX_BACKLOG"), "MAX_BACKLOG", 3)?,
            send_timeout: secs("SEND_TIMEOUT_SECS", 30)?,
            backoff,
        };

        let tick_interval = secs("TICK_INTERVAL_SECS", 600)?;
        if tick_interval.is_zero() {
            return Err(anyhow!("TICK_INTERVAL_SECS must be positive"));
        }

        Ok(Self {
            state_path: get("STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("share/state.json")),
            telegram_token: get("TELEGRAM_TOKEN"),
            tick_interval,
            fetch_timeout: secs("FETCH_TIMEOUT_SECS", 60)?,
            refresh_interval: secs("REFRESH_INTERVAL_SECS", 6 * 3600)?,
            restart_delay: secs("RESTART_DELAY_SECS", 5)?,
            quiet_hours: parse_or(get("QUIET_HOURS"), "QUIET_HOURS", QuietHours::default())?,
            scheduler,
        })
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match raw {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: '{v}'")),
        None => Ok(default),
    }
}
