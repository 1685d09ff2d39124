use anyhow::{Context, Result};
use serde::Serialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::services::registry::DEFAULT_CONNECTING_STALE_SECS;
use crate::services::scheduler::MonitorSettings;

/// Runtime configuration, read from the environment (after `.env` is loaded).
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub monitor_interval_secs: u64,
    pub reconcile_freshness_hours: i64,
    pub reconcile_batch_size: u32,
    pub imap_timeout_secs: u64,
    pub connecting_stale_secs: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Missing keys take defaults; present but malformed keys are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Config {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://inbound_reconciler.db".into()),
            port: parse_var(&lookup, "PORT", 3030)?,
            monitor_interval_secs: parse_var(&lookup, "MONITOR_INTERVAL_SECS", 15 * 60)?,
            reconcile_freshness_hours: parse_var(&lookup, "RECONCILE_FRESHNESS_HOURS", 6)?,
            reconcile_batch_size: parse_var(&lookup, "RECONCILE_BATCH_SIZE", 3)?,
            imap_timeout_secs: parse_var(&lookup, "IMAP_TIMEOUT_SECS", 30)?,
            connecting_stale_secs: parse_var(
                &lookup,
                "CONNECTING_STALE_SECS",
                DEFAULT_CONNECTING_STALE_SECS,
            )?,
        })
    }

    pub fn imap_timeout(&self) -> Duration {
        Duration::from_secs(self.imap_timeout_secs.max(1))
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_secs(self.monitor_interval_secs.max(1)),
            reconcile_freshness_secs: self.reconcile_freshness_hours.max(0) * 3600,
            reconcile_batch_size: self.reconcile_batch_size,
            connecting_stale_secs: self.connecting_stale_secs,
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        _ => Ok(default),
    }
}
