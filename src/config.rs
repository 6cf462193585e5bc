use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{DriverError, Result};

const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;
const DEFAULT_TICK_MS: u64 = 1_000;
const DEFAULT_REFRESH_MS: u64 = 5_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;
const SCAN_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 15;
const MAX_CONNECT_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Device silence beyond this is a `Timeout`.
    pub write_timeout: Duration,
    /// Per-subscriber backlog before a slow reader starts missing records.
    pub notification_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Spacing of emission ticks, in run elapsed time.
    pub tick_interval: Duration,
    /// An unchanged rate is re-sent at least this often.
    pub refresh_interval: Duration,
    /// Total attempts per rate command, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per retry, capped at 8x.
    pub retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(DEFAULT_TICK_MS),
            refresh_interval: Duration::from_millis(DEFAULT_REFRESH_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

impl SchedulerConfig {
    /// Backoff before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        self.retry_delay * (1u32 << retry.saturating_sub(1).min(3))
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(DriverError::Validation("tick interval must be > 0".into()));
        }
        if self.refresh_interval.is_zero() {
            return Err(DriverError::Validation(
                "refresh interval must be > 0".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(DriverError::Validation("max attempts must be >= 1".into()));
        }
        Ok(())
    }
}

/// Settings for the BlueZ connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(SCAN_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            max_retries: MAX_CONNECT_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverConfig {
    pub dispatcher: DispatcherConfig,
    pub scheduler: SchedulerConfig,
    pub connector: ConnectorConfig,
}

impl DriverConfig {
    /// Defaults overridden by `PUMP_*` environment variables (and `.env`).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "PUMP_WRITE_TIMEOUT_MS")? {
            config.dispatcher.write_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "PUMP_TICK_MS")? {
            config.scheduler.tick_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "PUMP_REFRESH_MS")? {
            config.scheduler.refresh_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32>(&lookup, "PUMP_MAX_ATTEMPTS")? {
            config.scheduler.max_attempts = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "PUMP_RETRY_DELAY_MS")? {
            config.scheduler.retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "PUMP_SCAN_TIMEOUT_SECS")? {
            config.connector.scan_timeout = Duration::from_secs(secs);
        }

        config.scheduler.validate()?;
        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| DriverError::Validation(format!("{key}: cannot parse '{raw}'"))),
    }
}
