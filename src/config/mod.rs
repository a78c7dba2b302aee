//! Typed configuration from environment variables.
//!
//! Loads once at startup. Every variable has a default; malformed values
//! fail fast with [`Error::Config`].

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{ControllerConfig, ShutdownMode};
use crate::error::{Error, Result};
use crate::queue::BackoffPolicy;
use crate::queue::backoff::DEFAULT_MAX_FACTOR;

#[derive(Debug, Clone)]
pub struct Config {
    pub controller_name: String,
    pub workers: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// `None` when `CONFLICT_DELAY_MS=0`.
    pub conflict_delay: Option<Duration>,
    pub reconcile_timeout: Option<Duration>,
    pub shutdown_mode: ShutdownMode,
    pub metrics_addr: SocketAddr,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let workers: usize = parsed_var("CONTROLLER_WORKERS")?.unwrap_or(2);
        if workers == 0 {
            return Err(Error::Config("CONTROLLER_WORKERS must be at least 1".into()));
        }

        let backoff_base = Duration::from_millis(parsed_var("BACKOFF_BASE_MS")?.unwrap_or(5));
        let backoff_max = match parsed_var::<u64>("BACKOFF_MAX_MS")? {
            Some(ms) => Duration::from_millis(ms),
            None => backoff_base.saturating_mul(DEFAULT_MAX_FACTOR),
        };
        if backoff_max < backoff_base {
            return Err(Error::Config(format!(
                "BACKOFF_MAX_MS ({}ms) is below BACKOFF_BASE_MS ({}ms)",
                backoff_max.as_millis(),
                backoff_base.as_millis()
            )));
        }

        let conflict_delay = match parsed_var::<u64>("CONFLICT_DELAY_MS")?.unwrap_or(10) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(Self {
            controller_name: std::env::var("CONTROLLER_NAME")
                .unwrap_or_else(|_| "resource".to_string()),
            workers,
            backoff_base,
            backoff_max,
            conflict_delay,
            reconcile_timeout: parsed_var::<u64>("RECONCILE_TIMEOUT_MS")?
                .map(Duration::from_millis),
            shutdown_mode: parsed_var("SHUTDOWN_MODE")?.unwrap_or_default(),
            metrics_addr: parsed_var("METRICS_ADDR")?
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 9090))),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.backoff_max)
    }

    /// The engine configuration these settings describe.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            name: self.controller_name.clone(),
            workers: self.workers,
            backoff: self.backoff(),
            conflict_delay: self.conflict_delay,
            reconcile_timeout: self.reconcile_timeout,
            shutdown: self.shutdown_mode,
        }
    }
}

/// Parse `name` if set. Unset or empty yields `Ok(None)`.
fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value for {name} ({raw:?}): {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::Config(format!("{name}: {e}"))),
    }
}
