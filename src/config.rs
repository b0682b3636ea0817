//! Configuration types.
//!
//! Everything is read from the environment. Each `from_env()` delegates to a
//! `from_lookup()` that takes the variable source as a closure, so parsing
//! can be tested without touching process state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::jobs::JobType;

/// Environment variable holding the worker's control base URL.
pub const CONTROL_URL_VAR: &str = "WORKER_CONTROL_URL";

/// Parse `key` with `FromStr`, falling back to `default` when unset or blank.
fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => v.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{v}': {e}"),
        }),
        _ => Ok(default),
    }
}

fn non_blank<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ── Worker control ──────────────────────────────────────────────────

/// Connection settings for the remote worker's control webhook.
#[derive(Debug, Clone)]
pub struct WorkerControlConfig {
    /// Base URL, e.g. `https://abc123.ngrok.app`. Required for any control call.
    pub base_url: Option<String>,
    /// Optional bearer token sent with every request.
    pub token: Option<SecretString>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for WorkerControlConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerControlConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let timeout_secs: u64 = parse_or(&lookup, "WORKER_CONTROL_TIMEOUT_SECS", 30)?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WORKER_CONTROL_TIMEOUT_SECS".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(Self {
            base_url: non_blank(&lookup, CONTROL_URL_VAR),
            token: non_blank(&lookup, "WORKER_CONTROL_TOKEN").map(SecretString::from),
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Self::default()
        }
    }

    /// The base URL without a trailing slash, or a fatal configuration error.
    pub fn require_base_url(&self) -> Result<String, ConfigError> {
        let url = self
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ConfigError::MissingRequired {
                key: CONTROL_URL_VAR.into(),
                hint: format!(
                    "Start the worker, copy the public webhook URL it prints, \
                     and export {CONTROL_URL_VAR}=<that URL> before running control commands."
                ),
            })?;

        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: CONTROL_URL_VAR.into(),
                message: format!("'{url}' must start with http:// or https://"),
            });
        }
        Ok(url.trim_end_matches('/').to_string())
    }
}

// ── Duration estimator ──────────────────────────────────────────────

/// Tuning knobs for the activation-duration estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorConfig {
    /// Base duration for types with no dedicated arm and no override.
    pub default_base_seconds: u64,
    /// Fixed per-job overhead.
    pub overhead_seconds: u64,
    /// Multiplicative safety margin in percent (120 = ×1.2).
    pub safety_buffer_percent: u32,
    pub min_minutes: u32,
    pub max_minutes: u32,
    /// Per-type base durations that replace the built-in table.
    pub overrides: HashMap<JobType, u64>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            default_base_seconds: 60,
            overhead_seconds: 5,
            safety_buffer_percent: 120,
            min_minutes: 5,
            max_minutes: 60,
            overrides: HashMap::new(),
        }
    }
}

impl EstimatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let config = Self {
            default_base_seconds: parse_or(
                &lookup,
                "ESTIMATOR_DEFAULT_BASE_SECS",
                d.default_base_seconds,
            )?,
            overhead_seconds: parse_or(&lookup, "ESTIMATOR_OVERHEAD_SECS", d.overhead_seconds)?,
            safety_buffer_percent: parse_or(
                &lookup,
                "ESTIMATOR_BUFFER_PERCENT",
                d.safety_buffer_percent,
            )?,
            min_minutes: parse_or(&lookup, "ESTIMATOR_MIN_MINUTES", d.min_minutes)?,
            max_minutes: parse_or(&lookup, "ESTIMATOR_MAX_MINUTES", d.max_minutes)?,
            overrides: match non_blank(&lookup, "ESTIMATOR_BASE_SECONDS") {
                Some(raw) => parse_overrides(&raw)?,
                None => HashMap::new(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_minutes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ESTIMATOR_MIN_MINUTES".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.min_minutes > self.max_minutes {
            return Err(ConfigError::InvalidValue {
                key: "ESTIMATOR_MAX_MINUTES".into(),
                message: format!(
                    "max ({}) is below min ({})",
                    self.max_minutes, self.min_minutes
                ),
            });
        }
        if self.safety_buffer_percent < 100 {
            return Err(ConfigError::InvalidValue {
                key: "ESTIMATOR_BUFFER_PERCENT".into(),
                message: format!(
                    "{} would shrink the estimate; use 100 or more",
                    self.safety_buffer_percent
                ),
            });
        }
        Ok(())
    }
}

/// Parse `EXPORT_CSV=45,GENERATE_REPORT=600`.
fn parse_overrides(raw: &str) -> Result<HashMap<JobType, u64>, ConfigError> {
    let mut overrides = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, secs) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "ESTIMATOR_BASE_SECONDS".into(),
                message: format!("'{entry}' is not JOB_NAME=SECONDS"),
            })?;
        let secs: u64 = secs
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "ESTIMATOR_BASE_SECONDS".into(),
                message: format!("'{entry}': {e}"),
            })?;
        overrides.insert(JobType::from(name.trim()), secs);
    }
    Ok(overrides)
}

// ── Scheduler ───────────────────────────────────────────────────────

/// When the periodic trigger fires.
#[derive(Debug, Clone)]
pub enum TickSchedule {
    /// Fixed cadence.
    Every(Duration),
    /// 6-field cron expression (seconds first).
    Cron(Box<cron::Schedule>),
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub schedule: TickSchedule,
    /// Poll interval handed to the worker on activation.
    pub poll_interval_secs: u64,
    /// Initiator recorded for automatic activations.
    pub initiator: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule: TickSchedule::Every(Duration::from_secs(300)),
            poll_interval_secs: 5,
            initiator: "scheduler".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let schedule = match non_blank(&lookup, "SCHEDULER_CRON") {
            Some(expr) => {
                let parsed =
                    cron::Schedule::from_str(&expr).map_err(|e| ConfigError::InvalidValue {
                        key: "SCHEDULER_CRON".into(),
                        message: format!("invalid cron '{expr}': {e}"),
                    })?;
                TickSchedule::Cron(Box::new(parsed))
            }
            None => {
                let secs: u64 = parse_or(&lookup, "SCHEDULER_INTERVAL_SECS", 300)?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "SCHEDULER_INTERVAL_SECS".into(),
                        message: "must be at least 1".into(),
                    });
                }
                TickSchedule::Every(Duration::from_secs(secs))
            }
        };

        Ok(Self {
            schedule,
            poll_interval_secs: parse_or(&lookup, "SCHEDULER_POLL_INTERVAL_SECS", 5)?,
            initiator: non_blank(&lookup, "SCHEDULER_INITIATOR")
                .unwrap_or_else(|| "scheduler".to_string()),
        })
    }
}

// ── Worker host ─────────────────────────────────────────────────────

/// Settings for the reference worker host.
#[derive(Debug, Clone)]
pub struct WorkerHostConfig {
    pub port: u16,
    /// Name reported by `/status`.
    pub name: String,
    /// How long `deactivate` waits for the processor loop to exit.
    pub stop_timeout: Duration,
    /// Consecutive empty polls that end an auto-stopping run early.
    pub idle_limit: u32,
}

impl Default for WorkerHostConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            name: "job-autoscaler".to_string(),
            stop_timeout: Duration::from_secs(10),
            idle_limit: 10,
        }
    }
}

impl WorkerHostConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        Ok(Self {
            port: parse_or(&lookup, "WORKER_PORT", d.port)?,
            name: non_blank(&lookup, "WORKER_NAME").unwrap_or(d.name),
            stop_timeout: Duration::from_secs(parse_or(
                &lookup,
                "WORKER_STOP_TIMEOUT_SECS",
                d.stop_timeout.as_secs(),
            )?),
            idle_limit: parse_or(&lookup, "WORKER_IDLE_LIMIT", d.idle_limit)?,
        })
    }
}

// ── Storage / logging ───────────────────────────────────────────────

/// Where the database and log files live.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// When set, logs are also written to daily files in this directory.
    pub log_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            db_path: non_blank(&lookup, "AUTOSCALER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/job-autoscaler.db")),
            log_dir: non_blank(&lookup, "AUTOSCALER_LOG_DIR").map(PathBuf::from),
        }
    }
}
