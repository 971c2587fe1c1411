//! Configuration types, read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::analysis::{AnalyzerConfig, DEFAULT_ANALYZER_MODEL, DEFAULT_ANALYZER_URL};
use crate::channels::EmailConfig;
use crate::error::{ConfigError, PolicyError};
use crate::pipeline::policy::TriagePolicy;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::worker::WorkerConfig;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    pub http_port: u16,
    pub worker: WorkerConfig,
    pub retry: RetryPolicy,
    /// JSON file overriding the built-in policy.
    pub policy_path: Option<PathBuf>,
    pub analyzer: AnalyzerConfig,
    /// Directory for the rolling log file. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
    /// Mailbox settings. Ingestion and reply dispatch are off when `None`.
    pub email: Option<EmailConfig>,
}

impl TriageConfig {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.email = EmailConfig::from_env();
        Ok(config)
    }

    /// Build config from an arbitrary variable source. Mailbox settings are
    /// not read here.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let worker_defaults = WorkerConfig::default();
        let retry_defaults = RetryPolicy::default();

        let workers: usize = parse_or(&lookup, "TRIAGE_WORKERS", worker_defaults.workers)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_WORKERS".into(),
                message: "at least one worker is required".into(),
            });
        }

        let multiplier: f64 =
            parse_or(&lookup, "TRIAGE_RETRY_MULTIPLIER", retry_defaults.multiplier)?;
        if multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_RETRY_MULTIPLIER".into(),
                message: format!("must be >= 1.0, got {multiplier}"),
            });
        }

        Ok(Self {
            db_path: lookup("TRIAGE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/inbox-triage.db")),
            http_port: parse_or(&lookup, "TRIAGE_HTTP_PORT", 8000)?,
            worker: WorkerConfig {
                workers,
                idle_poll: Duration::from_millis(parse_or(
                    &lookup,
                    "TRIAGE_IDLE_POLL_MS",
                    worker_defaults.idle_poll.as_millis() as u64,
                )?),
                stuck_timeout: secs(
                    &lookup,
                    "TRIAGE_STUCK_TIMEOUT_SECS",
                    worker_defaults.stuck_timeout,
                )?,
                recovery_interval: secs(
                    &lookup,
                    "TRIAGE_RECOVERY_INTERVAL_SECS",
                    worker_defaults.recovery_interval,
                )?,
            },
            retry: RetryPolicy {
                max_retries: parse_or(&lookup, "TRIAGE_MAX_RETRIES", retry_defaults.max_retries)?,
                base_delay: secs(&lookup, "TRIAGE_RETRY_BASE_SECS", retry_defaults.base_delay)?,
                multiplier,
                ..retry_defaults
            },
            policy_path: lookup("TRIAGE_POLICY_PATH").map(PathBuf::from),
            analyzer: AnalyzerConfig {
                url: lookup("TRIAGE_ANALYZER_URL").unwrap_or_else(|| DEFAULT_ANALYZER_URL.into()),
                model: lookup("TRIAGE_ANALYZER_MODEL")
                    .unwrap_or_else(|| DEFAULT_ANALYZER_MODEL.into()),
                timeout: secs(&lookup, "TRIAGE_ANALYZER_TIMEOUT_SECS", Duration::from_secs(60))?,
            },
            log_dir: lookup("TRIAGE_LOG_DIR").map(PathBuf::from),
            email: None,
        })
    }

    /// The configured policy, or the built-in one.
    pub fn load_policy(&self) -> Result<TriagePolicy, PolicyError> {
        match &self.policy_path {
            Some(path) => TriagePolicy::from_file(path),
            None => Ok(TriagePolicy::default()),
        }
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}
