//! Configuration for the proofstream server.
//!
//! Everything is read from environment variables:
//! - `HOST` / `PORT` - Listen address. Defaults to `0.0.0.0:3000`.
//! - `PUBLIC_BASE_URL` - Base URL the monitoring service calls back on.
//!   Defaults to `http://localhost:<PORT>`.
//! - `STORE_TYPE` - `memory` or `sqlite` (default).
//! - `DATABASE_PATH` - SQLite file. Defaults to `./data/proofstream.db`.
//! - `MONITOR_BASE_URL` - Required. Vision monitoring service.
//! - `MONITOR_API_KEY` - Optional. Bearer token, or a Google key (`AIza...`).
//! - `MONITOR_WEBHOOK_SECRET` - Optional. Empty accepts unsigned webhooks.
//! - `MAX_CONCURRENT_JOBS` - Defaults to `10`.
//! - `DEFAULT_INTERVAL_SECONDS` - Defaults to `15`.
//! - `DEFAULT_INPUT_MODE` - `frames` (default), `clip` or `hybrid`.
//! - `DEFAULT_PREFILTER` - Defaults to `true`.
//! - `JOB_MAX_DURATION_SECONDS` - Per-job auto-stop. Defaults to `600`.
//! - `JOB_RESTART_GAP_TARGET_MS` - Defaults to `2000`.
//! - `DEFAULT_MAX_DURATION_SECONDS` - Task lifetime. Defaults to `3600`.
//! - `STREAM_RELAY_BASE_URL` - Prefix for per-task stream references.
//! - `IDEMPOTENCY_TTL_SECS` / `IDEMPOTENCY_CLEANUP_SECS` - `300` / `60`.
//! - `HEARTBEAT_INTERVAL_SECS` - Defaults to `30`.
//! - `LEDGER_URL` - Optional. Without it receipts come from a local ledger.
//! - `LEDGER_API_KEY` - Optional.
//! - `LEDGER_TIMEOUT_MS` / `LEDGER_MAX_RETRIES` - `3000` / `3`.
//! - `DELIVERY_TIMEOUT_SECS` - Defaults to `10`.
//! - `REDACTION_ENABLED` / `REDACTION_FAIL_CLOSED` - Both default to `true`.
//! - `REDACTION_SERVICE_URL` - Optional.
//! - `FRAME_RETENTION_MINUTES` / `MAINTENANCE_INTERVAL_SECS` - `60` / `60`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::jobs::JobSettings;
use crate::monitor::InputMode;
use crate::orchestrator::OrchestratorSettings;
use crate::settlement::SettlementPolicy;
use crate::store::StoreType;
use crate::util::{parse_bool, trim_base_url};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub store_type: StoreType,
    pub database_path: PathBuf,
}

/// Vision monitoring service.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub base_url: String,
    pub api_key: String,
    /// Shared HMAC secret for inbound webhooks
    pub webhook_secret: String,
}

impl MonitorConfig {
    pub fn verifies_signatures(&self) -> bool {
        !self.webhook_secret.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub max_concurrent_jobs: usize,
    pub default_interval_seconds: u32,
    pub default_input_mode: InputMode,
    pub enable_prefilter: bool,
    pub max_duration_seconds: u64,
    pub restart_gap_target: Duration,
}

#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub default_max_duration_seconds: u64,
    pub stream_relay_base_url: String,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub idempotency_ttl: Duration,
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// `None` selects the in-process ledger
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct RedactionConfig {
    pub enabled: bool,
    pub fail_closed: bool,
    pub service_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub frame_retention: Duration,
    pub maintenance_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL of this server
    pub public_base_url: String,
    pub store: StoreConfig,
    pub monitor: MonitorConfig,
    pub jobs: JobConfig,
    pub tasks: TaskConfig,
    pub webhooks: WebhookConfig,
    pub heartbeat_interval: Duration,
    pub ledger: LedgerConfig,
    pub delivery_timeout: Duration,
    pub redaction: RedactionConfig,
    pub retention: RetentionConfig,
}

/// Reads a numeric setting, falling back to `default` when unset.
fn parse_var<T, F>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}

fn bool_var<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str, default: bool) -> bool {
    lookup(name).map(|v| parse_bool(&v)).unwrap_or(default)
}

/// Non-empty string setting.
fn opt_var<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `MONITOR_BASE_URL` is not set,
    /// and `ConfigError::InvalidValue` for any value that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = opt_var(&lookup, "HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = parse_var(&lookup, "PORT", 3000)?;
        let public_base_url = opt_var(&lookup, "PUBLIC_BASE_URL")
            .map(|url| trim_base_url(&url))
            .unwrap_or_else(|| format!("http://localhost:{}", port));

        let store = StoreConfig {
            store_type: opt_var(&lookup, "STORE_TYPE")
                .map(|s| StoreType::from_str(&s))
                .unwrap_or_default(),
            database_path: opt_var(&lookup, "DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/proofstream.db")),
        };

        let monitor = MonitorConfig {
            base_url: opt_var(&lookup, "MONITOR_BASE_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("MONITOR_BASE_URL".to_string()))?,
            api_key: opt_var(&lookup, "MONITOR_API_KEY").unwrap_or_default(),
            webhook_secret: opt_var(&lookup, "MONITOR_WEBHOOK_SECRET").unwrap_or_default(),
        };

        let default_input_mode = match opt_var(&lookup, "DEFAULT_INPUT_MODE") {
            Some(raw) => InputMode::parse(&raw).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "DEFAULT_INPUT_MODE".to_string(),
                    format!("expected frames, clip or hybrid, got {}", raw),
                )
            })?,
            None => InputMode::default(),
        };

        let max_concurrent_jobs: usize = parse_var(&lookup, "MAX_CONCURRENT_JOBS", 10)?;
        if max_concurrent_jobs == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_CONCURRENT_JOBS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let default_interval_seconds: u32 = parse_var(&lookup, "DEFAULT_INTERVAL_SECONDS", 15)?;
        if default_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "DEFAULT_INTERVAL_SECONDS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let jobs = JobConfig {
            max_concurrent_jobs,
            default_interval_seconds,
            default_input_mode,
            enable_prefilter: bool_var(&lookup, "DEFAULT_PREFILTER", true),
            max_duration_seconds: parse_var(
                &lookup,
                "JOB_MAX_DURATION_SECONDS",
                crate::monitor::DEFAULT_MAX_DURATION_SECONDS,
            )?,
            restart_gap_target: Duration::from_millis(parse_var(
                &lookup,
                "JOB_RESTART_GAP_TARGET_MS",
                2000,
            )?),
        };

        let tasks = TaskConfig {
            default_max_duration_seconds: parse_var(&lookup, "DEFAULT_MAX_DURATION_SECONDS", 3600)?,
            stream_relay_base_url: opt_var(&lookup, "STREAM_RELAY_BASE_URL")
                .map(|url| trim_base_url(&url))
                .unwrap_or_else(|| "rtsp://localhost:8554/live".to_string()),
        };

        let webhooks = WebhookConfig {
            idempotency_ttl: Duration::from_secs(parse_var(&lookup, "IDEMPOTENCY_TTL_SECS", 300)?),
            cleanup_interval: Duration::from_secs(parse_var(
                &lookup,
                "IDEMPOTENCY_CLEANUP_SECS",
                60,
            )?),
        };

        let ledger = LedgerConfig {
            url: opt_var(&lookup, "LEDGER_URL"),
            api_key: opt_var(&lookup, "LEDGER_API_KEY"),
            timeout: Duration::from_millis(parse_var(&lookup, "LEDGER_TIMEOUT_MS", 3000)?),
            max_retries: parse_var(&lookup, "LEDGER_MAX_RETRIES", 3)?,
        };

        let redaction = RedactionConfig {
            enabled: bool_var(&lookup, "REDACTION_ENABLED", true),
            fail_closed: bool_var(&lookup, "REDACTION_FAIL_CLOSED", true),
            service_url: opt_var(&lookup, "REDACTION_SERVICE_URL"),
        };

        let retention = RetentionConfig {
            frame_retention: Duration::from_secs(
                parse_var::<u64, _>(&lookup, "FRAME_RETENTION_MINUTES", 60)? * 60,
            ),
            maintenance_interval: Duration::from_secs(parse_var(
                &lookup,
                "MAINTENANCE_INTERVAL_SECS",
                60,
            )?),
        };

        Ok(Self {
            host,
            port,
            public_base_url,
            store,
            monitor,
            jobs,
            tasks,
            webhooks,
            heartbeat_interval: Duration::from_secs(parse_var(
                &lookup,
                "HEARTBEAT_INTERVAL_SECS",
                30,
            )?),
            ledger,
            delivery_timeout: Duration::from_secs(parse_var(&lookup, "DELIVERY_TIMEOUT_SECS", 10)?),
            redaction,
            retention,
        })
    }

    /// Webhook URL handed to the monitoring service for every job.
    pub fn callback_url(&self) -> String {
        format!("{}/webhooks/monitor", self.public_base_url)
    }

    pub fn job_settings(&self) -> JobSettings {
        JobSettings {
            max_concurrent_jobs: self.jobs.max_concurrent_jobs,
            enable_prefilter: self.jobs.enable_prefilter,
            max_duration_seconds: self.jobs.max_duration_seconds,
            restart_gap_target: self.jobs.restart_gap_target,
            callback_url: self.callback_url(),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            stream_relay_base_url: self.tasks.stream_relay_base_url.clone(),
            default_max_duration_seconds: self.tasks.default_max_duration_seconds,
            interval_seconds: self.jobs.default_interval_seconds,
            input_mode: self.jobs.default_input_mode,
        }
    }

    pub fn settlement_policy(&self) -> SettlementPolicy {
        SettlementPolicy {
            timeout: self.ledger.timeout,
            max_retries: self.ledger.max_retries,
            ..SettlementPolicy::default()
        }
    }
}
