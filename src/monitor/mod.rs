//! External vision-monitoring service boundary.
//!
//! The service watches a live stream against a natural-language condition and
//! reports back asynchronously through signed webhooks. This module holds the
//! request/response types shared by the HTTP client, the webhook receiver and
//! the heartbeat reconciler.

mod client;

pub use client::HttpMonitorClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Default auto-stop applied by the service when a request does not set one.
pub const DEFAULT_MAX_DURATION_SECONDS: u64 = 600;

/// How the monitor samples the stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    #[default]
    Frames,
    Clip,
    Hybrid,
}

impl InputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Frames => "frames",
            Self::Clip => "clip",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "frames" => Some(Self::Frames),
            "clip" => Some(Self::Clip),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

/// Why the service stopped a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The service's own duration cap; the only reason that triggers a restart.
    MaxDurationReached,
    StreamOffline,
    ConditionTriggered,
    Cancelled,
    Error,
    #[serde(other)]
    Unknown,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxDurationReached => "max_duration_reached",
            Self::StreamOffline => "stream_offline",
            Self::ConditionTriggered => "condition_triggered",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_restartable(&self) -> bool {
        matches!(self, Self::MaxDurationReached)
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job state as reported by the service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteJobState {
    Running,
    Stopped,
    Error,
    Completed,
    #[serde(other)]
    Unknown,
}

impl RemoteJobState {
    /// Stop reason implied by this state, or `None` while the job is (or
    /// may still be) producing checks. Webhooks and heartbeat polls both go
    /// through here.
    pub fn stop_reason(&self, reported: Option<StopReason>) -> Option<StopReason> {
        match self {
            Self::Stopped | Self::Completed => Some(reported.unwrap_or(StopReason::Unknown)),
            Self::Error => Some(reported.unwrap_or(StopReason::Error)),
            Self::Running | Self::Unknown => None,
        }
    }
}

/// Request body for starting a live monitor.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MonitorRequest {
    /// Stream reference
    pub url: String,
    pub condition: String,
    pub webhook_url: String,
    pub interval_seconds: u32,
    pub input_mode: InputMode,
    pub enable_prefilter: bool,
    pub max_duration_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorStarted {
    pub job_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteJobStatus {
    pub job_id: String,
    pub status: RemoteJobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checks_performed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers_fired: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Monitor service request failed: {0}")]
    Transport(String),

    #[error("Monitor service {path} returned {status}: {body}")]
    Api {
        status: u16,
        path: String,
        body: String,
    },

    #[error("Monitor service refused to start job: {0}")]
    Rejected(String),

    #[error("Invalid monitor service response: {0}")]
    InvalidResponse(String),
}

/// Operations the orchestrator needs from the monitoring service.
#[async_trait]
pub trait MonitorService: Send + Sync {
    /// Start a live monitor and return the external job identifier.
    async fn start_monitor(&self, request: &MonitorRequest) -> Result<String, MonitorError>;

    async fn job_status(&self, job_id: &str) -> Result<RemoteJobStatus, MonitorError>;

    async fn cancel_job(&self, job_id: &str) -> Result<(), MonitorError>;
}
