//! Inbound webhook payloads from the monitoring service.
//!
//! Every payload shares an envelope of `event`, `job_id` and `timestamp`. The
//! envelope alone is enough to build the idempotency key, so it is parsed
//! before the typed event.

pub mod idempotency;
pub mod signature;

pub use idempotency::IdempotencyTracker;
pub use signature::{compute_signature, verify_signature};

use serde::Deserialize;

use crate::monitor::{RemoteJobState, StopReason};

/// Header carrying the HMAC signature of the raw body.
pub const SIGNATURE_HEADER: &str = "x-monitor-signature";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct WebhookEnvelope {
    pub event: String,
    pub job_id: String,
    pub timestamp: String,
}

impl WebhookEnvelope {
    pub fn idempotency_key(&self) -> String {
        IdempotencyTracker::key_from(&self.job_id, &self.event, &self.timestamp)
    }
}

/// Typed webhook event. Unrecognised event names land in `Unknown`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WebhookEvent {
    LiveMonitorTriggered {
        job_id: String,
        timestamp: String,
        explanation: String,
        #[serde(default)]
        frame_b64: Option<String>,
        #[serde(default)]
        condition: Option<String>,
        #[serde(default)]
        check_number: Option<u64>,
    },
    JobStatus {
        job_id: String,
        timestamp: String,
        status: RemoteJobState,
        #[serde(default)]
        stop_reason: Option<StopReason>,
    },
    JobError {
        job_id: String,
        timestamp: String,
        error: String,
        #[serde(default)]
        recoverable: bool,
    },
    LiveDigestReady {
        job_id: String,
        timestamp: String,
    },
    #[serde(other)]
    Unknown,
}

impl WebhookEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LiveMonitorTriggered { .. } => "live_monitor_triggered",
            Self::JobStatus { .. } => "job_status",
            Self::JobError { .. } => "job_error",
            Self::LiveDigestReady { .. } => "live_digest_ready",
            Self::Unknown => "unknown",
        }
    }
}
