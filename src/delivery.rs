//! Outbound delivery of verification events to a task's destination URL.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::store::{EventKind, VerificationEvent};

pub const EVENT_HEADER: &str = "X-Proofstream-Event";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body POSTed to the destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryPayload {
    pub event_id: Uuid,
    pub task_id: Uuid,
    pub event_type: EventKind,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_hash: Option<String>,
    pub metadata: serde_json::Value,
}

impl DeliveryPayload {
    /// Project a stored event onto the wire shape. Checkpoint details and the
    /// verification hash are lifted out of the event metadata when present.
    pub fn from_event(event: &VerificationEvent) -> Self {
        let meta_str = |key: &str| {
            event
                .metadata
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        Self {
            event_id: event.event_id,
            task_id: event.task_id,
            event_type: event.event_type,
            timestamp: event.created_at.clone(),
            checkpoint_id: event.checkpoint_id,
            checkpoint_type: meta_str("checkpoint_type"),
            checkpoint_target: meta_str("checkpoint_target"),
            confidence: event.confidence,
            explanation: event.explanation.clone(),
            verification_hash: meta_str("verification_hash"),
            metadata: event.metadata.clone(),
        }
    }
}

/// Internal bookkeeping events stay in the audit trail only.
pub fn is_delivered(kind: EventKind) -> bool {
    !matches!(kind, EventKind::JobRestarted | EventKind::JobError)
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("No destination URL")]
    NoDestination,

    #[error("Delivery request failed: {0}")]
    Transport(String),

    #[error("Destination returned {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait EventDelivery: Send + Sync {
    async fn deliver(&self, destination: &str, payload: &DeliveryPayload)
        -> Result<(), DeliveryError>;
}

#[derive(Clone)]
pub struct HttpEventDelivery {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for HttpEventDelivery {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl HttpEventDelivery {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl EventDelivery for HttpEventDelivery {
    async fn deliver(
        &self,
        destination: &str,
        payload: &DeliveryPayload,
    ) -> Result<(), DeliveryError> {
        if destination.is_empty() {
            return Err(DeliveryError::NoDestination);
        }

        let resp = self
            .client
            .post(destination)
            .header(EVENT_HEADER, payload.event_type.as_str())
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected(status.as_u16()));
        }
        tracing::debug!(
            destination = %destination,
            event_type = payload.event_type.as_str(),
            "Event delivered"
        );
        Ok(())
    }
}
