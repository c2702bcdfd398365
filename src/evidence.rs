//! Evidence frame capture with fail-closed redaction.
//!
//! A trigger frame is only stored once it has been through redaction (when
//! the task's policy asks for any). If redaction fails, or is required but no
//! redaction service is configured, the frame is dropped in fail-closed mode.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::store::RedactionPolicy;
use crate::util::trim_base_url;

const REDACTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Scene classes the redaction service should drop outright.
const PRIVATE_LOCATIONS: [&str; 6] = [
    "bathroom",
    "bedroom",
    "locker_room",
    "dressing_room",
    "hospital_room",
    "nursery",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedactionOutcome {
    pub redacted: bool,
    /// The service refused the frame entirely
    pub dropped: bool,
    #[serde(default)]
    pub frame_b64: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RedactionError {
    #[error("Redaction request failed: {0}")]
    Transport(String),

    #[error("Redaction service returned {0}")]
    Status(u16),

    #[error("Invalid redaction response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait FrameRedactor: Send + Sync {
    async fn redact(
        &self,
        frame_b64: &str,
        policy: &RedactionPolicy,
    ) -> Result<RedactionOutcome, RedactionError>;
}

#[derive(Serialize)]
struct RedactRequest<'a> {
    frame_b64: &'a str,
    config: &'a RedactionPolicy,
    private_locations: &'a [&'a str],
}

/// Redaction service reached at `{base_url}/redact`.
#[derive(Clone)]
pub struct HttpRedactor {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRedactor {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: trim_base_url(base_url),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl FrameRedactor for HttpRedactor {
    async fn redact(
        &self,
        frame_b64: &str,
        policy: &RedactionPolicy,
    ) -> Result<RedactionOutcome, RedactionError> {
        let resp = self
            .client
            .post(format!("{}/redact", self.base_url))
            .timeout(REDACTION_TIMEOUT)
            .json(&RedactRequest {
                frame_b64,
                config: policy,
                private_locations: &PRIVATE_LOCATIONS,
            })
            .send()
            .await
            .map_err(|e| RedactionError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RedactionError::Status(status.as_u16()));
        }
        resp.json::<RedactionOutcome>()
            .await
            .map_err(|e| RedactionError::InvalidResponse(e.to_string()))
    }
}

/// Decides which frame, if any, is stored as checkpoint evidence.
#[derive(Clone)]
pub struct EvidenceCapture {
    redactor: Option<Arc<dyn FrameRedactor>>,
    enabled: bool,
    fail_closed: bool,
}

impl EvidenceCapture {
    pub fn new(redactor: Option<Arc<dyn FrameRedactor>>, enabled: bool, fail_closed: bool) -> Self {
        Self {
            redactor,
            enabled,
            fail_closed,
        }
    }

    /// Stores frames as received. Only for tests and local development.
    pub fn passthrough() -> Self {
        Self::new(None, false, true)
    }

    /// Returns the frame to store, or `None` to drop it.
    pub async fn capture(&self, frame_b64: Option<&str>, policy: &RedactionPolicy) -> Option<String> {
        let frame = frame_b64.filter(|f| !f.is_empty())?;

        if !self.enabled || !policy.requires_redaction() {
            return Some(frame.to_string());
        }

        let Some(redactor) = &self.redactor else {
            if self.fail_closed {
                tracing::warn!("Redaction required but no redaction service configured; dropping frame");
                return None;
            }
            tracing::warn!("Redaction required but no redaction service configured; storing frame unredacted");
            return Some(frame.to_string());
        };

        match redactor.redact(frame, policy).await {
            Ok(outcome) if outcome.dropped => {
                tracing::info!("Redaction service dropped frame");
                None
            }
            Ok(outcome) => match outcome.frame_b64 {
                Some(redacted) => Some(redacted),
                None => {
                    tracing::warn!("Redaction response had no frame; dropping");
                    None
                }
            },
            Err(e) if self.fail_closed => {
                tracing::warn!(error = %e, "Redaction failed; dropping frame (fail-closed)");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redaction failed; storing frame unredacted");
                Some(frame.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubRedactor;

    #[tokio::test]
    async fn missing_frame_stores_nothing() {
        let capture = EvidenceCapture::passthrough();
        assert!(capture.capture(None, &RedactionPolicy::default()).await.is_none());
        assert!(capture.capture(Some(""), &RedactionPolicy::default()).await.is_none());
    }

    #[tokio::test]
    async fn policy_without_redaction_keeps_frame() {
        let capture = EvidenceCapture::new(None, true, true);
        let policy = RedactionPolicy {
            blur_faces: false,
            blur_text: false,
        };
        assert_eq!(capture.capture(Some("raw"), &policy).await.as_deref(), Some("raw"));
    }

    #[tokio::test]
    async fn required_redaction_without_service_drops_when_fail_closed() {
        let policy = RedactionPolicy::default();
        let closed = EvidenceCapture::new(None, true, true);
        assert!(closed.capture(Some("raw"), &policy).await.is_none());

        let open = EvidenceCapture::new(None, true, false);
        assert_eq!(open.capture(Some("raw"), &policy).await.as_deref(), Some("raw"));
    }

    #[tokio::test]
    async fn redactor_output_replaces_frame() {
        let capture = EvidenceCapture::new(Some(Arc::new(StubRedactor::Blur)), true, true);
        let stored = capture.capture(Some("raw"), &RedactionPolicy::default()).await;
        assert_eq!(stored.as_deref(), Some("blurred:raw"));
    }

    #[tokio::test]
    async fn redactor_errors_drop_frame_when_fail_closed() {
        let capture = EvidenceCapture::new(Some(Arc::new(StubRedactor::Fail)), true, true);
        assert!(capture.capture(Some("raw"), &RedactionPolicy::default()).await.is_none());

        let capture = EvidenceCapture::new(Some(Arc::new(StubRedactor::Drop)), true, false);
        assert!(capture.capture(Some("raw"), &RedactionPolicy::default()).await.is_none());
    }
}
