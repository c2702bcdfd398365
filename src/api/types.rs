//! API request and response types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{Checkpoint, Task};

/// A task together with its checkpoints.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub checkpoints: Vec<Checkpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimRequest {
    pub human_id: String,
}

/// Response after streaming starts.
#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    pub task_id: Uuid,
    pub job_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_list_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_list_limit() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_events_limit")]
    pub limit: usize,
}

fn default_events_limit() -> usize {
    100
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Monitoring jobs currently running
    pub running_jobs: usize,

    /// Cross-task job ceiling
    pub max_concurrent_jobs: usize,

    /// Whether inbound webhooks must carry a valid signature
    pub webhook_signatures: bool,
}

/// Acknowledgement returned to the monitoring service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookAck {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl WebhookAck {
    pub fn accepted(event: &str) -> Self {
        Self {
            status: "accepted".to_string(),
            event: Some(event.to_string()),
        }
    }

    pub fn duplicate() -> Self {
        Self {
            status: "duplicate".to_string(),
            event: None,
        }
    }
}
