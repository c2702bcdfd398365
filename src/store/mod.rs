//! Task storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database, the authoritative store in production
//!
//! The store is the single source of truth for task, checkpoint, job and event
//! state. Nothing above it caches rows across requests.

mod memory;
mod sqlite;

pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::checkpoints::CheckpointType;
use crate::ledger::LedgerReceipt;
use crate::monitor::InputMode;

pub use crate::util::now_string;

/// Lifecycle of a verification task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for an operator to claim it
    Pending,
    /// Claimed, waiting for the live stream to connect
    AwaitingStream,
    /// Stream connected, monitoring job running
    Streaming,
    /// At least one trigger has been evaluated
    Verifying,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingStream => "awaiting_stream",
            Self::Streaming => "streaming",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "awaiting_stream" => Some(Self::AwaitingStream),
            "streaming" => Some(Self::Streaming),
            "verifying" => Some(Self::Verifying),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether trigger events for this task should still be evaluated.
    pub fn is_monitoring(&self) -> bool {
        matches!(self, Self::Streaming | Self::Verifying)
    }

    /// Absorbing states: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Expired | Self::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which evidence redactions a task requires before frames are stored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RedactionPolicy {
    pub blur_faces: bool,
    pub blur_text: bool,
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self {
            blur_faces: true,
            blur_text: false,
        }
    }
}

impl RedactionPolicy {
    pub fn requires_redaction(&self) -> bool {
        self.blur_faces || self.blur_text
    }
}

/// A verification task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub agent_id: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Destination URL for verification event delivery
    pub webhook_url: String,
    pub status: TaskStatus,
    /// Stream reference handed to the monitoring service
    pub stream_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_id: Option<String>,
    pub max_duration_seconds: u64,
    pub redaction_policy: RedactionPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_receipt: Option<LedgerReceipt>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// One verifiable sub-condition of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub task_id: Uuid,
    #[serde(rename = "type")]
    pub kind: CheckpointType,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub confidence_threshold: f64,
    pub required: bool,
    pub ordering: i64,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    /// Redacted evidence frame, cleared by retention
    #[serde(skip_serializing)]
    pub evidence_frame: Option<String>,
}

/// Checkpoint definition supplied at task creation.
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub kind: CheckpointType,
    pub target: String,
    pub description: Option<String>,
    pub confidence_threshold: f64,
    pub required: bool,
    pub ordering: i64,
}

/// Task definition supplied at task creation (already validated).
#[derive(Debug, Clone)]
pub struct NewTask {
    pub agent_id: String,
    pub description: String,
    pub title: Option<String>,
    pub webhook_url: String,
    pub stream_url_base: String,
    pub max_duration_seconds: u64,
    pub redaction_policy: RedactionPolicy,
    pub checkpoints: Vec<NewCheckpoint>,
}

/// Local view of a remote monitoring job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Stopped,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One running instance of the external monitor for a task.
///
/// `job_id` is the current external identifier; it changes on every restart
/// and superseded identifiers are kept as aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub task_id: Uuid,
    pub condition: String,
    pub interval_seconds: u32,
    pub input_mode: InputMode,
    pub enable_prefilter: bool,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_gap_ms: Option<u64>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<String>,
}

/// Kinds of verification events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskStarted,
    CheckpointVerified,
    JobRestarted,
    JobError,
    TaskCompleted,
    TaskCancelled,
    TaskExpired,
    ChainReceipt,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskStarted => "task_started",
            Self::CheckpointVerified => "checkpoint_verified",
            Self::JobRestarted => "job_restarted",
            Self::JobError => "job_error",
            Self::TaskCompleted => "task_completed",
            Self::TaskCancelled => "task_cancelled",
            Self::TaskExpired => "task_expired",
            Self::ChainReceipt => "chain_receipt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task_started" => Some(Self::TaskStarted),
            "checkpoint_verified" => Some(Self::CheckpointVerified),
            "job_restarted" => Some(Self::JobRestarted),
            "job_error" => Some(Self::JobError),
            "task_completed" => Some(Self::TaskCompleted),
            "task_cancelled" => Some(Self::TaskCancelled),
            "task_expired" => Some(Self::TaskExpired),
            "chain_receipt" => Some(Self::ChainReceipt),
            _ => None,
        }
    }
}

/// Immutable, append-only record of something that happened to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationEvent {
    pub event_id: Uuid,
    pub task_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<Uuid>,
    pub event_type: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

impl VerificationEvent {
    pub fn new(task_id: Uuid, event_type: EventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            task_id,
            job_id: None,
            checkpoint_id: None,
            event_type,
            confidence: None,
            explanation: None,
            metadata: serde_json::json!({}),
            created_at: now_string(),
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_checkpoint(mut self, checkpoint_id: Uuid) -> Self {
        self.checkpoint_id = Some(checkpoint_id);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Required-checkpoint progress for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequiredProgress {
    pub total: usize,
    pub verified: usize,
}

impl RequiredProgress {
    pub fn is_complete(&self) -> bool {
        self.verified >= self.total
    }
}

/// Verification data written when a checkpoint passes.
#[derive(Debug, Clone)]
pub struct CheckpointVerification {
    pub confidence: f64,
    pub explanation: String,
    pub evidence_frame: Option<String>,
    pub verified_at: String,
}

/// Task store trait - implemented by all storage backends.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Create a task and its checkpoints in `pending` status.
    async fn create_task(&self, new_task: NewTask) -> Result<Task, String>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, String>;

    /// List tasks, most recently updated first.
    async fn list_tasks(&self, limit: usize, offset: usize) -> Result<Vec<Task>, String>;

    /// Tasks currently in one of the given statuses.
    async fn tasks_with_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, String>;

    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), String>;

    /// Record the claiming operator and move the task to `awaiting_stream`.
    async fn mark_task_claimed(&self, id: Uuid, human_id: &str) -> Result<(), String>;

    /// Move the task to `streaming` and stamp `started_at`.
    async fn mark_task_streaming(&self, id: Uuid) -> Result<(), String>;

    /// Persist the verification hash and move the task to `completed`.
    ///
    /// Returns `false` (and changes nothing) when a hash is already set.
    async fn mark_task_completed(&self, id: Uuid, verification_hash: &str)
        -> Result<bool, String>;

    async fn set_ledger_receipt(&self, id: Uuid, receipt: &LedgerReceipt) -> Result<(), String>;

    /// Checkpoints for a task ordered by their ordering position.
    async fn get_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, String>;

    async fn get_unverified_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, String>;

    /// Mark a checkpoint verified. Returns `false` if it was already verified.
    async fn mark_checkpoint_verified(
        &self,
        checkpoint_id: Uuid,
        verification: &CheckpointVerification,
    ) -> Result<bool, String>;

    async fn required_progress(&self, task_id: Uuid) -> Result<RequiredProgress, String>;

    /// Drop stored evidence frames for checkpoints verified before `cutoff`.
    async fn clear_evidence_before(&self, cutoff: &str) -> Result<usize, String>;

    async fn insert_job(&self, job: &Job) -> Result<(), String>;

    /// Look up a job by its exact current identifier.
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, String>;

    /// Follow restart aliases from a possibly superseded identifier to the
    /// current one. Returns `None` if the identifier was never known.
    async fn resolve_job_id(&self, job_id: &str) -> Result<Option<String>, String>;

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        stop_reason: Option<&str>,
    ) -> Result<(), String>;

    /// Swap the job row over to `new_job_id` after a restart, bump the restart
    /// counter, record the gap and remember `old_job_id` as an alias.
    async fn record_job_restart(
        &self,
        old_job_id: &str,
        new_job_id: &str,
        gap_ms: u64,
    ) -> Result<Job, String>;

    async fn running_jobs_for_task(&self, task_id: Uuid) -> Result<Vec<Job>, String>;

    async fn all_running_jobs(&self) -> Result<Vec<Job>, String>;

    async fn count_running_jobs(&self) -> Result<usize, String>;

    /// Append an event. Events are never updated.
    async fn insert_event(&self, event: &VerificationEvent) -> Result<(), String>;

    /// Events for a task, newest first.
    async fn get_events(&self, task_id: Uuid, limit: usize)
        -> Result<Vec<VerificationEvent>, String>;
}

/// Task store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    Memory,
    #[default]
    Sqlite,
}

impl StoreType {
    /// Parse from environment variable value.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" => Self::Memory,
            "sqlite" | "db" => Self::Sqlite,
            _ => Self::default(),
        }
    }
}

/// Create a task store based on type and configuration.
pub async fn create_task_store(
    store_type: StoreType,
    db_path: PathBuf,
) -> Result<Box<dyn TaskStore>, String> {
    match store_type {
        StoreType::Memory => Ok(Box::new(InMemoryTaskStore::new())),
        StoreType::Sqlite => {
            let store = SqliteTaskStore::new(db_path).await?;
            Ok(Box::new(store))
        }
    }
}

/// Build the checkpoint rows for a new task, in submission order.
pub(crate) fn build_checkpoints(task_id: Uuid, defs: &[NewCheckpoint]) -> Vec<Checkpoint> {
    defs.iter()
        .map(|def| Checkpoint {
            id: Uuid::new_v4(),
            task_id,
            kind: def.kind,
            target: def.target.clone(),
            description: def.description.clone(),
            confidence_threshold: def.confidence_threshold,
            required: def.required,
            ordering: def.ordering,
            verified: false,
            verified_at: None,
            confidence: None,
            explanation: None,
            evidence_frame: None,
        })
        .collect()
}

/// Build the task row for a new task.
pub(crate) fn build_task(new_task: &NewTask) -> Task {
    let id = Uuid::new_v4();
    let now = now_string();
    Task {
        id,
        agent_id: new_task.agent_id.clone(),
        description: new_task.description.clone(),
        title: new_task.title.clone(),
        webhook_url: new_task.webhook_url.clone(),
        status: TaskStatus::Pending,
        stream_url: format!(
            "{}/{}",
            new_task.stream_url_base.trim_end_matches('/'),
            id
        ),
        human_id: None,
        max_duration_seconds: new_task.max_duration_seconds,
        redaction_policy: new_task.redaction_policy,
        verification_hash: None,
        ledger_receipt: None,
        created_at: now.clone(),
        updated_at: now,
        started_at: None,
        completed_at: None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn sample_new_task(checkpoints: usize) -> NewTask {
        NewTask {
            agent_id: "agent-1".to_string(),
            description: "Deliver the parcel to the front desk".to_string(),
            title: Some("Parcel drop".to_string()),
            webhook_url: "http://agent.invalid/hook".to_string(),
            stream_url_base: "rtsp://relay.invalid/live".to_string(),
            max_duration_seconds: 3600,
            redaction_policy: RedactionPolicy::default(),
            checkpoints: (0..checkpoints)
                .map(|i| NewCheckpoint {
                    kind: CheckpointType::Object,
                    target: format!("parcel #{}", i + 1),
                    description: None,
                    confidence_threshold: 0.8,
                    required: true,
                    ordering: i as i64,
                })
                .collect(),
        }
    }

    pub fn sample_job(task_id: Uuid, job_id: &str) -> Job {
        Job {
            job_id: job_id.to_string(),
            task_id,
            condition: "Is a parcel visible?".to_string(),
            interval_seconds: 15,
            input_mode: InputMode::Frames,
            enable_prefilter: true,
            status: JobStatus::Running,
            stop_reason: None,
            restart_count: 0,
            last_restart_at: None,
            last_restart_gap_ms: None,
            started_at: now_string(),
            stopped_at: None,
        }
    }

    /// Behaviour shared by every backend.
    pub async fn exercise_store(store: &dyn TaskStore) {
        let task = store.create_task(sample_new_task(2)).await.expect("create");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.stream_url.ends_with(&task.id.to_string()));

        let checkpoints = store.get_checkpoints(task.id).await.expect("checkpoints");
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].target, "parcel #1");

        let verification = CheckpointVerification {
            confidence: 0.9,
            explanation: "parcel on desk".to_string(),
            evidence_frame: Some("frame".to_string()),
            verified_at: now_string(),
        };
        assert!(store
            .mark_checkpoint_verified(checkpoints[0].id, &verification)
            .await
            .expect("verify"));
        // A second verification of the same checkpoint is refused.
        assert!(!store
            .mark_checkpoint_verified(checkpoints[0].id, &verification)
            .await
            .expect("verify again"));

        let progress = store.required_progress(task.id).await.expect("progress");
        assert_eq!(progress, RequiredProgress { total: 2, verified: 1 });
        assert_eq!(
            store.get_unverified_checkpoints(task.id).await.unwrap().len(),
            1
        );

        store.insert_job(&sample_job(task.id, "job-a")).await.unwrap();
        assert_eq!(store.count_running_jobs().await.unwrap(), 1);

        store
            .update_job_status("job-a", JobStatus::Stopped, Some("max_duration_reached"))
            .await
            .unwrap();
        assert_eq!(store.count_running_jobs().await.unwrap(), 0);

        let restarted = store.record_job_restart("job-a", "job-b", 120).await.unwrap();
        assert_eq!(restarted.job_id, "job-b");
        assert_eq!(restarted.status, JobStatus::Running);
        assert_eq!(restarted.restart_count, 1);
        assert_eq!(restarted.last_restart_gap_ms, Some(120));
        assert!(store.get_job("job-a").await.unwrap().is_none());
        assert_eq!(
            store.resolve_job_id("job-a").await.unwrap().as_deref(),
            Some("job-b")
        );
        assert_eq!(
            store.resolve_job_id("job-b").await.unwrap().as_deref(),
            Some("job-b")
        );
        assert!(store.resolve_job_id("nope").await.unwrap().is_none());

        store.record_job_restart("job-b", "job-c", 80).await.unwrap();
        assert_eq!(
            store.resolve_job_id("job-a").await.unwrap().as_deref(),
            Some("job-c")
        );

        assert!(store.mark_task_completed(task.id, "abc").await.unwrap());
        assert!(!store.mark_task_completed(task.id, "def").await.unwrap());
        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.verification_hash.as_deref(), Some("abc"));

        let event = VerificationEvent::new(task.id, EventKind::TaskCompleted)
            .with_explanation("done")
            .with_metadata(serde_json::json!({ "verification_hash": "abc" }));
        store.insert_event(&event).await.unwrap();
        let events = store.get_events(task.id, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventKind::TaskCompleted);
        assert_eq!(events[0].metadata["verification_hash"], "abc");

        let cleared = store.clear_evidence_before("9999-01-01T00:00:00Z").await.unwrap();
        assert_eq!(cleared, 1);
        let checkpoints = store.get_checkpoints(task.id).await.unwrap();
        assert!(checkpoints[0].evidence_frame.is_none());
        assert!(checkpoints[0].verified);
    }

    #[tokio::test]
    async fn in_memory_store_behaviour() {
        exercise_store(&InMemoryTaskStore::new()).await;
    }

    #[test]
    fn task_status_round_trips_through_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::AwaitingStream,
            TaskStatus::Streaming,
            TaskStatus::Verifying,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Expired,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert!(TaskStatus::Verifying.is_monitoring());
        assert!(!TaskStatus::AwaitingStream.is_monitoring());
        assert!(TaskStatus::Expired.is_terminal());
    }
}
