//! Task verification state machine.
//!
//! ```text
//! pending -> awaiting_stream -> streaming -> verifying -> completed
//!                 (cancelled / expired / failed from any active state)
//! ```
//!
//! All mutations of one task are serialized through a per-task async lock and
//! go straight to the store; nothing is cached between calls. Webhook
//! processing, heartbeat sweeps and HTTP requests all enter here.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::checkpoints::{self, CheckpointType, EvaluatorError, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::delivery::{self, DeliveryPayload, EventDelivery};
use crate::evidence::EvidenceCapture;
use crate::jobs::{JobError, JobRegistry};
use crate::monitor::{InputMode, RemoteJobState, StopReason};
use crate::settlement::{verification_hash, Settlement};
use crate::store::{
    now_string, Checkpoint, CheckpointVerification, EventKind, Job, JobStatus, NewCheckpoint,
    NewTask, RedactionPolicy, Task, TaskStatus, TaskStore, VerificationEvent,
};
use crate::webhooks::WebhookEvent;

pub const MIN_TASK_DURATION_SECONDS: u64 = 60;
pub const MAX_TASK_DURATION_SECONDS: u64 = 86_400;

/// Checkpoint as submitted by an agent.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointInput {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub confidence_threshold: Option<f64>,
    #[serde(default)]
    pub required: Option<bool>,
    #[serde(default)]
    pub ordering: Option<i64>,
}

/// Task as submitted by an agent.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub agent_id: String,
    pub description: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Destination for verification events
    pub webhook_url: String,
    #[serde(default)]
    pub max_duration_seconds: Option<u64>,
    #[serde(default)]
    pub redaction_policy: Option<RedactionPolicy>,
    pub checkpoints: Vec<CheckpointInput>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Per-task stream references are `{base}/{task_id}`
    pub stream_relay_base_url: String,
    pub default_max_duration_seconds: u64,
    pub interval_seconds: u32,
    pub input_mode: InputMode,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            stream_relay_base_url: "rtsp://localhost:8554/live".to_string(),
            default_max_duration_seconds: 3600,
            interval_seconds: 15,
            input_mode: InputMode::Frames,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Task is {from}, cannot move to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task {0} has no unverified checkpoints")]
    NoUnverifiedCheckpoints(Uuid),

    #[error("Invalid task: {0}")]
    Validation(String),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Condition(#[from] EvaluatorError),

    #[error("Store error: {0}")]
    Store(String),
}

type Result<T> = std::result::Result<T, OrchestratorError>;

/// Check a submission and turn it into a store-ready task.
pub fn validate_request(
    req: CreateTaskRequest,
    settings: &OrchestratorSettings,
) -> std::result::Result<NewTask, String> {
    if req.agent_id.trim().is_empty() {
        return Err("agent_id is required".to_string());
    }
    if req.description.trim().is_empty() {
        return Err("description is required".to_string());
    }

    let destination =
        url::Url::parse(&req.webhook_url).map_err(|e| format!("webhook_url is invalid: {}", e))?;
    if !matches!(destination.scheme(), "http" | "https") || destination.host_str().is_none() {
        return Err("webhook_url must be an absolute http(s) URL".to_string());
    }

    if req.checkpoints.is_empty() {
        return Err("at least one checkpoint is required".to_string());
    }

    let max_duration_seconds = req
        .max_duration_seconds
        .unwrap_or(settings.default_max_duration_seconds);
    if !(MIN_TASK_DURATION_SECONDS..=MAX_TASK_DURATION_SECONDS).contains(&max_duration_seconds) {
        return Err(format!(
            "max_duration_seconds must be between {} and {}",
            MIN_TASK_DURATION_SECONDS, MAX_TASK_DURATION_SECONDS
        ));
    }

    let mut checkpoints = Vec::with_capacity(req.checkpoints.len());
    for (i, input) in req.checkpoints.into_iter().enumerate() {
        let kind = CheckpointType::parse(input.kind.trim())
            .ok_or_else(|| format!("checkpoint {}: unknown type '{}'", i + 1, input.kind))?;
        if !kind.is_available() {
            return Err(format!(
                "checkpoint {}: type '{}' is not available",
                i + 1,
                kind
            ));
        }
        let target = input.target.trim();
        if target.is_empty() {
            return Err(format!("checkpoint {}: target is required", i + 1));
        }
        let confidence_threshold = input
            .confidence_threshold
            .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD);
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(format!(
                "checkpoint {}: confidence_threshold must be within [0, 1]",
                i + 1
            ));
        }
        checkpoints.push(NewCheckpoint {
            kind,
            target: target.to_string(),
            description: input.description,
            confidence_threshold,
            required: input.required.unwrap_or(true),
            ordering: input.ordering.unwrap_or(i as i64),
        });
    }

    Ok(NewTask {
        agent_id: req.agent_id.trim().to_string(),
        description: req.description.trim().to_string(),
        title: req.title.filter(|t| !t.trim().is_empty()),
        webhook_url: req.webhook_url,
        stream_url_base: settings.stream_relay_base_url.clone(),
        max_duration_seconds,
        redaction_policy: req.redaction_policy.unwrap_or_default(),
        checkpoints,
    })
}

/// Record an event and, for destination-facing kinds, deliver it in the
/// background. Delivery failures are logged only.
async fn emit_event(
    store: &Arc<dyn TaskStore>,
    delivery: &Arc<dyn EventDelivery>,
    destination: &str,
    event: VerificationEvent,
) {
    if let Err(e) = store.insert_event(&event).await {
        tracing::error!(
            task_id = %event.task_id,
            event_type = event.event_type.as_str(),
            error = %e,
            "Failed to record verification event"
        );
    }
    if !delivery::is_delivered(event.event_type) {
        return;
    }

    let payload = DeliveryPayload::from_event(&event);
    let delivery = Arc::clone(delivery);
    let destination = destination.to_string();
    tokio::spawn(async move {
        if let Err(e) = delivery.deliver(&destination, &payload).await {
            tracing::warn!(
                task_id = %payload.task_id,
                event_type = payload.event_type.as_str(),
                error = %e,
                "Event delivery failed"
            );
        }
    });
}

fn is_overdue(task: &Task, now: DateTime<Utc>) -> bool {
    let Some(started_at) = task.started_at.as_deref() else {
        return false;
    };
    match DateTime::parse_from_rfc3339(started_at) {
        Ok(started) => {
            let deadline =
                started.with_timezone(&Utc) + chrono::Duration::seconds(task.max_duration_seconds as i64);
            deadline <= now
        }
        Err(_) => false,
    }
}

pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    jobs: JobRegistry,
    delivery: Arc<dyn EventDelivery>,
    settlement: Settlement,
    evidence: EvidenceCapture,
    settings: OrchestratorSettings,
    task_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        jobs: JobRegistry,
        delivery: Arc<dyn EventDelivery>,
        settlement: Settlement,
        evidence: EvidenceCapture,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            jobs,
            delivery,
            settlement,
            evidence,
            settings,
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Per-task mutex. Entries live as long as the orchestrator so every
    /// caller for a task always shares one mutex.
    fn task_lock(&self, task_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.task_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(task_id).or_default())
    }

    async fn load_task(&self, task_id: Uuid) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await
            .map_err(OrchestratorError::Store)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Task {}", task_id)))
    }

    async fn emit(&self, task: &Task, event: VerificationEvent) {
        emit_event(&self.store, &self.delivery, &task.webhook_url, event).await;
    }

    // ---------------------------------------------------------------------
    // Task lifecycle
    // ---------------------------------------------------------------------

    pub async fn create_task(&self, req: CreateTaskRequest) -> Result<Task> {
        let new_task = validate_request(req, &self.settings).map_err(OrchestratorError::Validation)?;
        let checkpoints = new_task.checkpoints.len();
        let task = self
            .store
            .create_task(new_task)
            .await
            .map_err(OrchestratorError::Store)?;
        tracing::info!(task_id = %task.id, agent_id = %task.agent_id, checkpoints, "Task created");
        Ok(task)
    }

    /// An operator takes the task. Only pending tasks can be claimed.
    pub async fn claim_task(&self, task_id: Uuid, human_id: &str) -> Result<Task> {
        let human_id = human_id.trim();
        if human_id.is_empty() {
            return Err(OrchestratorError::Validation("human_id is required".to_string()));
        }

        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.load_task(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(OrchestratorError::InvalidTransition {
                from: task.status,
                to: TaskStatus::AwaitingStream,
            });
        }
        self.store
            .mark_task_claimed(task_id, human_id)
            .await
            .map_err(OrchestratorError::Store)?;
        tracing::info!(task_id = %task_id, human_id = %human_id, "Task claimed");
        self.load_task(task_id).await
    }

    /// The stream is connected: start the monitoring job.
    ///
    /// Nothing changes when the task has no unverified checkpoints or the
    /// job ceiling is reached.
    pub async fn start_streaming(&self, task_id: Uuid) -> Result<Job> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.load_task(task_id).await?;
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::AwaitingStream) {
            return Err(OrchestratorError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Streaming,
            });
        }

        let unverified = self
            .store
            .get_unverified_checkpoints(task_id)
            .await
            .map_err(OrchestratorError::Store)?;
        if unverified.is_empty() {
            return Err(OrchestratorError::NoUnverifiedCheckpoints(task_id));
        }

        let condition = checkpoints::build_condition(&unverified)?;
        let job = self
            .jobs
            .start(
                &task,
                condition,
                self.settings.interval_seconds,
                self.settings.input_mode,
            )
            .await?;

        self.store
            .mark_task_streaming(task_id)
            .await
            .map_err(OrchestratorError::Store)?;

        let event = VerificationEvent::new(task_id, EventKind::TaskStarted)
            .with_job(job.job_id.clone())
            .with_explanation("Streaming started, monitoring checkpoints")
            .with_metadata(json!({ "checkpoints": unverified.len() }));
        self.emit(&task, event).await;

        tracing::info!(task_id = %task_id, job_id = %job.job_id, "Streaming started");
        Ok(job)
    }

    /// Stop monitoring and mark the task cancelled.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<Task> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let task = self.load_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Cancelled,
            });
        }

        self.jobs.cancel_all_for_task(task_id, "cancelled").await?;
        self.store
            .update_task_status(task_id, TaskStatus::Cancelled)
            .await
            .map_err(OrchestratorError::Store)?;

        let event =
            VerificationEvent::new(task_id, EventKind::TaskCancelled).with_explanation("Task cancelled");
        self.emit(&task, event).await;

        tracing::info!(task_id = %task_id, "Task cancelled");
        self.load_task(task_id).await
    }

    /// Expire monitoring tasks that outlived their maximum duration.
    pub async fn expire_overdue_tasks(&self, now: DateTime<Utc>) -> Result<usize> {
        let candidates = self
            .store
            .tasks_with_status(&[TaskStatus::Streaming, TaskStatus::Verifying])
            .await
            .map_err(OrchestratorError::Store)?;

        let mut expired = 0;
        for candidate in candidates.into_iter().filter(|t| is_overdue(t, now)) {
            let lock = self.task_lock(candidate.id);
            let _guard = lock.lock().await;

            let task = self.load_task(candidate.id).await?;
            if !task.status.is_monitoring() || !is_overdue(&task, now) {
                continue;
            }

            self.jobs.cancel_all_for_task(task.id, "task_expired").await?;
            self.store
                .update_task_status(task.id, TaskStatus::Expired)
                .await
                .map_err(OrchestratorError::Store)?;

            let event = VerificationEvent::new(task.id, EventKind::TaskExpired).with_explanation(
                format!(
                    "Task exceeded its maximum duration of {}s",
                    task.max_duration_seconds
                ),
            );
            self.emit(&task, event).await;

            tracing::info!(task_id = %task.id, "Task expired");
            expired += 1;
        }
        Ok(expired)
    }

    // ---------------------------------------------------------------------
    // Monitoring service events
    // ---------------------------------------------------------------------

    /// Process one deduplicated, authenticated webhook event.
    pub async fn handle_webhook(&self, event: WebhookEvent) -> Result<()> {
        match event {
            WebhookEvent::LiveMonitorTriggered {
                job_id,
                explanation,
                frame_b64,
                ..
            } => {
                self.handle_trigger(&job_id, &explanation, frame_b64.as_deref())
                    .await
            }
            WebhookEvent::JobStatus {
                job_id,
                status,
                stop_reason,
                ..
            } => match status.stop_reason(stop_reason) {
                Some(reason) => self.handle_job_stopped(&job_id, reason).await,
                None if status == RemoteJobState::Unknown => {
                    tracing::warn!(job_id = %job_id, "Unrecognised remote job status ignored");
                    Ok(())
                }
                None => {
                    tracing::debug!(job_id = %job_id, "Job reported running");
                    Ok(())
                }
            },
            WebhookEvent::JobError {
                job_id,
                error,
                recoverable,
                ..
            } => self.record_job_error(&job_id, &error, recoverable).await,
            WebhookEvent::LiveDigestReady { job_id, .. } => {
                tracing::debug!(job_id = %job_id, "Digest webhook ignored");
                Ok(())
            }
            WebhookEvent::Unknown => {
                tracing::warn!("Unknown webhook event type ignored");
                Ok(())
            }
        }
    }

    /// Checkpoints in the order they were numbered in `job`'s condition.
    async fn checkpoints_for_job(&self, task: &Task, job: &Job) -> Result<Vec<Checkpoint>> {
        let all = self
            .store
            .get_checkpoints(task.id)
            .await
            .map_err(OrchestratorError::Store)?;

        let ids = checkpoints::condition_checkpoint_ids(&job.condition);
        if ids.is_empty() {
            let single: Vec<Checkpoint> = all
                .iter()
                .filter(|cp| cp.kind.prompt_for(&cp.target) == job.condition)
                .take(1)
                .cloned()
                .collect();
            if !single.is_empty() {
                return Ok(single);
            }
            return Ok(all.into_iter().filter(|cp| !cp.verified).collect());
        }

        let mut by_id: HashMap<Uuid, Checkpoint> = all.into_iter().map(|cp| (cp.id, cp)).collect();
        let numbered: Vec<Checkpoint> = ids.iter().filter_map(|id| by_id.remove(id)).collect();
        if numbered.len() != ids.len() {
            tracing::warn!(
                task_id = %task.id,
                job_id = %job.job_id,
                tagged = ids.len(),
                found = numbered.len(),
                "Job condition references unknown checkpoints"
            );
        }
        Ok(numbered)
    }

    /// Evaluate a trigger against the checkpoints of the job's condition.
    pub async fn handle_trigger(
        &self,
        job_id: &str,
        explanation: &str,
        frame_b64: Option<&str>,
    ) -> Result<()> {
        let Some(job) = self.jobs.resolve(job_id).await? else {
            tracing::warn!(job_id = %job_id, "Trigger for unknown job");
            return Ok(());
        };

        let lock = self.task_lock(job.task_id);
        let _guard = lock.lock().await;

        let task = self.load_task(job.task_id).await?;
        if !task.status.is_monitoring() {
            tracing::debug!(
                task_id = %task.id,
                job_id = %job_id,
                status = %task.status,
                "Trigger for inactive task dropped"
            );
            return Ok(());
        }

        let numbered = self.checkpoints_for_job(&task, &job).await?;
        let results = checkpoints::parse_response(explanation, &numbered);

        for (checkpoint, result) in numbered.iter().zip(results) {
            if checkpoint.verified {
                continue;
            }
            if !result.passed || result.confidence < checkpoint.confidence_threshold {
                tracing::debug!(
                    task_id = %task.id,
                    checkpoint_id = %checkpoint.id,
                    passed = result.passed,
                    confidence = result.confidence,
                    threshold = checkpoint.confidence_threshold,
                    "Checkpoint not verified"
                );
                continue;
            }

            let evidence_frame = self
                .evidence
                .capture(frame_b64, &task.redaction_policy)
                .await;
            let evidence_stored = evidence_frame.is_some();
            let verification = CheckpointVerification {
                confidence: result.confidence,
                explanation: result.explanation.clone(),
                evidence_frame,
                verified_at: now_string(),
            };
            let newly_verified = self
                .store
                .mark_checkpoint_verified(checkpoint.id, &verification)
                .await
                .map_err(OrchestratorError::Store)?;
            if !newly_verified {
                continue;
            }

            let event = VerificationEvent::new(task.id, EventKind::CheckpointVerified)
                .with_job(job.job_id.clone())
                .with_checkpoint(checkpoint.id)
                .with_confidence(result.confidence)
                .with_explanation(result.explanation)
                .with_metadata(json!({
                    "checkpoint_type": checkpoint.kind.as_str(),
                    "checkpoint_target": checkpoint.target,
                    "evidence_stored": evidence_stored,
                }));
            self.emit(&task, event).await;

            tracing::info!(
                task_id = %task.id,
                checkpoint_id = %checkpoint.id,
                confidence = result.confidence,
                "Checkpoint verified"
            );
        }

        let progress = self
            .store
            .required_progress(task.id)
            .await
            .map_err(OrchestratorError::Store)?;
        if progress.is_complete() {
            self.complete_locked(&task).await?;
        } else if task.status == TaskStatus::Streaming {
            self.store
                .update_task_status(task.id, TaskStatus::Verifying)
                .await
                .map_err(OrchestratorError::Store)?;
        }
        Ok(())
    }

    /// The single place that decides what a stopped job means. Used by the
    /// webhook receiver and the heartbeat reconciler alike.
    ///
    /// Only the exact current identifier of a running job is acted on, so a
    /// repeated stop notice for a job that was already restarted or already
    /// handled does nothing.
    pub async fn handle_job_stopped(&self, job_id: &str, reason: StopReason) -> Result<()> {
        let Some(job) = self
            .store
            .get_job(job_id)
            .await
            .map_err(OrchestratorError::Store)?
        else {
            tracing::debug!(job_id = %job_id, "Stop notice for superseded or unknown job");
            return Ok(());
        };

        let lock = self.task_lock(job.task_id);
        let _guard = lock.lock().await;

        // Re-read under the lock: a concurrent notice may have handled it.
        let still_running = self
            .store
            .get_job(job_id)
            .await
            .map_err(OrchestratorError::Store)?
            .map(|j| j.status == JobStatus::Running)
            .unwrap_or(false);
        if !still_running {
            tracing::debug!(job_id = %job_id, "Stop notice for job that is no longer running");
            return Ok(());
        }

        self.store
            .update_job_status(job_id, JobStatus::Stopped, Some(reason.as_str()))
            .await
            .map_err(OrchestratorError::Store)?;
        tracing::info!(task_id = %job.task_id, job_id = %job_id, reason = %reason, "Job stopped");

        if !reason.is_restartable() {
            return Ok(());
        }

        let task = self.load_task(job.task_id).await?;
        if !task.status.is_monitoring() {
            tracing::debug!(task_id = %task.id, job_id = %job_id, "Task inactive; not restarting job");
            return Ok(());
        }

        match self.jobs.restart(job_id, &task).await {
            Ok(Some(outcome)) => {
                let event = VerificationEvent::new(task.id, EventKind::JobRestarted)
                    .with_job(outcome.job.job_id.clone())
                    .with_explanation(format!(
                        "Job restarted (gap: {}ms, restart #{})",
                        outcome.gap_ms, outcome.job.restart_count
                    ))
                    .with_metadata(json!({
                        "old_job_id": outcome.old_job_id,
                        "new_job_id": outcome.job.job_id,
                        "gap_ms": outcome.gap_ms,
                        "restart_count": outcome.job.restart_count,
                    }));
                self.emit(&task, event).await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e @ JobError::RestartFailed { .. }) => {
                let event = VerificationEvent::new(task.id, EventKind::JobError)
                    .with_job(job_id)
                    .with_explanation(e.to_string())
                    .with_metadata(json!({
                        "recoverable": false,
                        "stop_reason": crate::jobs::RESTART_FAILED,
                    }));
                self.emit(&task, event).await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record an error reported by the monitoring service.
    pub async fn record_job_error(&self, job_id: &str, error: &str, recoverable: bool) -> Result<()> {
        let Some(job) = self.jobs.resolve(job_id).await? else {
            tracing::warn!(job_id = %job_id, "Error report for unknown job");
            return Ok(());
        };
        let task = self.load_task(job.task_id).await?;

        tracing::warn!(
            task_id = %task.id,
            job_id = %job.job_id,
            recoverable,
            error = %error,
            "Monitoring service reported job error"
        );
        let event = VerificationEvent::new(task.id, EventKind::JobError)
            .with_job(job.job_id)
            .with_explanation(format!("Error: {}", error))
            .with_metadata(json!({ "recoverable": recoverable }));
        self.emit(&task, event).await;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Completion & settlement
    // ---------------------------------------------------------------------

    /// Finalize a task whose required checkpoints are all verified. The
    /// caller holds the task lock.
    async fn complete_locked(&self, task: &Task) -> Result<()> {
        self.jobs.cancel_all_for_task(task.id, "task_completed").await?;

        let checkpoints = self
            .store
            .get_checkpoints(task.id)
            .await
            .map_err(OrchestratorError::Store)?;
        let hash = verification_hash(&checkpoints);

        let first = self
            .store
            .mark_task_completed(task.id, &hash)
            .await
            .map_err(OrchestratorError::Store)?;
        if !first {
            tracing::debug!(task_id = %task.id, "Task already has a verification hash");
            return Ok(());
        }

        let verified_count = checkpoints.iter().filter(|cp| cp.verified).count();
        let receipt = match self.settlement.record(task.id, &hash, verified_count).await {
            Ok(receipt) => {
                if let Err(e) = self.store.set_ledger_receipt(task.id, &receipt).await {
                    tracing::error!(task_id = %task.id, error = %e, "Failed to store ledger receipt");
                }
                Some(receipt)
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %task.id,
                    error = %e,
                    "Ledger post failed; retrying in background"
                );
                None
            }
        };

        let mut metadata = json!({
            "verification_hash": hash,
            "checkpoints_verified": verified_count,
            "checkpoints_total": checkpoints.len(),
        });
        if let Some(receipt) = &receipt {
            metadata["ledger_receipt"] = json!(receipt);
        }
        let event = VerificationEvent::new(task.id, EventKind::TaskCompleted)
            .with_explanation("All required checkpoints verified")
            .with_metadata(metadata);
        self.emit(task, event).await;

        if receipt.is_none() {
            self.spawn_ledger_retries(task, hash.clone(), verified_count);
        }

        tracing::info!(task_id = %task.id, verification_hash = %hash, "Task completed");
        Ok(())
    }

    fn spawn_ledger_retries(&self, task: &Task, hash: String, verified_count: usize) {
        let store = Arc::clone(&self.store);
        let delivery = Arc::clone(&self.delivery);
        let destination = task.webhook_url.clone();
        let task_id = task.id;
        let event_hash = hash.clone();

        self.settlement
            .spawn_retries(task_id, hash, verified_count, move |receipt| async move {
                if let Err(e) = store.set_ledger_receipt(task_id, &receipt).await {
                    tracing::error!(task_id = %task_id, error = %e, "Failed to store ledger receipt");
                }
                let event = VerificationEvent::new(task_id, EventKind::ChainReceipt)
                    .with_explanation("Completion hash recorded on ledger")
                    .with_metadata(json!({
                        "verification_hash": event_hash,
                        "ledger_receipt": receipt,
                    }));
                emit_event(&store, &delivery, &destination, event).await;
            });
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task> {
        self.load_task(task_id).await
    }

    pub async fn list_tasks(&self, limit: usize, offset: usize) -> Result<Vec<Task>> {
        self.store
            .list_tasks(limit, offset)
            .await
            .map_err(OrchestratorError::Store)
    }

    pub async fn get_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>> {
        self.load_task(task_id).await?;
        self.store
            .get_checkpoints(task_id)
            .await
            .map_err(OrchestratorError::Store)
    }

    pub async fn get_events(&self, task_id: Uuid, limit: usize) -> Result<Vec<VerificationEvent>> {
        self.load_task(task_id).await?;
        self.store
            .get_events(task_id, limit)
            .await
            .map_err(OrchestratorError::Store)
    }

    pub async fn running_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.running_jobs().await?)
    }
}
