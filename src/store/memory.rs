//! In-memory task store (non-persistent).

use super::{
    build_checkpoints, build_task, now_string, Checkpoint, CheckpointVerification, Job,
    JobStatus, NewTask, RequiredProgress, Task, TaskStatus, TaskStore, VerificationEvent,
};
use crate::ledger::LedgerReceipt;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    tasks: HashMap<Uuid, Task>,
    checkpoints: HashMap<Uuid, Checkpoint>,
    jobs: HashMap<String, Job>,
    aliases: HashMap<String, String>,
    events: Vec<VerificationEvent>,
}

#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn touch(task: &mut Task) {
    task.updated_at = now_string();
}

fn sorted_checkpoints<'a>(
    tables: &'a Tables,
    task_id: Uuid,
) -> impl Iterator<Item = &'a Checkpoint> + 'a {
    let mut checkpoints: Vec<&Checkpoint> = tables
        .checkpoints
        .values()
        .filter(|cp| cp.task_id == task_id)
        .collect();
    checkpoints.sort_by(|a, b| a.ordering.cmp(&b.ordering).then(a.id.cmp(&b.id)));
    checkpoints.into_iter()
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn create_task(&self, new_task: NewTask) -> Result<Task, String> {
        let task = build_task(&new_task);
        let checkpoints = build_checkpoints(task.id, &new_task.checkpoints);
        let mut tables = self.tables.write().await;
        for cp in checkpoints {
            tables.checkpoints.insert(cp.id, cp);
        }
        tables.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, String> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, limit: usize, offset: usize) -> Result<Vec<Task>, String> {
        let mut tasks: Vec<Task> = self.tables.read().await.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(tasks.into_iter().skip(offset).take(limit).collect())
    }

    async fn tasks_with_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, String> {
        Ok(self
            .tables
            .read()
            .await
            .tasks
            .values()
            .filter(|t| statuses.contains(&t.status))
            .cloned()
            .collect())
    }

    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), String> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or_else(|| format!("Task {} not found", id))?;
        task.status = status;
        touch(task);
        Ok(())
    }

    async fn mark_task_claimed(&self, id: Uuid, human_id: &str) -> Result<(), String> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or_else(|| format!("Task {} not found", id))?;
        task.human_id = Some(human_id.to_string());
        task.status = TaskStatus::AwaitingStream;
        touch(task);
        Ok(())
    }

    async fn mark_task_streaming(&self, id: Uuid) -> Result<(), String> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or_else(|| format!("Task {} not found", id))?;
        task.status = TaskStatus::Streaming;
        task.started_at = Some(now_string());
        touch(task);
        Ok(())
    }

    async fn mark_task_completed(
        &self,
        id: Uuid,
        verification_hash: &str,
    ) -> Result<bool, String> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or_else(|| format!("Task {} not found", id))?;
        if task.verification_hash.is_some() {
            return Ok(false);
        }
        let now = now_string();
        task.verification_hash = Some(verification_hash.to_string());
        task.status = TaskStatus::Completed;
        task.completed_at = Some(now.clone());
        task.updated_at = now;
        Ok(true)
    }

    async fn set_ledger_receipt(&self, id: Uuid, receipt: &LedgerReceipt) -> Result<(), String> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or_else(|| format!("Task {} not found", id))?;
        task.ledger_receipt = Some(receipt.clone());
        touch(task);
        Ok(())
    }

    async fn get_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, String> {
        let tables = self.tables.read().await;
        Ok(sorted_checkpoints(&tables, task_id).cloned().collect())
    }

    async fn get_unverified_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, String> {
        let tables = self.tables.read().await;
        Ok(sorted_checkpoints(&tables, task_id)
            .filter(|cp| !cp.verified)
            .cloned()
            .collect())
    }

    async fn mark_checkpoint_verified(
        &self,
        checkpoint_id: Uuid,
        verification: &CheckpointVerification,
    ) -> Result<bool, String> {
        let mut tables = self.tables.write().await;
        let cp = tables
            .checkpoints
            .get_mut(&checkpoint_id)
            .ok_or_else(|| format!("Checkpoint {} not found", checkpoint_id))?;
        if cp.verified {
            return Ok(false);
        }
        cp.verified = true;
        cp.verified_at = Some(verification.verified_at.clone());
        cp.confidence = Some(verification.confidence);
        cp.explanation = Some(verification.explanation.clone());
        cp.evidence_frame = verification.evidence_frame.clone();
        Ok(true)
    }

    async fn required_progress(&self, task_id: Uuid) -> Result<RequiredProgress, String> {
        let tables = self.tables.read().await;
        let mut progress = RequiredProgress::default();
        for cp in tables
            .checkpoints
            .values()
            .filter(|cp| cp.task_id == task_id && cp.required)
        {
            progress.total += 1;
            if cp.verified {
                progress.verified += 1;
            }
        }
        Ok(progress)
    }

    async fn clear_evidence_before(&self, cutoff: &str) -> Result<usize, String> {
        let mut tables = self.tables.write().await;
        let mut cleared = 0;
        for cp in tables.checkpoints.values_mut() {
            let stale = cp
                .verified_at
                .as_deref()
                .map(|at| at < cutoff)
                .unwrap_or(false);
            if stale && cp.evidence_frame.is_some() {
                cp.evidence_frame = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn insert_job(&self, job: &Job) -> Result<(), String> {
        let mut tables = self.tables.write().await;
        if tables.jobs.contains_key(&job.job_id) {
            return Err(format!("Job {} already exists", job.job_id));
        }
        tables.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, String> {
        Ok(self.tables.read().await.jobs.get(job_id).cloned())
    }

    async fn resolve_job_id(&self, job_id: &str) -> Result<Option<String>, String> {
        let tables = self.tables.read().await;
        let mut current = job_id.to_string();
        // Alias chains are acyclic: every restart mints a fresh identifier.
        for _ in 0..=tables.aliases.len() {
            if tables.jobs.contains_key(&current) {
                return Ok(Some(current));
            }
            match tables.aliases.get(&current) {
                Some(next) => current = next.clone(),
                None => return Ok(None),
            }
        }
        Err(format!("Job alias cycle detected at {}", job_id))
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        stop_reason: Option<&str>,
    ) -> Result<(), String> {
        let mut tables = self.tables.write().await;
        let job = tables
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| format!("Job {} not found", job_id))?;
        job.status = status;
        job.stop_reason = stop_reason.map(|s| s.to_string());
        job.stopped_at = Some(now_string());
        Ok(())
    }

    async fn record_job_restart(
        &self,
        old_job_id: &str,
        new_job_id: &str,
        gap_ms: u64,
    ) -> Result<Job, String> {
        let mut tables = self.tables.write().await;
        let mut job = tables
            .jobs
            .remove(old_job_id)
            .ok_or_else(|| format!("Job {} not found", old_job_id))?;
        job.job_id = new_job_id.to_string();
        job.status = JobStatus::Running;
        job.stop_reason = None;
        job.stopped_at = None;
        job.restart_count += 1;
        job.last_restart_at = Some(now_string());
        job.last_restart_gap_ms = Some(gap_ms);
        tables.jobs.insert(job.job_id.clone(), job.clone());
        tables
            .aliases
            .insert(old_job_id.to_string(), new_job_id.to_string());
        Ok(job)
    }

    async fn running_jobs_for_task(&self, task_id: Uuid) -> Result<Vec<Job>, String> {
        Ok(self
            .tables
            .read()
            .await
            .jobs
            .values()
            .filter(|j| j.task_id == task_id && j.status == JobStatus::Running)
            .cloned()
            .collect())
    }

    async fn all_running_jobs(&self) -> Result<Vec<Job>, String> {
        Ok(self
            .tables
            .read()
            .await
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .cloned()
            .collect())
    }

    async fn count_running_jobs(&self) -> Result<usize, String> {
        Ok(self
            .tables
            .read()
            .await
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .count())
    }

    async fn insert_event(&self, event: &VerificationEvent) -> Result<(), String> {
        self.tables.write().await.events.push(event.clone());
        Ok(())
    }

    async fn get_events(
        &self,
        task_id: Uuid,
        limit: usize,
    ) -> Result<Vec<VerificationEvent>, String> {
        Ok(self
            .tables
            .read()
            .await
            .events
            .iter()
            .rev()
            .filter(|e| e.task_id == task_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
