//! Monitoring job registry.
//!
//! Starts, restarts and cancels jobs on the monitoring service and keeps the
//! local job rows in step. Admission control is a count of running job rows
//! taken at start time against a global ceiling; no slot is held for the
//! lifetime of a job, so two tasks starting at once near the ceiling can both
//! get through.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::monitor::{InputMode, MonitorError, MonitorRequest, MonitorService};
use crate::store::{now_string, Job, JobStatus, Task, TaskStore};

/// Stop reason recorded when a replacement job could not be started.
pub const RESTART_FAILED: &str = "restart_failed";

#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Cross-task ceiling on running jobs
    pub max_concurrent_jobs: usize,
    pub enable_prefilter: bool,
    /// Auto-stop requested from the monitoring service
    pub max_duration_seconds: u64,
    pub restart_gap_target: Duration,
    /// Where the monitoring service sends webhooks
    pub callback_url: String,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            enable_prefilter: true,
            max_duration_seconds: crate::monitor::DEFAULT_MAX_DURATION_SECONDS,
            restart_gap_target: Duration::from_millis(2000),
            callback_url: "http://localhost:3000/webhooks/monitor".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Maximum {ceiling} concurrent jobs reached ({running} running)")]
    AtCapacity { running: usize, ceiling: usize },

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("Restart of job {job_id} failed: {source}")]
    RestartFailed {
        job_id: String,
        #[source]
        source: MonitorError,
    },

    #[error("Store error: {0}")]
    Store(String),
}

/// Result of a successful restart.
#[derive(Debug, Clone)]
pub struct RestartOutcome {
    pub old_job_id: String,
    pub job: Job,
    pub gap_ms: u64,
}

pub struct JobRegistry {
    store: Arc<dyn TaskStore>,
    monitor: Arc<dyn MonitorService>,
    settings: JobSettings,
}

impl JobRegistry {
    pub fn new(
        store: Arc<dyn TaskStore>,
        monitor: Arc<dyn MonitorService>,
        settings: JobSettings,
    ) -> Self {
        Self {
            store,
            monitor,
            settings,
        }
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub fn monitor(&self) -> &Arc<dyn MonitorService> {
        &self.monitor
    }

    pub async fn count_running(&self) -> Result<usize, JobError> {
        self.store.count_running_jobs().await.map_err(JobError::Store)
    }

    fn request(&self, stream_url: &str, job: &Job) -> MonitorRequest {
        MonitorRequest {
            url: stream_url.to_string(),
            condition: job.condition.clone(),
            webhook_url: self.settings.callback_url.clone(),
            interval_seconds: job.interval_seconds,
            input_mode: job.input_mode,
            enable_prefilter: job.enable_prefilter,
            max_duration_seconds: self.settings.max_duration_seconds,
        }
    }

    /// Start a job for `task`, refusing when the ceiling is reached.
    pub async fn start(
        &self,
        task: &Task,
        condition: String,
        interval_seconds: u32,
        input_mode: InputMode,
    ) -> Result<Job, JobError> {
        let running = self.count_running().await?;
        if running >= self.settings.max_concurrent_jobs {
            tracing::warn!(
                task_id = %task.id,
                running,
                ceiling = self.settings.max_concurrent_jobs,
                "Job start refused: at capacity"
            );
            return Err(JobError::AtCapacity {
                running,
                ceiling: self.settings.max_concurrent_jobs,
            });
        }

        let mut job = Job {
            job_id: String::new(),
            task_id: task.id,
            condition,
            interval_seconds,
            input_mode,
            enable_prefilter: self.settings.enable_prefilter,
            status: JobStatus::Running,
            stop_reason: None,
            restart_count: 0,
            last_restart_at: None,
            last_restart_gap_ms: None,
            started_at: String::new(),
            stopped_at: None,
        };

        job.job_id = self
            .monitor
            .start_monitor(&self.request(&task.stream_url, &job))
            .await?;
        job.started_at = now_string();

        self.store.insert_job(&job).await.map_err(JobError::Store)?;
        tracing::info!(task_id = %task.id, job_id = %job.job_id, "Monitoring job started");
        Ok(job)
    }

    /// Replace a stopped job with an identical one.
    ///
    /// Returns `Ok(None)` when there is nothing to restart: the identifier is
    /// unknown (or already superseded) or the job is in the error state. On a
    /// failed start the job is moved to `error` / `restart_failed` and is not
    /// restarted again.
    pub async fn restart(
        &self,
        old_job_id: &str,
        task: &Task,
    ) -> Result<Option<RestartOutcome>, JobError> {
        let Some(job) = self
            .store
            .get_job(old_job_id)
            .await
            .map_err(JobError::Store)?
        else {
            return Ok(None);
        };
        if job.status == JobStatus::Error {
            tracing::debug!(job_id = %old_job_id, "Job is in error state; not restarting");
            return Ok(None);
        }

        let started = Instant::now();
        let new_job_id = match self
            .monitor
            .start_monitor(&self.request(&task.stream_url, &job))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(
                    task_id = %task.id,
                    job_id = %old_job_id,
                    error = %e,
                    "Job restart failed"
                );
                self.store
                    .update_job_status(old_job_id, JobStatus::Error, Some(RESTART_FAILED))
                    .await
                    .map_err(JobError::Store)?;
                return Err(JobError::RestartFailed {
                    job_id: old_job_id.to_string(),
                    source: e,
                });
            }
        };
        let gap_ms = started.elapsed().as_millis() as u64;

        let job = self
            .store
            .record_job_restart(old_job_id, &new_job_id, gap_ms)
            .await
            .map_err(JobError::Store)?;

        if Duration::from_millis(gap_ms) > self.settings.restart_gap_target {
            tracing::warn!(
                task_id = %task.id,
                old_job_id = %old_job_id,
                new_job_id = %new_job_id,
                gap_ms,
                target_ms = self.settings.restart_gap_target.as_millis() as u64,
                "Restart gap above target"
            );
        } else {
            tracing::info!(
                task_id = %task.id,
                old_job_id = %old_job_id,
                new_job_id = %new_job_id,
                gap_ms,
                restart_count = job.restart_count,
                "Job restarted"
            );
        }

        Ok(Some(RestartOutcome {
            old_job_id: old_job_id.to_string(),
            job,
            gap_ms,
        }))
    }

    /// Best-effort remote cancel; the local row is marked stopped regardless.
    pub async fn cancel(&self, job_id: &str, reason: &str) -> Result<(), JobError> {
        if let Err(e) = self.monitor.cancel_job(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to cancel remote job");
        }
        self.store
            .update_job_status(job_id, JobStatus::Stopped, Some(reason))
            .await
            .map_err(JobError::Store)
    }

    /// Cancel every running job of a task. Returns how many were stopped.
    pub async fn cancel_all_for_task(
        &self,
        task_id: uuid::Uuid,
        reason: &str,
    ) -> Result<usize, JobError> {
        let jobs = self
            .store
            .running_jobs_for_task(task_id)
            .await
            .map_err(JobError::Store)?;
        for job in &jobs {
            self.cancel(&job.job_id, reason).await?;
        }
        Ok(jobs.len())
    }

    /// Current job for a possibly superseded identifier.
    pub async fn resolve(&self, job_id: &str) -> Result<Option<Job>, JobError> {
        let Some(current) = self
            .store
            .resolve_job_id(job_id)
            .await
            .map_err(JobError::Store)?
        else {
            return Ok(None);
        };
        self.store.get_job(&current).await.map_err(JobError::Store)
    }

    pub async fn running_jobs(&self) -> Result<Vec<Job>, JobError> {
        self.store.all_running_jobs().await.map_err(JobError::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::sample_new_task;
    use crate::store::InMemoryTaskStore;
    use crate::testing::FakeMonitor;
    use std::sync::atomic::Ordering;

    async fn setup(ceiling: usize) -> (JobRegistry, Arc<dyn TaskStore>, Arc<FakeMonitor>, Task) {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let monitor = FakeMonitor::new();
        let registry = JobRegistry::new(
            store.clone(),
            monitor.clone(),
            JobSettings {
                max_concurrent_jobs: ceiling,
                ..JobSettings::default()
            },
        );
        let task = store.create_task(sample_new_task(1)).await.unwrap();
        (registry, store, monitor, task)
    }

    #[tokio::test]
    async fn start_is_refused_at_the_ceiling() {
        let (registry, _store, monitor, task) = setup(2).await;

        registry
            .start(&task, "c1".to_string(), 15, InputMode::Frames)
            .await
            .unwrap();
        // ceiling - 1 running: accepted
        registry
            .start(&task, "c2".to_string(), 15, InputMode::Frames)
            .await
            .unwrap();
        assert_eq!(registry.count_running().await.unwrap(), 2);

        let err = registry
            .start(&task, "c3".to_string(), 15, InputMode::Frames)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::AtCapacity { running: 2, ceiling: 2 }));
        assert_eq!(monitor.started_count(), 2);
    }

    #[tokio::test]
    async fn restart_preserves_parameters_and_records_gap() {
        let (registry, store, monitor, task) = setup(10).await;
        let job = registry
            .start(&task, "Is a parcel visible?".to_string(), 20, InputMode::Hybrid)
            .await
            .unwrap();
        store
            .update_job_status(&job.job_id, JobStatus::Stopped, Some("max_duration_reached"))
            .await
            .unwrap();

        let outcome = registry.restart(&job.job_id, &task).await.unwrap().unwrap();
        assert_ne!(outcome.job.job_id, job.job_id);
        assert_eq!(outcome.job.condition, job.condition);
        assert_eq!(outcome.job.interval_seconds, 20);
        assert_eq!(outcome.job.input_mode, InputMode::Hybrid);
        assert_eq!(outcome.job.enable_prefilter, job.enable_prefilter);
        assert_eq!(outcome.job.restart_count, 1);
        assert_eq!(outcome.job.last_restart_gap_ms, Some(outcome.gap_ms));

        let started = monitor.started();
        assert_eq!(started[0].1, started[1].1);

        let resolved = registry.resolve(&job.job_id).await.unwrap().unwrap();
        assert_eq!(resolved.job_id, outcome.job.job_id);
    }

    #[tokio::test]
    async fn failed_restart_leaves_job_in_error_and_is_not_retried() {
        let (registry, store, monitor, task) = setup(10).await;
        let job = registry
            .start(&task, "c".to_string(), 15, InputMode::Frames)
            .await
            .unwrap();
        monitor.set_fail_start(true);

        let err = registry.restart(&job.job_id, &task).await.unwrap_err();
        assert!(matches!(err, JobError::RestartFailed { .. }));

        let row = store.get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Error);
        assert_eq!(row.stop_reason.as_deref(), Some(RESTART_FAILED));

        monitor.set_fail_start(false);
        assert!(registry.restart(&job.job_id, &task).await.unwrap().is_none());
        assert_eq!(monitor.started_count(), 1);
    }

    #[tokio::test]
    async fn cancel_marks_stopped_even_when_remote_cancel_fails() {
        let (registry, store, monitor, task) = setup(10).await;
        let job = registry
            .start(&task, "c".to_string(), 15, InputMode::Frames)
            .await
            .unwrap();
        monitor.fail_cancel.store(true, Ordering::SeqCst);

        assert_eq!(
            registry.cancel_all_for_task(task.id, "cancelled").await.unwrap(),
            1
        );
        let row = store.get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Stopped);
        assert_eq!(row.stop_reason.as_deref(), Some("cancelled"));
        assert_eq!(monitor.cancelled(), vec![job.job_id.clone()]);
        assert_eq!(registry.count_running().await.unwrap(), 0);
    }
}
