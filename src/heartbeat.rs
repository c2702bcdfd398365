//! Heartbeat reconciler.
//!
//! Polls the monitoring service for every job believed to be running and
//! feeds jobs it reports as stopped into the same stopped-job path the
//! webhook receiver uses. Covers webhooks that were lost or never sent.

use std::sync::Arc;
use std::time::Duration;

use crate::monitor::MonitorService;
use crate::orchestrator::Orchestrator;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub stopped: usize,
    pub failed: usize,
}

pub struct HeartbeatReconciler {
    orchestrator: Arc<Orchestrator>,
    monitor: Arc<dyn MonitorService>,
}

impl HeartbeatReconciler {
    pub fn new(orchestrator: Arc<Orchestrator>, monitor: Arc<dyn MonitorService>) -> Self {
        Self {
            orchestrator,
            monitor,
        }
    }

    /// Check every running job once. Per-job failures are logged and
    /// counted; they never end the sweep early.
    pub async fn sweep(&self) -> SweepReport {
        let jobs = match self.orchestrator.running_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "Heartbeat could not list running jobs");
                return SweepReport::default();
            }
        };

        let mut report = SweepReport::default();
        for job in jobs {
            report.checked += 1;
            let status = match self.monitor.job_status(&job.job_id).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::debug!(job_id = %job.job_id, error = %e, "Heartbeat check failed");
                    report.failed += 1;
                    continue;
                }
            };
            let Some(reason) = status.status.stop_reason(status.stop_reason) else {
                continue;
            };
            tracing::info!(
                task_id = %job.task_id,
                job_id = %job.job_id,
                reason = %reason,
                "Heartbeat detected stopped job"
            );
            report.stopped += 1;
            if let Err(e) = self.orchestrator.handle_job_stopped(&job.job_id, reason).await {
                tracing::warn!(job_id = %job.job_id, error = %e, "Heartbeat stop handling failed");
                report.failed += 1;
            }
        }
        report
    }

    /// Run sweeps forever on a fixed interval.
    pub fn spawn(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            tracing::info!(interval_secs = every.as_secs(), "Heartbeat reconciler started");
            loop {
                ticker.tick().await;
                let report = self.sweep().await;
                if report.checked > 0 {
                    tracing::debug!(
                        checked = report.checked,
                        stopped = report.stopped,
                        failed = report.failed,
                        "Heartbeat sweep finished"
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{RemoteJobState, StopReason};
    use crate::orchestrator::tests::{harness, streaming_task};
    use crate::store::{EventKind, JobStatus};

    #[tokio::test]
    async fn sweep_restarts_jobs_stopped_at_duration_cap() {
        let h = harness();
        let (task, job) = streaming_task(&h, &[("object", "parcel", 0.8)]).await;
        h.monitor
            .report_stopped(&job.job_id, StopReason::MaxDurationReached);

        let reconciler = HeartbeatReconciler::new(h.orchestrator.clone(), h.monitor.clone());
        let report = reconciler.sweep().await;
        assert_eq!(report, SweepReport { checked: 1, stopped: 1, failed: 0 });
        assert_eq!(h.monitor.started_count(), 2);

        // The replacement job reports running; nothing else happens.
        let report = reconciler.sweep().await;
        assert_eq!(report, SweepReport { checked: 1, stopped: 0, failed: 0 });

        let events = h.store.get_events(task.id, 10).await.unwrap();
        assert_eq!(
            events
                .iter()
                .filter(|e| e.event_type == EventKind::JobRestarted)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn per_job_failures_do_not_abort_sweep() {
        let h = harness();
        let (_a, job_a) = streaming_task(&h, &[("object", "parcel", 0.8)]).await;
        let (_b, job_b) = streaming_task(&h, &[("object", "box", 0.8)]).await;
        h.monitor.forget(&job_a.job_id);
        h.monitor.report_stopped(&job_b.job_id, StopReason::StreamOffline);

        let reconciler = HeartbeatReconciler::new(h.orchestrator.clone(), h.monitor.clone());
        let report = reconciler.sweep().await;
        assert_eq!(report, SweepReport { checked: 2, stopped: 1, failed: 1 });

        let row = h.store.get_job(&job_b.job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Stopped);
        let row = h.store.get_job(&job_a.job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn remote_error_state_stops_job_without_restart() {
        let h = harness();
        let (_task, job) = streaming_task(&h, &[("object", "parcel", 0.8)]).await;
        h.monitor.report_state(&job.job_id, RemoteJobState::Error, None);

        let reconciler = HeartbeatReconciler::new(h.orchestrator.clone(), h.monitor.clone());
        let report = reconciler.sweep().await;
        assert_eq!(report, SweepReport { checked: 1, stopped: 1, failed: 0 });
        assert_eq!(h.monitor.started_count(), 1);

        let row = h.store.get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Stopped);
        assert_eq!(row.stop_reason.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn unrecognised_remote_state_leaves_job_running() {
        let h = harness();
        let (_task, job) = streaming_task(&h, &[("object", "parcel", 0.8)]).await;
        h.monitor
            .report_state(&job.job_id, RemoteJobState::Unknown, Some(StopReason::Cancelled));

        let reconciler = HeartbeatReconciler::new(h.orchestrator.clone(), h.monitor.clone());
        let report = reconciler.sweep().await;
        assert_eq!(report, SweepReport { checked: 1, stopped: 0, failed: 0 });

        let row = h.store.get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Running);
    }
}
