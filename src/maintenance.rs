//! Periodic housekeeping: task expiry and evidence retention.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_tasks: usize,
    pub cleared_frames: usize,
}

pub struct Maintenance {
    orchestrator: Arc<Orchestrator>,
    frame_retention: Duration,
}

impl Maintenance {
    pub fn new(orchestrator: Arc<Orchestrator>, frame_retention: Duration) -> Self {
        Self {
            orchestrator,
            frame_retention,
        }
    }

    pub async fn run_once(&self) -> MaintenanceReport {
        let now = Utc::now();
        let mut report = MaintenanceReport::default();

        match self.orchestrator.expire_overdue_tasks(now).await {
            Ok(n) => report.expired_tasks = n,
            Err(e) => tracing::warn!(error = %e, "Task expiry pass failed"),
        }

        let retention = chrono::Duration::from_std(self.frame_retention)
            .unwrap_or_else(|_| chrono::Duration::minutes(60));
        let cutoff = (now - retention).to_rfc3339();
        match self.orchestrator.store().clear_evidence_before(&cutoff).await {
            Ok(n) => report.cleared_frames = n,
            Err(e) => tracing::warn!(error = %e, "Evidence retention pass failed"),
        }

        if report != MaintenanceReport::default() {
            tracing::info!(
                expired_tasks = report.expired_tasks,
                cleared_frames = report.cleared_frames,
                "Maintenance pass finished"
            );
        }
        report
    }

    pub fn spawn(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::{harness, streaming_task};
    use crate::webhooks::WebhookEvent;

    #[tokio::test]
    async fn retention_clears_old_evidence_frames() {
        let h = harness();
        let (task, job) = streaming_task(&h, &[("object", "parcel", 0.8)]).await;
        h.orchestrator
            .handle_webhook(WebhookEvent::LiveMonitorTriggered {
                job_id: job.job_id.clone(),
                timestamp: "t".to_string(),
                explanation: "YES".to_string(),
                frame_b64: Some("ZnJhbWU=".to_string()),
                condition: None,
                check_number: None,
            })
            .await
            .unwrap();
        let checkpoints = h.store.get_checkpoints(task.id).await.unwrap();
        assert_eq!(checkpoints[0].evidence_frame.as_deref(), Some("ZnJhbWU="));

        let keep = Maintenance::new(h.orchestrator.clone(), Duration::from_secs(3600));
        assert_eq!(keep.run_once().await.cleared_frames, 0);

        let purge = Maintenance::new(h.orchestrator.clone(), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = purge.run_once().await;
        assert_eq!(report.cleared_frames, 1);
        let checkpoints = h.store.get_checkpoints(task.id).await.unwrap();
        assert!(checkpoints[0].evidence_frame.is_none());
        assert!(checkpoints[0].verified);
    }
}
