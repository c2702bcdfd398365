//! Test doubles for the external collaborators.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::delivery::{DeliveryError, DeliveryPayload, EventDelivery};
use crate::evidence::{FrameRedactor, RedactionError, RedactionOutcome};
use crate::ledger::{Ledger, LedgerError, LedgerReceipt};
use crate::monitor::{
    MonitorError, MonitorRequest, MonitorService, RemoteJobState, RemoteJobStatus, StopReason,
};
use crate::store::RedactionPolicy;

/// Monitor service that hands out `job-N` identifiers.
#[derive(Default)]
pub struct FakeMonitor {
    next_id: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_cancel: AtomicBool,
    started: Mutex<Vec<(String, MonitorRequest)>>,
    cancelled: Mutex<Vec<String>>,
    statuses: Mutex<HashMap<String, RemoteJobStatus>>,
    missing: Mutex<HashSet<String>>,
    start_delay: Mutex<Option<Duration>>,
}

impl FakeMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = Some(delay);
    }

    /// Make `job_status` report the job as stopped.
    pub fn report_stopped(&self, job_id: &str, reason: StopReason) {
        self.report_state(job_id, RemoteJobState::Stopped, Some(reason));
    }

    pub fn report_state(&self, job_id: &str, state: RemoteJobState, reason: Option<StopReason>) {
        self.statuses.lock().unwrap().insert(
            job_id.to_string(),
            RemoteJobStatus {
                job_id: job_id.to_string(),
                status: state,
                stop_reason: reason,
                checks_performed: None,
                triggers_fired: None,
            },
        );
    }

    /// Make `job_status` fail for this job.
    pub fn forget(&self, job_id: &str) {
        self.missing.lock().unwrap().insert(job_id.to_string());
    }

    pub fn started(&self) -> Vec<(String, MonitorRequest)> {
        self.started.lock().unwrap().clone()
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl MonitorService for FakeMonitor {
    async fn start_monitor(&self, request: &MonitorRequest) -> Result<String, MonitorError> {
        let delay = *self.start_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(MonitorError::Rejected("fake monitor refused".to_string()));
        }
        let id = format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.started
            .lock()
            .unwrap()
            .push((id.clone(), request.clone()));
        Ok(id)
    }

    async fn job_status(&self, job_id: &str) -> Result<RemoteJobStatus, MonitorError> {
        if self.missing.lock().unwrap().contains(job_id) {
            return Err(MonitorError::Api {
                status: 404,
                path: format!("/jobs/{}", job_id),
                body: "not found".to_string(),
            });
        }
        if let Some(status) = self.statuses.lock().unwrap().get(job_id) {
            return Ok(status.clone());
        }
        Ok(RemoteJobStatus {
            job_id: job_id.to_string(),
            status: RemoteJobState::Running,
            stop_reason: None,
            checks_performed: None,
            triggers_fired: None,
        })
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), MonitorError> {
        self.cancelled.lock().unwrap().push(job_id.to_string());
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(MonitorError::Transport("connection reset".to_string()));
        }
        Ok(())
    }
}

/// Delivery that records every payload instead of sending it.
#[derive(Default)]
pub struct RecordingDelivery {
    delivered: Mutex<Vec<(String, DeliveryPayload)>>,
}

impl RecordingDelivery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn payloads(&self) -> Vec<DeliveryPayload> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.payloads()
            .iter()
            .map(|p| p.event_type.as_str())
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

#[async_trait]
impl EventDelivery for RecordingDelivery {
    async fn deliver(
        &self,
        destination: &str,
        payload: &DeliveryPayload,
    ) -> Result<(), DeliveryError> {
        self.delivered
            .lock()
            .unwrap()
            .push((destination.to_string(), payload.clone()));
        Ok(())
    }
}

/// Ledger that fails a fixed number of calls, or never answers.
pub struct FlakyLedger {
    failures: usize,
    hang: bool,
    attempts: AtomicUsize,
}

impl FlakyLedger {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures,
            hang: false,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn hanging() -> Self {
        Self {
            failures: 0,
            hang: true,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ledger for FlakyLedger {
    async fn record(
        &self,
        task_id: Uuid,
        _verification_hash: &str,
        _checkpoint_count: usize,
    ) -> Result<LedgerReceipt, LedgerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if attempt <= self.failures {
            return Err(LedgerError::Transport("ledger unavailable".to_string()));
        }
        Ok(LedgerReceipt {
            reference: format!("tx-{}-{}", task_id, attempt),
            sequence: attempt as u64,
            lookup_url: format!("https://ledger.invalid/tx/{}", attempt),
        })
    }
}

pub enum StubRedactor {
    Blur,
    Drop,
    Fail,
}

#[async_trait]
impl FrameRedactor for StubRedactor {
    async fn redact(
        &self,
        frame_b64: &str,
        _policy: &RedactionPolicy,
    ) -> Result<RedactionOutcome, RedactionError> {
        match self {
            Self::Blur => Ok(RedactionOutcome {
                redacted: true,
                dropped: false,
                frame_b64: Some(format!("blurred:{}", frame_b64)),
            }),
            Self::Drop => Ok(RedactionOutcome {
                redacted: false,
                dropped: true,
                frame_b64: None,
            }),
            Self::Fail => Err(RedactionError::Status(503)),
        }
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
