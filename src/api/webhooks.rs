//! Inbound webhook endpoint for the monitoring service.
//!
//! Order of checks: signature (401), payload shape (400), duplicate (200,
//! nothing done). Accepted events are processed off the request path so the
//! service gets its acknowledgement immediately.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};

use futures::FutureExt;

use crate::orchestrator::OrchestratorError;
use crate::webhooks::{verify_signature, WebhookEnvelope, WebhookEvent, SIGNATURE_HEADER};

use super::routes::AppState;
use super::types::WebhookAck;

pub async fn receive_monitor_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, (StatusCode, String)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if !verify_signature(&body, signature, &state.config.monitor.webhook_secret) {
        tracing::warn!("Rejected webhook with invalid signature");
        return Err((StatusCode::UNAUTHORIZED, "Invalid signature".to_string()));
    }

    let envelope: WebhookEnvelope = serde_json::from_slice(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid webhook payload: {}", e)))?;
    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid {} payload: {}", envelope.event, e)))?;

    if state.tracker.is_duplicate(&envelope.idempotency_key()) {
        tracing::debug!(
            job_id = %envelope.job_id,
            event = %envelope.event,
            "Duplicate webhook ignored"
        );
        return Ok(Json(WebhookAck::duplicate()));
    }

    tracing::debug!(job_id = %envelope.job_id, event = %envelope.event, "Webhook accepted");
    let orchestrator = Arc::clone(&state.orchestrator);
    let name = event.name();
    spawn_guarded(envelope.job_id.clone(), name, async move {
        orchestrator.handle_webhook(event).await
    });

    Ok(Json(WebhookAck::accepted(&envelope.event)))
}

/// Run webhook processing after the acknowledgement. Errors and panics
/// are logged and go no further.
fn spawn_guarded<F>(job_id: String, event: &'static str, work: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = Result<(), OrchestratorError>> + Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job_id, event, error = %e, "Webhook processing failed");
            }
            Err(_) => {
                tracing::error!(job_id = %job_id, event, "Webhook processing panicked");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::tests::{app_state, app_state_with_secret};
    use crate::orchestrator::tests::streaming_task;
    use crate::store::{EventKind, TaskStatus};
    use crate::testing::eventually;
    use crate::webhooks::compute_signature;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn body(value: serde_json::Value) -> Bytes {
        Bytes::from(serde_json::to_vec(&value).unwrap())
    }

    fn signed(body: &Bytes, secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let sig = format!("sha256={}", compute_signature(body, secret));
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&sig).unwrap());
        headers
    }

    #[tokio::test]
    async fn bad_signature_is_unauthorized() {
        let (state, _h) = app_state_with_secret("s3cret");
        let payload = body(json!({"event": "live_digest_ready", "job_id": "job-1", "timestamp": "t1"}));

        let err = receive_monitor_webhook(State(state.clone()), signed(&payload, "other"), payload.clone())
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);

        let err = receive_monitor_webhook(State(state.clone()), HeaderMap::new(), payload.clone())
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);

        let ok = receive_monitor_webhook(State(state), signed(&payload, "s3cret"), payload)
            .await
            .unwrap();
        assert_eq!(ok.0, WebhookAck::accepted("live_digest_ready"));
    }

    #[tokio::test]
    async fn malformed_payload_is_bad_request() {
        let (state, _h) = app_state();
        let err = receive_monitor_webhook(State(state.clone()), HeaderMap::new(), Bytes::from_static(b"not json"))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let missing_fields = body(json!({"event": "live_monitor_triggered", "job_id": "job-1", "timestamp": "t"}));
        let err = receive_monitor_webhook(State(state), HeaderMap::new(), missing_fields)
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn repeated_delivery_is_processed_once() {
        let (state, h) = app_state();
        let (task, job) = streaming_task(&h, &[("object", "parcel", 0.8)]).await;
        let payload = body(json!({
            "event": "live_monitor_triggered",
            "job_id": job.job_id,
            "timestamp": "2026-01-01T00:00:00Z",
            "explanation": "YES, confidence: 0.93",
        }));

        let first = receive_monitor_webhook(State(state.clone()), HeaderMap::new(), payload.clone())
            .await
            .unwrap();
        assert_eq!(first.0.status, "accepted");
        let second = receive_monitor_webhook(State(state.clone()), HeaderMap::new(), payload)
            .await
            .unwrap();
        assert_eq!(second.0, WebhookAck::duplicate());

        let store = h.store.clone();
        let task_id = task.id;
        assert!(
            eventually(|| h.delivery.count("task_completed") == 1).await,
            "task should complete"
        );
        let done = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        let verified = store
            .get_events(task_id, 50)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == EventKind::CheckpointVerified)
            .count();
        assert_eq!(verified, 1);
    }

    #[tokio::test]
    async fn unknown_event_types_are_acknowledged() {
        let (state, _h) = app_state();
        let payload = body(json!({"event": "something_new", "job_id": "job-9", "timestamp": "t"}));
        let ack = receive_monitor_webhook(State(state), HeaderMap::new(), payload)
            .await
            .unwrap();
        assert_eq!(ack.0, WebhookAck::accepted("something_new"));
    }

    #[tokio::test]
    async fn processing_failures_stay_inside_the_continuation() {
        let panicked = spawn_guarded("job-1".to_string(), "job_status", async {
            if true {
                panic!("handler bug");
            }
            Ok(())
        });
        assert!(panicked.await.is_ok());

        let failed = spawn_guarded("job-2".to_string(), "job_error", async {
            Err(OrchestratorError::NotFound("Task".to_string()))
        });
        assert!(failed.await.is_ok());
    }
}
