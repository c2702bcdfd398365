//! Task endpoints for agents and operators.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

use crate::jobs::JobError;
use crate::orchestrator::{CreateTaskRequest, OrchestratorError};
use crate::store::{Checkpoint, Task, VerificationEvent};

use super::routes::AppState;
use super::types::*;

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

/// Map orchestrator failures onto HTTP status codes.
fn error_response(err: OrchestratorError) -> (StatusCode, String) {
    let status = match &err {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::InvalidTransition { .. }
        | OrchestratorError::NoUnverifiedCheckpoints(_)
        | OrchestratorError::Condition(_) => StatusCode::CONFLICT,
        OrchestratorError::Job(JobError::AtCapacity { .. }) => StatusCode::TOO_MANY_REQUESTS,
        OrchestratorError::Job(JobError::Monitor(_) | JobError::RestartFailed { .. }) => {
            StatusCode::BAD_GATEWAY
        }
        OrchestratorError::Job(JobError::Store(_)) | OrchestratorError::Store(_) => {
            tracing::error!(error = %err, "Store failure in request");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

async fn detail(state: &AppState, task: Task) -> ApiResult<TaskDetail> {
    let checkpoints = state
        .orchestrator
        .get_checkpoints(task.id)
        .await
        .map_err(error_response)?;
    Ok(Json(TaskDetail { task, checkpoints }))
}

/// Submit a new verification task.
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskDetail>), (StatusCode, String)> {
    let task = state
        .orchestrator
        .create_task(req)
        .await
        .map_err(error_response)?;
    let body = detail(&state, task).await?;
    Ok((StatusCode::CREATED, body))
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Task>> {
    state
        .orchestrator
        .list_tasks(query.limit.min(500), query.offset)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<TaskDetail> {
    let task = state.orchestrator.get_task(id).await.map_err(error_response)?;
    detail(&state, task).await
}

pub async fn claim_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<Task> {
    state
        .orchestrator
        .claim_task(id, &req.human_id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// The operator's stream is live; start monitoring.
pub async fn start_task(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<StartResponse> {
    let job = state
        .orchestrator
        .start_streaming(id)
        .await
        .map_err(error_response)?;
    Ok(Json(StartResponse {
        task_id: id,
        job_id: job.job_id,
        status: "streaming".to_string(),
    }))
}

pub async fn stop_task(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Task> {
    state
        .orchestrator
        .cancel_task(id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn task_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Vec<VerificationEvent>> {
    state
        .orchestrator
        .get_events(id, query.limit.min(1000))
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn task_checkpoints(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<Checkpoint>> {
    state
        .orchestrator
        .get_checkpoints(id)
        .await
        .map(Json)
        .map_err(error_response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::tests::app_state;
    use crate::orchestrator::tests::request;
    use crate::store::TaskStatus;

    #[tokio::test]
    async fn task_lifecycle_over_http_handlers() {
        let (state, h) = app_state();

        let (status, created) = create_task(
            State(state.clone()),
            Json(request(&[("location", "front desk", 0.8), ("object", "parcel", 0.8)])),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.0.checkpoints.len(), 2);
        let id = created.0.task.id;

        let claimed = claim_task(
            State(state.clone()),
            Path(id),
            Json(ClaimRequest {
                human_id: "human-3".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(claimed.0.status, TaskStatus::AwaitingStream);

        let started = start_task(State(state.clone()), Path(id)).await.unwrap();
        assert_eq!(started.0.job_id, "job-1");
        assert_eq!(h.monitor.started_count(), 1);

        let err = claim_task(
            State(state.clone()),
            Path(id),
            Json(ClaimRequest {
                human_id: "human-4".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);

        let stopped = stop_task(State(state.clone()), Path(id)).await.unwrap();
        assert_eq!(stopped.0.status, TaskStatus::Cancelled);

        let events = task_events(State(state.clone()), Path(id), Query(EventsQuery { limit: 10 }))
            .await
            .unwrap();
        assert_eq!(events.0.len(), 2);

        let listed = list_tasks(State(state), Query(ListQuery { limit: 10, offset: 0 }))
            .await
            .unwrap();
        assert_eq!(listed.0.len(), 1);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let (state, _h) = app_state();

        let err = get_task(State(state.clone()), Path(Uuid::new_v4())).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let err = create_task(State(state.clone()), Json(request(&[]))).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let mut reserved = request(&[("gps", "51.5,-0.12", 0.8)]);
        reserved.description = "Stand at the pin".to_string();
        let err = create_task(State(state), Json(reserved)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn capacity_exhaustion_is_too_many_requests() {
        let (state, _h) = crate::api::routes::tests::app_state_with_ceiling(1);
        for expected in [None, Some(StatusCode::TOO_MANY_REQUESTS)] {
            let (_, created) = create_task(State(state.clone()), Json(request(&[("object", "parcel", 0.8)])))
                .await
                .unwrap();
            let result = start_task(State(state.clone()), Path(created.0.task.id)).await;
            assert_eq!(result.err().map(|e| e.0), expected);
        }
    }
}
