use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::events::EventBroadcaster;
use crate::jobs::{Job, JobFilter, JobPatch, JobScheduler, JobStatus, JobStore, Metrics};

/// Statuses a cancel may overwrite.
const CANCELLABLE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Running];

pub mod error;
pub mod models;
pub mod stream;

use error::{ApiError, ApiResult};
use models::{CreateJobRequest, ListJobsQuery};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn JobStore>,
    pub scheduler: JobScheduler,
    pub events: EventBroadcaster,
    pub observer_buffer: usize,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        // Push stream
        .route("/events", get(stream::events))
        // Metrics
        .route("/metrics", get(metrics))
        .route("/metrics/prom", get(metrics_prom))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

pub async fn create_job(
    State(state): State<ApiState>,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let new_job = body.into_new_job()?;

    let job = state.store.create(new_job).await?;
    tracing::info!(job_id = %job.id, job_type = %job.job_type, "job created");
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Job>>> {
    let Query(q) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let filter = JobFilter::try_from(q)?;
    Ok(Json(state.store.list(&filter).await?))
}

pub async fn get_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult<Json<Job>> {
    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| job_not_found(id))
}

/// Label a pending or running job `cancelled`. A running handler is not
/// interrupted; if it finishes, its outcome replaces the label.
pub async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    if let Some(job) = state
        .store
        .update_if(id, &CANCELLABLE, JobPatch::cancelled())
        .await?
    {
        tracing::info!(job_id = %id, "job cancelled");
        return Ok(Json(job));
    }

    // Not cancellable right now: report what the job actually is.
    let job = state.store.get(id).await?.ok_or_else(|| job_not_found(id))?;
    match job.status {
        JobStatus::Cancelled => Ok(Json(job)),
        status => Err(ApiError::BadRequest(format!(
            "Cannot cancel job with status: {status}"
        ))),
    }
}

fn job_not_found(id: Uuid) -> ApiError {
    ApiError::NotFound(format!("job {id} not found"))
}

pub async fn metrics(State(state): State<ApiState>) -> ApiResult<Json<Metrics>> {
    let m = Metrics::collect(state.store.as_ref(), &state.scheduler, &state.events).await?;
    Ok(Json(m))
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Response {
    match Metrics::collect(state.store.as_ref(), &state.scheduler, &state.events).await {
        Ok(m) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            m.to_prometheus(),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics error: {e}"),
        )
            .into_response(),
    }
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
