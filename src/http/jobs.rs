//! `/v2/jobs` — C4 over HTTP.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use crate::daemon::Daemon;
use crate::error::DaemonError;
use crate::jobs::{JobId, JobsError, Progress};

pub fn router() -> Router<Arc<Daemon>> {
    Router::new()
        .route("/v2/jobs", get(list_jobs))
        .route("/v2/jobs/:id", get(get_job).delete(delete_job))
}

async fn list_jobs(State(daemon): State<Arc<Daemon>>) -> Json<Vec<Progress>> {
    Json(daemon.jobs.list_jobs())
}

async fn get_job(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<JobId>,
) -> Result<Json<Progress>, DaemonError> {
    daemon
        .jobs
        .get(id)
        .map(Json)
        .ok_or_else(|| JobsError::NotFound(id).into())
}

async fn delete_job(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<JobId>,
) -> Result<StatusCode, DaemonError> {
    daemon.jobs.delete_job(id)?;
    Ok(StatusCode::OK)
}
