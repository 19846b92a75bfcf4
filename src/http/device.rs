//! `/v2/device/license` — C7 over HTTP.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::daemon::Daemon;
use crate::error::DaemonError;

pub fn router() -> Router<Arc<Daemon>> {
    Router::new()
        .route("/v2/device/license/activation/status", get(status))
        .route("/v2/device/license/activation", post(activate))
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(rename = "isValid")]
    is_valid: bool,
}

async fn status(State(daemon): State<Arc<Daemon>>) -> Result<Json<StatusResponse>, DaemonError> {
    let is_valid = daemon.device.validate(&daemon.console).await?;
    Ok(Json(StatusResponse { is_valid }))
}

#[derive(Deserialize)]
struct ActivateRequest {
    #[serde(default, rename = "licenseKey")]
    license_key: Option<String>,
}

async fn activate(
    State(daemon): State<Arc<Daemon>>,
    Json(request): Json<ActivateRequest>,
) -> Result<(), DaemonError> {
    daemon.device.activate(&daemon.console, request.license_key).await?;
    Ok(())
}
