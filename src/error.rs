//! The HTTP-boundary error type: every component error composes into this one
//! (mirroring the teacher's per-module errors wired into a single `AppError`
//! at the router).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::apps::AppsError;
use crate::console::ConsoleError;
use crate::deployment::DeploymentError;
use crate::device::DeviceError;
use crate::floxy::FloxyError;
use crate::instances::{IpAllocatorError, InstancesError};
use crate::jobs::JobsError;
use crate::manifest::ManifestStoreError;
use crate::persistence::PersistenceError;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Manifest(#[from] ManifestStoreError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Apps(#[from] AppsError),
    #[error(transparent)]
    Instances(#[from] InstancesError),
    #[error(transparent)]
    Floxy(#[from] FloxyError),
    #[error(transparent)]
    Jobs(#[from] JobsError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Console(#[from] ConsoleError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Ip(#[from] IpAllocatorError),
    #[error("{0}")]
    InvalidArgument(String),
}

#[derive(Serialize)]
struct ErrorBody {
    #[serde(rename = "additionalInfo")]
    additional_info: String,
}

impl DaemonError {
    fn status_code(&self) -> StatusCode {
        match self {
            DaemonError::Manifest(ManifestStoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            DaemonError::Manifest(ManifestStoreError::NetworkSize) => StatusCode::BAD_GATEWAY,
            DaemonError::Manifest(_) => StatusCode::BAD_REQUEST,

            DaemonError::Apps(AppsError::NotFound(_)) => StatusCode::NOT_FOUND,
            DaemonError::Apps(AppsError::SystemAppRemovalRefused(_)) => StatusCode::CONFLICT,
            DaemonError::Apps(_) => StatusCode::INTERNAL_SERVER_ERROR,

            DaemonError::Instances(InstancesError::NotFound(_)) => StatusCode::NOT_FOUND,
            DaemonError::Instances(InstancesError::AppNotInstalled) => StatusCode::CONFLICT,
            DaemonError::Instances(InstancesError::IdSpaceExhausted) => {
                StatusCode::INSUFFICIENT_STORAGE
            }
            DaemonError::Instances(_) => StatusCode::INTERNAL_SERVER_ERROR,

            DaemonError::Jobs(JobsError::NotFound(_)) => StatusCode::NOT_FOUND,
            DaemonError::Jobs(JobsError::JobActive(_)) => StatusCode::BAD_REQUEST,

            DaemonError::Floxy(FloxyError::PortsExhausted) => StatusCode::INSUFFICIENT_STORAGE,
            DaemonError::Floxy(_) => StatusCode::BAD_GATEWAY,

            DaemonError::Ip(_) => StatusCode::INSUFFICIENT_STORAGE,

            DaemonError::Deployment(_) => StatusCode::BAD_GATEWAY,
            DaemonError::Console(ConsoleError::ManifestNotFound(_)) => StatusCode::NOT_FOUND,
            DaemonError::Console(_) => StatusCode::BAD_GATEWAY,
            DaemonError::Device(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DaemonError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,

            DaemonError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (
            status,
            Json(ErrorBody {
                additional_info: self.to_string(),
            }),
        )
            .into_response()
    }
}
