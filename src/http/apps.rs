//! `/v2/apps` — C5 over HTTP.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::app_key::AppKey;
use crate::apps::App;
use crate::daemon::Daemon;
use crate::error::DaemonError;
use crate::jobs;
use crate::manifest::Manifest;

pub fn router() -> Router<Arc<Daemon>> {
    Router::new()
        .route("/v2/apps", get(list_apps))
        .route("/v2/apps/install", post(install))
        .route("/v2/apps/install-many", post(install_many))
        .route("/v2/apps/sideload", post(sideload))
        .route("/v2/apps/:name", get(list_versions).delete(uninstall))
}

#[derive(Deserialize)]
struct VersionQuery {
    version: Option<String>,
}

async fn list_apps(
    State(daemon): State<Arc<Daemon>>,
    Query(query): Query<VersionQuery>,
) -> Json<Vec<App>> {
    let apps = daemon.apps.list().await;
    Json(filter_by_version(apps, query.version.as_deref()))
}

async fn list_versions(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
    Query(query): Query<VersionQuery>,
) -> Json<Vec<App>> {
    let apps: Vec<App> = daemon
        .apps
        .list()
        .await
        .into_iter()
        .filter(|a| a.key.name.as_str() == name)
        .collect();
    Json(filter_by_version(apps, query.version.as_deref()))
}

fn filter_by_version(apps: Vec<App>, version: Option<&str>) -> Vec<App> {
    match version {
        Some(v) => apps.into_iter().filter(|a| a.key.version == v).collect(),
        None => apps,
    }
}

#[derive(Deserialize)]
struct InstallRequest {
    #[serde(rename = "appKey")]
    app_key: AppKey,
}

#[derive(Serialize)]
struct JobAccepted {
    #[serde(rename = "jobId")]
    job_id: jobs::JobId,
}

async fn install(
    State(daemon): State<Arc<Daemon>>,
    Json(request): Json<InstallRequest>,
) -> (StatusCode, Json<JobAccepted>) {
    let key = request.app_key;
    let job_daemon = daemon.clone();
    let job_id = daemon.jobs.append(
        jobs::from_async(move |ctx| async move {
            let result = job_daemon.install_app(&key).await;
            super::report_job_result(&ctx, result);
        }),
        "install app",
    );
    (StatusCode::ACCEPTED, Json(JobAccepted { job_id }))
}

#[derive(Deserialize)]
struct InstallManyRequest {
    #[serde(rename = "appKeys")]
    app_keys: Vec<AppKey>,
}

#[derive(Serialize)]
struct InstallManyAccepted {
    #[serde(rename = "jobId")]
    job_id: jobs::JobId,
}

async fn install_many(
    State(daemon): State<Arc<Daemon>>,
    Json(request): Json<InstallManyRequest>,
) -> (StatusCode, Json<InstallManyAccepted>) {
    let job_daemon = daemon.clone();
    let job_id = daemon.jobs.append(
        jobs::from_async(move |ctx| async move {
            let results = job_daemon.install_many_apps(request.app_keys).await;
            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
            if failed == 0 {
                ctx.result(0, None);
            } else {
                ctx.result(1, Some(format!("{failed} of {} apps failed to install", results.len())));
            }
        }),
        "install apps",
    );
    (StatusCode::ACCEPTED, Json(InstallManyAccepted { job_id }))
}

#[derive(Deserialize)]
struct SideloadRequest {
    manifest: Manifest,
}

async fn sideload(
    State(daemon): State<Arc<Daemon>>,
    Json(request): Json<SideloadRequest>,
) -> (StatusCode, Json<JobAccepted>) {
    let job_daemon = daemon.clone();
    let job_id = daemon.jobs.append(
        jobs::from_async(move |ctx| async move {
            let result = job_daemon.sideload_app(request.manifest).await;
            super::report_job_result(&ctx, result);
        }),
        "sideload app",
    );
    (StatusCode::ACCEPTED, Json(JobAccepted { job_id }))
}

async fn uninstall(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
    Query(query): Query<UninstallQuery>,
) -> Result<(StatusCode, Json<JobAccepted>), DaemonError> {
    let key = AppKey::parse(name, query.version.unwrap_or_default())
        .map_err(|e| DaemonError::InvalidArgument(e.to_string()))?;
    daemon.apps.get(&key).await.ok_or_else(|| {
        DaemonError::InvalidArgument(format!("{key} is not installed"))
    })?;

    let job_daemon = daemon.clone();
    let force = query.force.unwrap_or(false);
    let job_id = daemon.jobs.append(
        jobs::from_async(move |ctx| async move {
            let result = job_daemon.uninstall_app(&key, force).await;
            super::report_job_result(&ctx, result);
        }),
        "uninstall app",
    );
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

#[derive(Deserialize)]
struct UninstallQuery {
    version: Option<String>,
    force: Option<bool>,
}
