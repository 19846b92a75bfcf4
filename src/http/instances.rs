//! `/v2/instances` — C6 over HTTP.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::app_key::AppKey;
use crate::daemon::Daemon;
use crate::error::DaemonError;
use crate::instances::{Instance, InstanceId, InstancesError};
use crate::jobs::{self, JobId};

pub fn router() -> Router<Arc<Daemon>> {
    Router::new()
        .route("/v2/instances", get(list_instances))
        .route("/v2/instances/create", post(create))
        .route("/v2/instances/:id", get(get_instance).delete(remove).patch(update))
        .route("/v2/instances/:id/start", post(start))
        .route("/v2/instances/:id/stop", post(stop))
        .route("/v2/instances/:id/config", get(get_config).post(apply_config))
        .route("/v2/instances/:id/logs", get(logs))
}

#[derive(Serialize)]
struct JobAccepted {
    #[serde(rename = "jobId")]
    job_id: JobId,
}

#[derive(Deserialize)]
struct ListQuery {
    app: Option<String>,
    version: Option<String>,
}

fn parse_instance_id(raw: &str) -> Result<InstanceId, DaemonError> {
    raw.parse()
        .map_err(|_| DaemonError::InvalidArgument(format!("`{raw}` is not a valid instance id")))
}

async fn list_instances(
    State(daemon): State<Arc<Daemon>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Instance>>, DaemonError> {
    let app_key = match (&query.app, &query.version) {
        (Some(name), Some(version)) => Some(
            AppKey::parse(name.clone(), version.clone())
                .map_err(|e| DaemonError::InvalidArgument(e.to_string()))?,
        ),
        _ => None,
    };
    Ok(Json(daemon.instances.list(app_key.as_ref()).await))
}

async fn get_instance(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> Result<Json<Instance>, DaemonError> {
    let id = parse_instance_id(&id)?;
    let instance = daemon
        .instances
        .get(id)
        .await
        .ok_or(InstancesError::NotFound(id))?;
    Ok(Json(instance))
}

#[derive(Deserialize)]
struct CreateRequest {
    #[serde(rename = "appKey")]
    app_key: AppKey,
    #[serde(default, rename = "instanceName")]
    instance_name: Option<String>,
}

async fn create(
    State(daemon): State<Arc<Daemon>>,
    Json(request): Json<CreateRequest>,
) -> (StatusCode, Json<JobAccepted>) {
    let job_daemon = daemon.clone();
    let name = request.instance_name.unwrap_or_default();
    let job_id = daemon.jobs.append(
        jobs::from_async(move |ctx| async move {
            let result = job_daemon
                .create_instance(&request.app_key, name)
                .await
                .map(|_| ());
            super::report_job_result(&ctx, result);
        }),
        "create instance",
    );
    (StatusCode::ACCEPTED, Json(JobAccepted { job_id }))
}

async fn start(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobAccepted>), DaemonError> {
    let id = parse_instance_id(&id)?;
    let job_daemon = daemon.clone();
    let job_id = daemon.jobs.append(
        jobs::from_async(move |ctx| async move {
            let result = job_daemon.start_instance(id).await;
            super::report_job_result(&ctx, result);
        }),
        "start instance",
    );
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

async fn stop(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobAccepted>), DaemonError> {
    let id = parse_instance_id(&id)?;
    let job_daemon = daemon.clone();
    let job_id = daemon.jobs.append(
        jobs::from_async(move |ctx| async move {
            let result = job_daemon.stop_instance(id).await;
            super::report_job_result(&ctx, result);
        }),
        "stop instance",
    );
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

async fn remove(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobAccepted>), DaemonError> {
    let id = parse_instance_id(&id)?;
    let job_daemon = daemon.clone();
    let job_id = daemon.jobs.append(
        jobs::from_async(move |ctx| async move {
            let result = job_daemon.remove_instance(id).await;
            super::report_job_result(&ctx, result);
        }),
        "remove instance",
    );
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

#[derive(Deserialize)]
struct UpdateRequest {
    to: AppKey,
}

async fn update(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), DaemonError> {
    let id = parse_instance_id(&id)?;
    let job_daemon = daemon.clone();
    let created_at = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let job_id = daemon.jobs.append(
        jobs::from_async(move |ctx| async move {
            let result = job_daemon.update_instance(id, request.to, created_at).await;
            super::report_job_result(&ctx, result);
        }),
        "update instance",
    );
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

#[derive(Serialize)]
struct InstanceConfig {
    instance: Instance,
    ports: Vec<crate::manifest::PortRange>,
    volumes: Vec<String>,
    editors: Vec<u16>,
}

async fn get_config(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> Result<Json<InstanceConfig>, DaemonError> {
    let id = parse_instance_id(&id)?;
    let instance = daemon
        .instances
        .get(id)
        .await
        .ok_or(InstancesError::NotFound(id))?;
    let manifest = daemon
        .manifests
        .query(&instance.app_ref)
        .ok_or_else(|| DaemonError::InvalidArgument(format!("no manifest for {}", instance.app_ref)))?;

    Ok(Json(InstanceConfig {
        ports: instance.port_overrides.clone().unwrap_or_else(|| manifest.ports.clone()),
        volumes: manifest.named_volume_names(),
        editors: manifest.editors.keys().copied().collect(),
        instance,
    }))
}

#[derive(Deserialize)]
struct NetworkAdapterRequest {
    adapter: String,
    active: bool,
    #[serde(default)]
    ip: Option<IpAddr>,
}

#[derive(Deserialize)]
struct ApplyConfigRequest {
    #[serde(default, rename = "networkAdapters")]
    network_adapters: Vec<NetworkAdapterRequest>,
}

#[derive(Serialize)]
struct ApplyConfigResponse {
    #[serde(rename = "suggestedIps")]
    suggested_ips: Vec<(String, IpAddr)>,
}

async fn apply_config(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(request): Json<ApplyConfigRequest>,
) -> Result<Json<ApplyConfigResponse>, DaemonError> {
    let id = parse_instance_id(&id)?;
    let mut suggested_ips = Vec::new();
    for adapter in request.network_adapters {
        let result = daemon
            .reconfigure_instance_network(id, &adapter.adapter, adapter.active, adapter.ip)
            .await?;
        if let Some(ip) = result {
            if adapter.ip.is_none() {
                suggested_ips.push((adapter.adapter, ip));
            }
        }
    }
    Ok(Json(ApplyConfigResponse { suggested_ips }))
}

#[derive(Serialize)]
struct LogsResponse {
    stdout: String,
    stderr: String,
}

async fn logs(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> Result<Json<LogsResponse>, DaemonError> {
    let id = parse_instance_id(&id)?;
    let (stdout, stderr) = daemon.instance_logs(id).await?;
    Ok(Json(LogsResponse { stdout, stderr }))
}
