//! `/v2/instances/<id>/editor/<port>` — C3's redirect/proxy entry point.
//!
//! Reverse-proxy-aware editors are already reachable through the nginx
//! location block C6 wrote on start; a request that lands here for one of
//! those is simply redirected back at the same path (nginx, not this
//! server, terminates it). Non-proxy-aware editors get a dedicated host
//! port allocated on first request and are redirected there.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::daemon::Daemon;
use crate::error::DaemonError;
use crate::instances::InstancesError;

pub fn router() -> Router<Arc<Daemon>> {
    Router::new().route("/v2/instances/:id/editor/:port", get(editor_redirect))
}

async fn editor_redirect(
    State(daemon): State<Arc<Daemon>>,
    Path((id, port)): Path<(String, u16)>,
) -> Result<Response, DaemonError> {
    let id = id
        .parse()
        .map_err(|_| DaemonError::InvalidArgument(format!("`{id}` is not a valid instance id")))?;
    let instance = daemon
        .instances
        .get(id)
        .await
        .ok_or(InstancesError::NotFound(id))?;
    let manifest = daemon
        .manifests
        .query(&instance.app_ref)
        .ok_or_else(|| DaemonError::InvalidArgument(format!("no manifest for {}", instance.app_ref)))?;
    let editor = manifest.editors.get(&port).ok_or_else(|| {
        DaemonError::InvalidArgument(format!("instance {id} has no editor on port {port}"))
    })?;

    if editor.supports_reverse_proxy {
        return Ok(redirect_to(&format!("/v2/instances/{id}/editor/{port}")));
    }

    let host_port = match instance.editor_port_map.get(&port) {
        Some(&cached) => cached,
        None => {
            let host_port = daemon.floxy.free_host_port()?;
            let ip = instance
                .networks
                .first()
                .and_then(|n| n.ip_address)
                .ok_or_else(|| DaemonError::InvalidArgument(format!("instance {id} has no IP")))?;
            daemon
                .floxy
                .write_server_snippet(manifest.app.as_str(), &id.to_string(), ip, host_port, port)
                .await?;
            daemon.instances.set_editor_port(id, port, host_port).await?;
            host_port
        }
    };

    Ok(redirect_to(&format!(":{host_port}")))
}

fn redirect_to(location: &str) -> Response {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, location.to_owned())],
    )
        .into_response()
}
