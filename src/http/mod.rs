//! C0: the Axum HTTP adapter. Handlers are thin — decode, delegate, translate
//! the result into a status code via [`crate::error::DaemonError`]'s
//! `IntoResponse` impl (grounded in the teacher's router composition in
//! `main.rs`/`reverse_proxy.rs`).

pub mod apps;
pub mod device;
pub mod editor;
pub mod instances;
pub mod jobs;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::daemon::Daemon;
use crate::error::DaemonError;
use crate::jobs::JobContext;

/// Reports a job's outcome on its [`JobContext`]: `code = 0` on success, `1`
/// with the error's message otherwise.
pub(crate) fn report_job_result(ctx: &JobContext, result: Result<(), DaemonError>) {
    match result {
        Ok(()) => ctx.result(0, None),
        Err(err) => ctx.result(1, Some(err.to_string())),
    }
}

pub fn router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .merge(apps::router())
        .merge(instances::router())
        .merge(jobs::router())
        .merge(device::router())
        .merge(editor::router())
        .layer(TraceLayer::new_for_http())
        .with_state(daemon)
}
