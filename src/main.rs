mod app_key;
mod apps;
mod config;
mod console;
mod daemon;
mod deployment;
mod device;
mod error;
mod flecsport;
mod floxy;
mod http;
mod instances;
mod jobs;
mod manifest;
mod persistence;

use std::env;
use std::fs;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use apps::Apps;
use config::Config;
use console::ConsoleClient;
use daemon::Daemon;
use deployment::docker::DockerDeployment;
use deployment::Deployment;
use device::Device;
use flecsport::Flecsport;
use floxy::Floxy;
use instances::Instances;
use jobs::Jobs;
use manifest::ManifestStore;
use persistence::Persistence;

fn load_config() -> anyhow::Result<Config> {
    match env::args().len() {
        0 | 1 => Ok(Default::default()),
        2 => {
            let arg = env::args().nth(1).expect("should have arg 1");
            let contents = fs::read_to_string(&arg)
                .context("could not read configuration file")
                .context(arg)?;
            let cfg = toml::from_str(&contents).context("failed to parse configuration")?;
            Ok(cfg)
        }
        _ => Err(anyhow::anyhow!(
            "expected at most one command arg, pointing to a config file"
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = load_config().context("could not load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| (&cfg.daemon.log).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    debug!(?cfg, "loaded configuration");

    let manifests = Arc::new(ManifestStore::new());
    let deployment: Arc<dyn Deployment> = Arc::new(DockerDeployment::new(&cfg.containers.docker_path));
    let floxy = Arc::new(Floxy::new(&cfg.floxy.nginx_path));
    let jobs = Jobs::new();
    let apps = Arc::new(Apps::new(manifests.clone(), deployment.clone()));
    let instances = Arc::new(Instances::new(deployment.clone(), floxy.clone(), manifests.clone()));
    let device = Arc::new(Device::new());
    let console = Arc::new(ConsoleClient::new(cfg.console.base_url.clone()));
    let persistence = Arc::new(Persistence::new(
        cfg.daemon.data_root.clone(),
        manifests.clone(),
        apps.clone(),
        instances.clone(),
        device.clone(),
    ));
    let flecsport = Arc::new(Flecsport::new(
        apps.clone(),
        instances.clone(),
        deployment.clone(),
        manifests.clone(),
    ));

    persistence
        .load_all()
        .await
        .context("failed to load persisted state")?;

    let daemon = Arc::new(Daemon {
        manifests,
        deployment,
        floxy,
        jobs,
        apps,
        instances,
        device,
        console,
        persistence,
        flecsport,
    });

    restart_desired_instances(&daemon).await;

    let app = http::router(daemon.clone());

    let listener = tokio::net::TcpListener::bind(cfg.daemon.http_bind)
        .await
        .context("failed to bind listener")?;
    info!(addr = %cfg.daemon.http_bind, "listening");

    let shutdown_daemon = daemon.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            shutdown_daemon.shutdown().await;
        })
        .await
        .context("http server exited with error")?;

    Ok(())
}

/// §4.6 startup: every Instance whose desired state is Running is started,
/// without re-asserting `desired` (it is already `Running`).
async fn restart_desired_instances(daemon: &Daemon) {
    for instance in daemon.instances.list(None).await {
        if instance.desired == instances::Desired::Running {
            if let Err(err) = daemon.start_instance_once(instance.id).await {
                tracing::warn!(id = %instance.id, %err, "failed to restart instance on startup");
            }
        }
    }
}
