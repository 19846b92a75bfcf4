//! Top-level facade wiring every component together and resolving the one
//! place where C5 and C6 need each other: app uninstall must first remove
//! every dependent instance. Rather than giving `Apps` a back-reference to
//! `Instances` (which would make the two crates-within-a-crate circular),
//! that one cross-call is lifted here.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::app_key::AppKey;
use crate::apps::Apps;
use crate::console::ConsoleClient;
use crate::deployment::Deployment;
use crate::device::Device;
use crate::error::DaemonError;
use crate::flecsport::Flecsport;
use crate::floxy::Floxy;
use crate::instances::{Instance, InstanceId, Instances};
use crate::jobs::Jobs;
use crate::manifest::{Manifest, ManifestStore};
use crate::persistence::Persistence;

pub struct Daemon {
    pub manifests: Arc<ManifestStore>,
    pub deployment: Arc<dyn Deployment>,
    pub floxy: Arc<Floxy>,
    pub jobs: Arc<Jobs>,
    pub apps: Arc<Apps>,
    pub instances: Arc<Instances>,
    pub device: Arc<Device>,
    pub console: Arc<ConsoleClient>,
    pub persistence: Arc<Persistence>,
    pub flecsport: Arc<Flecsport>,
}

impl Daemon {
    /// §4.5 install: resolves the manifest (console, if not already cached)
    /// and a download token, then drives the App install state machine.
    pub async fn install_app(&self, key: &AppKey) -> Result<(), DaemonError> {
        let session = self.device.session_id()?;
        let manifest = match self.manifests.query(key) {
            Some(manifest) => (*manifest).clone(),
            None => {
                let (manifest, _) = self
                    .manifests
                    .add_from_console(&self.console, session, key)
                    .await?;
                (*manifest).clone()
            }
        };
        let token = self.console.fetch_token(session, key).await?;
        self.apps.install(manifest, token).await?;
        Ok(())
    }

    /// §4.5/§6 sideload: the caller supplies the manifest directly.
    pub async fn sideload_app(&self, manifest: Manifest) -> Result<(), DaemonError> {
        let key = manifest.key();
        let session = self.device.session_id()?;
        let token = self.console.fetch_token(session, &key).await?;
        self.apps.install(manifest, token).await?;
        Ok(())
    }

    /// §4.5 install-many: resolves manifest+token for every key, installs the
    /// batch, then auto-creates one default instance per app that came out
    /// Installed. Unlike single install, this does instantiate — the
    /// asymmetry is intentional, see DESIGN.md.
    pub async fn install_many_apps(&self, keys: Vec<AppKey>) -> Vec<(AppKey, Result<(), DaemonError>)> {
        let session = match self.device.session_id() {
            Ok(session) => session,
            Err(err) => {
                let message = err.to_string();
                return keys
                    .into_iter()
                    .map(|key| (key, Err(DaemonError::InvalidArgument(message.clone()))))
                    .collect();
            }
        };

        let mut entries = Vec::with_capacity(keys.len());
        for key in &keys {
            let manifest = match self.manifests.query(key) {
                Some(manifest) => (*manifest).clone(),
                None => match self.manifests.add_from_console(&self.console, session, key).await {
                    Ok((manifest, _)) => (*manifest).clone(),
                    Err(err) => {
                        entries.push((key.clone(), None, Some(DaemonError::from(err))));
                        continue;
                    }
                },
            };
            let token = match self.console.fetch_token(session, key).await {
                Ok(token) => token,
                Err(err) => {
                    entries.push((key.clone(), None, Some(DaemonError::from(err))));
                    continue;
                }
            };
            entries.push((key.clone(), Some((manifest, token)), None));
        }

        let mut results = Vec::with_capacity(entries.len());
        let mut to_install = Vec::new();
        for (key, manifest_token, early_err) in entries {
            match manifest_token {
                Some(mt) => to_install.push((key, mt)),
                None => results.push((key, Err(early_err.expect("early error recorded")))),
            }
        }

        let install_results = self
            .apps
            .install_many(to_install.iter().map(|(_, mt)| mt.clone()).collect())
            .await;

        for ((key, _), (installed_key, result)) in to_install.iter().zip(install_results) {
            debug_assert_eq!(key, &installed_key);
            match result {
                Ok(()) => {
                    let create_result = self.instances.create(&self.apps, key, String::new()).await;
                    results.push((key.clone(), create_result.map(|_| ()).map_err(DaemonError::from)));
                }
                Err(err) => results.push((key.clone(), Err(DaemonError::from(err)))),
            }
        }

        results
    }

    pub async fn update_instance(
        &self,
        id: InstanceId,
        to: AppKey,
        created_at: u64,
    ) -> Result<(), DaemonError> {
        self.instances.update(&self.apps, id, to, created_at).await?;
        Ok(())
    }

    pub async fn reconfigure_instance_network(
        &self,
        id: InstanceId,
        adapter: &str,
        active: bool,
        requested_ip: Option<IpAddr>,
    ) -> Result<Option<IpAddr>, DaemonError> {
        Ok(self
            .instances
            .reconfigure_network(id, adapter, active, requested_ip)
            .await?)
    }

    /// Removes every Instance belonging to `key`, then tears down the App
    /// record itself (§4.5 uninstall).
    pub async fn uninstall_app(&self, key: &AppKey, force: bool) -> Result<(), DaemonError> {
        let manifest = self.manifests.query(key);

        for instance in self.instances.list(Some(key)).await {
            if let Some(manifest) = &manifest {
                self.instances.remove(manifest, instance.id).await?;
            } else {
                warn!(%key, instance = %instance.id, "no manifest found while tearing down dependent instance");
            }
        }

        self.apps.uninstall(key, force).await?;
        Ok(())
    }

    pub async fn create_instance(
        &self,
        key: &AppKey,
        name: String,
    ) -> Result<InstanceId, DaemonError> {
        Ok(self.instances.create(&self.apps, key, name).await?)
    }

    pub async fn start_instance(&self, id: InstanceId) -> Result<(), DaemonError> {
        let instance = self.require_instance(id).await?;
        let manifest = self.require_manifest(&instance.app_ref).await?;
        self.instances.start(&manifest, id, false).await?;
        Ok(())
    }

    /// §4.6 startup: start an Instance whose `desired` is already `Running`
    /// without re-asserting it, mirroring `stop`'s `once` semantics.
    pub async fn start_instance_once(&self, id: InstanceId) -> Result<(), DaemonError> {
        let instance = self.require_instance(id).await?;
        let manifest = self.require_manifest(&instance.app_ref).await?;
        self.instances.start(&manifest, id, true).await?;
        Ok(())
    }

    pub async fn stop_instance(&self, id: InstanceId) -> Result<(), DaemonError> {
        let instance = self.require_instance(id).await?;
        let manifest = self.require_manifest(&instance.app_ref).await?;
        self.instances.stop(&manifest, id, false).await?;
        Ok(())
    }

    pub async fn remove_instance(&self, id: InstanceId) -> Result<(), DaemonError> {
        let instance = self.require_instance(id).await?;
        let manifest = self.require_manifest(&instance.app_ref).await?;
        self.instances.remove(&manifest, id).await?;
        Ok(())
    }

    pub async fn instance_logs(&self, id: InstanceId) -> Result<(String, String), DaemonError> {
        self.require_instance(id).await?;
        Ok(self.deployment.instance_logs(id).await?)
    }

    async fn require_instance(&self, id: InstanceId) -> Result<Instance, DaemonError> {
        self.instances
            .get(id)
            .await
            .ok_or(crate::instances::InstancesError::NotFound(id).into())
    }

    async fn require_manifest(
        &self,
        key: &AppKey,
    ) -> Result<crate::manifest::Manifest, DaemonError> {
        self.manifests
            .query(key)
            .map(|m| (*m).clone())
            .ok_or_else(|| {
                DaemonError::InvalidArgument(format!("no manifest found for {key}"))
            })
    }

    pub async fn shutdown(&self) {
        if let Err(err) = self.persistence.save_all().await {
            warn!(%err, "failed to persist state during shutdown");
        }
    }
}

pub fn default_data_root() -> PathBuf {
    PathBuf::from("/var/lib/flecs")
}
