//! C5: the App catalog and its install/uninstall/update/export/import state machine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::app_key::AppKey;
use crate::deployment::{Deployment, DeploymentError};
use crate::manifest::{Manifest, ManifestStore, ManifestStoreError};

#[derive(Debug, Error)]
pub enum AppsError {
    #[error("no such app {0}")]
    NotFound(AppKey),
    #[error(transparent)]
    Manifest(#[from] ManifestStoreError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not (de)serialise app catalog: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("app {0} is a system app; pass force to remove it")]
    SystemAppRemovalRefused(AppKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    NotInstalled,
    ManifestDownloaded,
    TokenAcquired,
    ImageDownloaded,
    Installed,
    Removed,
    Purged,
    Orphaned,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub key: AppKey,
    pub status: AppStatus,
    pub desired: AppStatus,
    #[serde(default)]
    pub installed_size: Option<u64>,
    #[serde(default)]
    pub download_token: Option<String>,
}

impl App {
    fn new(key: AppKey) -> Self {
        Self {
            key,
            status: AppStatus::NotInstalled,
            desired: AppStatus::Installed,
            installed_size: None,
            download_token: None,
        }
    }

    fn is_system(&self, manifest: Option<&Manifest>) -> bool {
        manifest
            .map(|m| m.labels.get("tech.flecs.category").map(String::as_str) == Some("system"))
            .unwrap_or(false)
    }
}

struct Catalog {
    apps: BTreeMap<AppKey, App>,
}

pub struct Apps {
    catalog: Mutex<Catalog>,
    base_path: Mutex<Option<PathBuf>>,
    manifests: Arc<ManifestStore>,
    deployment: Arc<dyn Deployment>,
}

impl Apps {
    pub fn new(manifests: Arc<ManifestStore>, deployment: Arc<dyn Deployment>) -> Self {
        Self {
            catalog: Mutex::new(Catalog {
                apps: BTreeMap::new(),
            }),
            base_path: Mutex::new(None),
            manifests,
            deployment,
        }
    }

    pub async fn base_path<P: AsRef<Path>>(&self, root: P) -> Result<(), AppsError> {
        let dir = root.as_ref().join("apps");
        std::fs::create_dir_all(&dir)?;
        *self.base_path.lock().await = Some(dir);
        Ok(())
    }

    fn store_path(dir: &Path) -> PathBuf {
        dir.join("apps.json")
    }

    /// Rehydrates the catalog and re-binds each App to its manifest in C1.
    pub async fn load(&self) -> Result<(), AppsError> {
        let Some(dir) = self.base_path.lock().await.clone() else {
            return Ok(());
        };
        let path = Self::store_path(&dir);
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(path)?;
        let apps: Vec<App> = serde_json::from_str(&raw)?;
        let mut catalog = self.catalog.lock().await;
        catalog.apps = apps.into_iter().map(|a| (a.key.clone(), a)).collect();
        Ok(())
    }

    pub async fn save(&self) -> Result<(), AppsError> {
        let Some(dir) = self.base_path.lock().await.clone() else {
            return Ok(());
        };
        let path = Self::store_path(&dir);
        let catalog = self.catalog.lock().await;
        let list: Vec<&App> = catalog.apps.values().collect();
        let json = serde_json::to_string_pretty(&list)?;
        drop(catalog);

        let tmp = path.with_extension("json.new");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub async fn list(&self) -> Vec<App> {
        self.catalog.lock().await.apps.values().cloned().collect()
    }

    pub async fn get(&self, key: &AppKey) -> Option<App> {
        self.catalog.lock().await.apps.get(key).cloned()
    }

    async fn persist(&self, app: &App) -> Result<(), AppsError> {
        self.catalog.lock().await.apps.insert(app.key.clone(), app.clone());
        self.save().await
    }

    /// Runs (or resumes) the install state machine for one key. Safe to call
    /// repeatedly; on restart the next unfinished arrow is re-attempted.
    pub async fn install(&self, manifest: Manifest, token: Option<String>) -> Result<(), AppsError> {
        let key = manifest.key();
        let mut app = self.get(&key).await.unwrap_or_else(|| App::new(key.clone()));
        app.desired = AppStatus::Installed;

        if app.status == AppStatus::NotInstalled || app.status == AppStatus::Unknown {
            self.manifests.add(manifest.clone())?;
            app.status = AppStatus::ManifestDownloaded;
            self.persist(&app).await?;
        }

        if app.status == AppStatus::ManifestDownloaded {
            app.download_token = token.clone();
            app.status = AppStatus::TokenAcquired;
            self.persist(&app).await?;
        }

        if app.status == AppStatus::TokenAcquired {
            self.deployment
                .download_app(&manifest, app.download_token.as_deref())
                .await?;
            app.status = AppStatus::ImageDownloaded;
            self.persist(&app).await?;
        }

        if app.status == AppStatus::ImageDownloaded {
            app.installed_size = self.deployment.determine_app_size(&manifest).await?;
            app.status = AppStatus::Installed;
            app.desired = AppStatus::Installed;
            self.persist(&app).await?;
        }

        info!(%key, "app installed");
        Ok(())
    }

    /// Installs each key independently; one app's failure does not abort the
    /// batch. Returns the per-key results in input order.
    pub async fn install_many(
        &self,
        entries: Vec<(Manifest, Option<String>)>,
    ) -> Vec<(AppKey, Result<(), AppsError>)> {
        let mut results = Vec::with_capacity(entries.len());
        for (manifest, token) in entries {
            let key = manifest.key();
            let result = self.install(manifest, token).await;
            if let Err(err) = &result {
                warn!(%key, %err, "batch install: app failed");
            }
            results.push((key, result));
        }
        results
    }

    /// App-level teardown only: image removal, manifest erasure, catalog
    /// removal. Dependent instances must already be gone; that orchestration
    /// crosses C5/C6 and lives in the daemon facade, not here.
    pub async fn uninstall(&self, key: &AppKey, force: bool) -> Result<(), AppsError> {
        let app = self.get(key).await.ok_or_else(|| AppsError::NotFound(key.clone()))?;
        let manifest = self.manifests.query(key);

        if app.is_system(manifest.as_deref()) && !force {
            return Err(AppsError::SystemAppRemovalRefused(key.clone()));
        }

        let mut app = app;
        app.desired = AppStatus::NotInstalled;
        self.persist(&app).await?;

        if let Some(manifest) = &manifest {
            if let Err(err) = self.deployment.delete_app(manifest).await {
                warn!(%key, %err, "image removal failed, continuing uninstall");
            }
        }

        self.catalog.lock().await.apps.remove(key);
        self.save().await?;
        self.manifests.erase(key)?;

        info!(%key, "app uninstalled");
        Ok(())
    }

    pub async fn export_to(&self, key: &AppKey, dest_dir: &Path) -> Result<(), AppsError> {
        let manifest = self
            .manifests
            .query(key)
            .ok_or_else(|| AppsError::NotFound(key.clone()))?;

        if !dest_dir.exists() {
            std::fs::create_dir_all(dest_dir)?;
        }

        let archive = dest_dir.join(format!("{}_{}.tar", key.name, key.version));
        self.deployment.export_app(&manifest, &archive).await?;

        let manifest_path = dest_dir.join(format!("{}_{}.json", key.name, key.version));
        std::fs::write(manifest_path, manifest.to_json_string().map_err(|e| {
            AppsError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
        })?)?;

        Ok(())
    }

    pub async fn import_from(&self, archive: &Path, manifest: Manifest) -> Result<(), AppsError> {
        let key = manifest.key();
        self.manifests.add(manifest.clone())?;
        self.deployment.import_app(&manifest, archive).await?;

        let mut app = self.get(&key).await.unwrap_or_else(|| App::new(key.clone()));
        app.installed_size = self.deployment.determine_app_size(&manifest).await?;
        app.status = AppStatus::Installed;
        app.desired = AppStatus::Installed;
        self.persist(&app).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{
        ContainerSpec, CreateOutcome, NetworkConfig,
    };
    use crate::instances::InstanceId;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::path::Path as StdPath;

    struct FakeDeployment;

    #[async_trait]
    impl Deployment for FakeDeployment {
        async fn download_app(&self, _: &Manifest, _: Option<&str>) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn delete_app(&self, _: &Manifest) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn import_app(&self, _: &Manifest, _: &StdPath) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn export_app(&self, _: &Manifest, _: &StdPath) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn determine_app_size(&self, _: &Manifest) -> Result<Option<u64>, DeploymentError> {
            Ok(Some(42))
        }
        async fn create_instance(&self, _: &ContainerSpec) -> Result<CreateOutcome, DeploymentError> {
            Ok(CreateOutcome::Created)
        }
        async fn delete_instance(&self, _: InstanceId) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn start_instance(&self, _: InstanceId) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn stop_instance(&self, _: InstanceId) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn ready_instance(&self, _: InstanceId) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn is_instance_running(&self, _: InstanceId) -> Result<bool, DeploymentError> {
            Ok(false)
        }
        async fn instance_logs(&self, _: InstanceId) -> Result<(String, String), DeploymentError> {
            Ok((String::new(), String::new()))
        }
        async fn create_network(&self, _: &NetworkConfig) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn delete_network(&self, _: &str) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn query_network(&self, _: &str) -> Result<Option<NetworkConfig>, DeploymentError> {
            Ok(None)
        }
        async fn networks(&self) -> Result<Vec<NetworkConfig>, DeploymentError> {
            Ok(vec![])
        }
        async fn connect_network(
            &self,
            _: InstanceId,
            _: &str,
            _: Option<IpAddr>,
        ) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn disconnect_network(&self, _: InstanceId, _: &str) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn create_volume(&self, _: &str) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn delete_volume(&self, _: &str) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn import_volume(&self, _: &str, _: &StdPath) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn export_volume(&self, _: &str, _: &StdPath) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn copy_file_from_image(
            &self,
            _: &str,
            _: &StdPath,
            _: &StdPath,
        ) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn copy_file_to_instance(
            &self,
            _: InstanceId,
            _: &StdPath,
            _: &str,
        ) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn copy_file_from_instance(
            &self,
            _: InstanceId,
            _: &str,
            _: &StdPath,
        ) -> Result<(), DeploymentError> {
            Ok(())
        }
        async fn image_entrypoint(&self, _: &str) -> Result<Vec<String>, DeploymentError> {
            Ok(vec![])
        }
    }

    fn demo_manifest() -> Manifest {
        Manifest::from_json_str(
            r#"{"app":"tech.flecs.demo","version":"1.0.0","image":"library/demo"}"#,
        )
        .unwrap()
    }

    fn test_apps() -> Apps {
        Apps::new(Arc::new(ManifestStore::new()), Arc::new(FakeDeployment))
    }

    #[tokio::test]
    async fn install_walks_the_full_state_machine_to_installed() {
        let apps = test_apps();
        let tmp = tempfile::tempdir().unwrap();
        apps.manifests.base_path(tmp.path()).unwrap();
        apps.base_path(tmp.path()).await.unwrap();

        let manifest = demo_manifest();
        apps.install(manifest.clone(), None).await.unwrap();

        let app = apps.get(&manifest.key()).await.unwrap();
        assert_eq!(app.status, AppStatus::Installed);
        assert_eq!(app.installed_size, Some(42));
    }

    #[tokio::test]
    async fn install_many_collects_independent_results() {
        let apps = test_apps();
        let tmp = tempfile::tempdir().unwrap();
        apps.manifests.base_path(tmp.path()).unwrap();
        apps.base_path(tmp.path()).await.unwrap();

        let results = apps
            .install_many(vec![(demo_manifest(), None)])
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
    }

    #[tokio::test]
    async fn uninstall_removes_from_catalog_and_manifest_store() {
        let apps = test_apps();
        let tmp = tempfile::tempdir().unwrap();
        apps.manifests.base_path(tmp.path()).unwrap();
        apps.base_path(tmp.path()).await.unwrap();

        let manifest = demo_manifest();
        let key = manifest.key();
        apps.install(manifest, None).await.unwrap();

        apps.uninstall(&key, false).await.unwrap();
        assert!(apps.get(&key).await.is_none());
        assert!(apps.manifests.query(&key).is_none());
    }
}
