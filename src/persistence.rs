//! C9: coordinates on-disk load/save order across the other components so
//! cross-references (Instance → App → Manifest) resolve correctly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::apps::{Apps, AppsError};
use crate::device::{Device, DeviceError};
use crate::instances::{Instances, InstancesError};
use crate::manifest::{ManifestStore, ManifestStoreError};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Apps(#[from] AppsError),
    #[error(transparent)]
    Instances(#[from] InstancesError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    ManifestStore(#[from] ManifestStoreError),
}

/// Loads/saves every component in the dependency order required for
/// cross-references to resolve: manifests first, then apps (which read
/// manifests), then instances (which bind to apps), then device identity.
pub struct Persistence {
    root: PathBuf,
    manifests: Arc<ManifestStore>,
    apps: Arc<Apps>,
    instances: Arc<Instances>,
    device: Arc<Device>,
}

impl Persistence {
    pub fn new(
        root: impl Into<PathBuf>,
        manifests: Arc<ManifestStore>,
        apps: Arc<Apps>,
        instances: Arc<Instances>,
        device: Arc<Device>,
    ) -> Self {
        Self {
            root: root.into(),
            manifests,
            apps,
            instances,
            device,
        }
    }

    fn sub_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub async fn load_all(&self) -> Result<(), PersistenceError> {
        self.manifests.base_path(self.sub_path("manifests"))?;
        self.apps.base_path(self.sub_path("apps")).await?;
        self.apps.load().await?;
        self.instances.base_path(&self.root).await?;
        self.instances.load().await?;
        self.device.base_path(self.sub_path("device"))?;
        self.device.load()?;
        info!(root = %self.root.display(), "loaded persisted state");
        Ok(())
    }

    pub async fn save_all(&self) -> Result<(), PersistenceError> {
        self.apps.save().await?;
        self.instances.save().await?;
        self.device.save()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::docker::DockerDeployment;
    use crate::floxy::Floxy;

    #[tokio::test]
    async fn load_all_creates_the_expected_directory_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let manifests = Arc::new(ManifestStore::new());
        let deployment: Arc<dyn crate::deployment::Deployment> =
            Arc::new(DockerDeployment::new("/usr/bin/docker"));
        let floxy = Arc::new(Floxy::new("/usr/sbin/nginx"));
        let apps = Arc::new(Apps::new(manifests.clone(), deployment.clone()));
        let instances = Arc::new(Instances::new(deployment, floxy, manifests.clone()));
        let device = Arc::new(Device::new());

        let persistence = Persistence::new(tmp.path(), manifests, apps, instances, device);
        persistence.load_all().await.unwrap();

        assert!(tmp.path().join("manifests").exists());
        assert!(tmp.path().join("apps").exists());
        assert!(tmp.path().join("deployment").exists());
        assert!(tmp.path().join("device").exists());
    }
}
