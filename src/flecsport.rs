//! C8: whole-device export/import packs ("flecsport").
//!
//! A pack is a plain directory tree: one image tarball and manifest JSON per
//! app, one volume tarball plus conffiles per instance, and a top-level
//! `export_manifest.json` describing what's inside.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app_key::AppKey;
use crate::apps::AppsError;
use crate::deployment::volume_engine_name;
use crate::instances::InstanceId;
use crate::manifest::ManifestStore;

#[derive(Debug, Error)]
pub enum FlecsportError {
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not (de)serialise export manifest: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Apps(#[from] AppsError),
    #[error(transparent)]
    Instances(#[from] crate::instances::InstancesError),
    #[error("no manifest for {0}")]
    NoManifest(AppKey),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub created_at: u64,
    pub apps: Vec<AppKey>,
    pub instances: Vec<InstanceId>,
    pub hostname: String,
    pub core_version: String,
    pub api_version: String,
}

const SCHEMA_VERSION: u32 = 1;
const API_VERSION: &str = "v2";

pub struct Flecsport {
    apps: Arc<crate::apps::Apps>,
    instances: Arc<crate::instances::Instances>,
    deployment: Arc<dyn crate::deployment::Deployment>,
    manifests: Arc<ManifestStore>,
}

impl Flecsport {
    pub fn new(
        apps: Arc<crate::apps::Apps>,
        instances: Arc<crate::instances::Instances>,
        deployment: Arc<dyn crate::deployment::Deployment>,
        manifests: Arc<ManifestStore>,
    ) -> Self {
        Self {
            apps,
            instances,
            deployment,
            manifests,
        }
    }

    pub async fn export_to(
        &self,
        apps: &[AppKey],
        instances: &[InstanceId],
        dest_dir: &Path,
        created_at: u64,
    ) -> Result<(), FlecsportError> {
        std::fs::create_dir_all(dest_dir)?;

        for key in apps {
            self.apps.export_to(key, dest_dir).await?;
        }

        for &id in instances {
            let instance = self
                .instances
                .get(id)
                .await
                .ok_or(crate::instances::InstancesError::NotFound(id))?;
            let instance_dir = dest_dir.join(format!("instances/{id}"));
            std::fs::create_dir_all(&instance_dir)?;

            let manifest = self
                .manifests
                .query(&instance.app_ref)
                .ok_or_else(|| FlecsportError::NoManifest(instance.app_ref.clone()))?;

            for name in manifest.named_volume_names() {
                let engine_name = volume_engine_name(id, &name);
                let volume_dir = instance_dir.join(&name);
                std::fs::create_dir_all(&volume_dir)?;
                self.deployment.export_volume(&engine_name, &volume_dir).await?;
            }
        }

        let export_manifest = ExportManifest {
            schema_version: SCHEMA_VERSION,
            created_at,
            apps: apps.to_vec(),
            instances: instances.to_vec(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            core_version: env!("CARGO_PKG_VERSION").to_owned(),
            api_version: API_VERSION.to_owned(),
        };
        let json = serde_json::to_string_pretty(&export_manifest)?;
        std::fs::write(dest_dir.join("export_manifest.json"), json)?;

        Ok(())
    }

    /// Reverses `export_to`: installs apps, then recreates instances and
    /// restores their volumes, in the order recorded by the export manifest.
    pub async fn import_from(&self, src_dir: &Path) -> Result<ExportManifest, FlecsportError> {
        let raw = std::fs::read_to_string(src_dir.join("export_manifest.json"))?;
        let export_manifest: ExportManifest = serde_json::from_str(&raw)?;

        for key in &export_manifest.apps {
            let manifest_path = src_dir.join(format!("{}_{}.json", key.name, key.version));
            let archive_path = src_dir.join(format!("{}_{}.tar", key.name, key.version));
            let raw_manifest = std::fs::read_to_string(&manifest_path)?;
            let manifest = crate::manifest::Manifest::from_json_str(&raw_manifest)
                .map_err(|e| FlecsportError::Apps(AppsError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    e.to_string(),
                ))))?;
            self.apps.import_from(&archive_path, manifest).await?;
        }

        for &id in &export_manifest.instances {
            let instance_dir = src_dir.join(format!("instances/{id}"));
            if !instance_dir.exists() {
                continue;
            }
            for entry in std::fs::read_dir(&instance_dir)?.flatten() {
                if entry.file_type()?.is_dir() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let engine_name = volume_engine_name(id, &name);
                    self.deployment.create_volume(&engine_name).await?;
                    self.deployment.import_volume(&engine_name, &entry.path()).await?;
                }
            }
        }

        Ok(export_manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_manifest_round_trips_through_json() {
        let export_manifest = ExportManifest {
            schema_version: SCHEMA_VERSION,
            created_at: 1700000000,
            apps: vec![AppKey::parse("tech.flecs.demo", "1.0.0").unwrap()],
            instances: vec![InstanceId::new(1)],
            hostname: "test-host".to_owned(),
            core_version: "0.1.0".to_owned(),
            api_version: API_VERSION.to_owned(),
        };
        let json = serde_json::to_string(&export_manifest).unwrap();
        let parsed: ExportManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.apps, export_manifest.apps);
        assert_eq!(parsed.instances, export_manifest.instances);
    }
}
