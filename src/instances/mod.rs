//! C6: the Instance catalog and its create/start/stop/remove/update state machine.

mod ip_allocator;

pub use ip_allocator::{allocate_ip, IpAllocatorError};

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::app_key::AppKey;
use crate::apps::{AppStatus, Apps};
use crate::deployment::{
    container_name, volume_engine_name, ContainerSpec, CreateOutcome, Deployment, DeploymentError,
    NetworkAttachment, NetworkConfig, NetworkType, VolumeMount,
};
use crate::floxy::{EditorPort, Floxy, FloxyError};
use crate::manifest::{Manifest, ManifestStore, PortRange};

#[derive(Debug, Error)]
pub enum InstancesError {
    #[error("app is not installed")]
    AppNotInstalled,
    #[error("no such instance {0}")]
    NotFound(InstanceId),
    #[error("instance id space exhausted")]
    IdSpaceExhausted,
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Floxy(#[from] FloxyError),
    #[error(transparent)]
    Ip(#[from] IpAllocatorError),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not (de)serialise instance catalog: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no manifest for {0}")]
    NoManifest(AppKey),
}

/// A 32-bit instance identifier, rendered as 8 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u32);

impl InstanceId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn random() -> Self {
        Self(rand::thread_rng().next_u32())
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(u32::from_str_radix(s, 16)?))
    }
}

impl Serialize for InstanceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Requested,
    ResourcesReady,
    Created,
    Stopped,
    Running,
    Orphaned,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Desired {
    Created,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub app_ref: AppKey,
    pub status: InstanceStatus,
    pub desired: Desired,
    #[serde(default)]
    pub env_overrides: Option<Vec<(String, String)>>,
    #[serde(default)]
    pub port_overrides: Option<Vec<PortRange>>,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    #[serde(default)]
    pub usb_devices: Vec<String>,
    #[serde(default)]
    pub editor_port_map: BTreeMap<u16, u16>,
}

impl Instance {
    fn new(id: InstanceId, name: String, app_ref: AppKey) -> Self {
        Self {
            id,
            name,
            app_ref,
            status: InstanceStatus::Requested,
            desired: Desired::Created,
            env_overrides: None,
            port_overrides: None,
            networks: Vec::new(),
            usb_devices: Vec::new(),
            editor_port_map: BTreeMap::new(),
        }
    }
}

const DEFAULT_NETWORK_NAME: &str = "flecs";

pub fn default_network_config() -> NetworkConfig {
    NetworkConfig {
        name: DEFAULT_NETWORK_NAME.to_owned(),
        network_type: NetworkType::Bridge,
        cidr_subnet: "172.21.0.0/16".parse().ok(),
        gateway: "172.21.0.1".parse().ok(),
        parent_adapter: None,
    }
}

struct Catalog {
    instances: BTreeMap<InstanceId, Instance>,
}

pub struct Instances {
    catalog: Mutex<Catalog>,
    base_path: Mutex<Option<PathBuf>>,
    deployment: Arc<dyn Deployment>,
    floxy: Arc<Floxy>,
    manifests: Arc<ManifestStore>,
}

impl Instances {
    pub fn new(
        deployment: Arc<dyn Deployment>,
        floxy: Arc<Floxy>,
        manifests: Arc<ManifestStore>,
    ) -> Self {
        Self {
            catalog: Mutex::new(Catalog {
                instances: BTreeMap::new(),
            }),
            base_path: Mutex::new(None),
            deployment,
            floxy,
            manifests,
        }
    }

    pub async fn base_path<P: AsRef<Path>>(&self, root: P) -> Result<(), InstancesError> {
        let dir = root.as_ref().join("deployment");
        std::fs::create_dir_all(&dir)?;
        *self.base_path.lock().await = Some(dir);
        Ok(())
    }

    fn store_path(dir: &Path) -> PathBuf {
        dir.join("docker.json")
    }

    pub async fn load(&self) -> Result<(), InstancesError> {
        let Some(dir) = self.base_path.lock().await.clone() else {
            return Ok(());
        };
        let path = Self::store_path(&dir);
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(path)?;
        let instances: Vec<Instance> = serde_json::from_str(&raw)?;
        let mut catalog = self.catalog.lock().await;
        catalog.instances = instances.into_iter().map(|i| (i.id, i)).collect();
        Ok(())
    }

    pub async fn save(&self) -> Result<(), InstancesError> {
        let Some(dir) = self.base_path.lock().await.clone() else {
            return Ok(());
        };
        let path = Self::store_path(&dir);
        let catalog = self.catalog.lock().await;
        let list: Vec<&Instance> = catalog.instances.values().collect();
        let json = serde_json::to_string_pretty(&list)?;
        drop(catalog);

        let tmp = path.with_extension("json.new");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub async fn list(&self, app: Option<&AppKey>) -> Vec<Instance> {
        self.catalog
            .lock()
            .await
            .instances
            .values()
            .filter(|i| app.map(|a| &i.app_ref == a).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: InstanceId) -> Option<Instance> {
        self.catalog.lock().await.instances.get(&id).cloned()
    }

    async fn allocate_id(&self) -> Result<InstanceId, InstancesError> {
        let catalog = self.catalog.lock().await;
        for _ in 0..10_000 {
            let candidate = InstanceId::random();
            if !catalog.instances.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(InstancesError::IdSpaceExhausted)
    }

    /// §4.6 create: resolves the App, allocates an id (or returns the
    /// existing singleton for non-multi-instance apps), materialises
    /// volumes/network/conffiles, then asks the engine to create the
    /// container.
    pub async fn create(
        &self,
        apps: &Apps,
        app_key: &AppKey,
        name: String,
    ) -> Result<InstanceId, InstancesError> {
        let app = apps
            .get(app_key)
            .await
            .filter(|a| a.status == AppStatus::Installed)
            .ok_or(InstancesError::AppNotInstalled)?;
        let _ = app;

        let manifest = self
            .manifests
            .query(app_key)
            .ok_or_else(|| InstancesError::NoManifest(app_key.clone()))?;

        if !manifest.multi_instance {
            if let Some(existing) = self
                .list(Some(app_key))
                .await
                .into_iter()
                .find(|i| i.status != InstanceStatus::Orphaned)
            {
                return Ok(existing.id);
            }
        }

        let id = self.allocate_id().await?;
        let mut instance = Instance::new(id, name, app_key.clone());

        {
            let mut catalog = self.catalog.lock().await;
            catalog.instances.insert(id, instance.clone());
        }
        self.save().await?;

        for volume_name in manifest.named_volume_names() {
            let engine_name = volume_engine_name(id, &volume_name);
            self.deployment.create_volume(&engine_name).await?;
        }

        if let Some(network_name) = manifest.default_network() {
            let config = match self.deployment.query_network(network_name).await? {
                Some(existing) => existing,
                None => {
                    let config = default_network_config();
                    self.deployment.create_network(&config).await?;
                    config
                }
            };
            let ip_address = match (config.cidr_subnet, config.gateway) {
                (Some(cidr), Some(gateway)) => {
                    let taken = self.ips_on_network(network_name).await;
                    Some(allocate_ip(cidr, gateway, &taken)?)
                }
                _ => None,
            };
            instance.networks.push(NetworkAttachment {
                network_name: network_name.to_owned(),
                mac_address: None,
                ip_address,
            });
        }

        instance.status = InstanceStatus::ResourcesReady;
        {
            let mut catalog = self.catalog.lock().await;
            catalog.instances.insert(id, instance.clone());
        }
        self.save().await?;

        let spec = self.build_container_spec(&instance, &manifest).await?;
        self.deployment.create_instance(&spec).await?;

        instance.status = InstanceStatus::Created;
        {
            let mut catalog = self.catalog.lock().await;
            catalog.instances.insert(id, instance);
        }
        self.save().await?;

        info!(%id, app = %app_key, "instance created");
        Ok(id)
    }

    async fn build_container_spec(
        &self,
        instance: &Instance,
        manifest: &Manifest,
    ) -> Result<ContainerSpec, InstancesError> {
        let ports = instance
            .port_overrides
            .clone()
            .unwrap_or_else(|| manifest.ports.clone());
        let running_ports = self.host_ports_in_use(instance.id).await;
        let ports: Vec<PortRange> = ports
            .into_iter()
            .map(|p| {
                if running_ports.iter().any(|r| p.host_overlaps(r)) {
                    p.with_empty_host()
                } else {
                    p
                }
            })
            .collect();

        let env = instance
            .env_overrides
            .clone()
            .unwrap_or_else(|| manifest.env.iter().map(|e| (e.key.clone(), e.value.clone())).collect());

        let volumes = manifest
            .named_volume_names()
            .into_iter()
            .map(|name| VolumeMount::Named {
                engine_name: volume_engine_name(instance.id, &name),
                container_path: manifest.volume_container_path(&name).unwrap_or_default(),
            })
            .chain(manifest.bind_mounts().into_iter().map(|(host, container)| {
                VolumeMount::Bind {
                    host_path: host,
                    container_path: container,
                }
            }))
            .collect();

        let default_network = instance.networks.first().cloned();

        Ok(ContainerSpec {
            instance_id: instance.id,
            image_with_tag: manifest.image_with_tag(),
            env,
            volumes,
            ports,
            interactive: manifest.interactive,
            hostname: if manifest.hostname.is_empty() {
                None
            } else {
                Some(manifest.hostname.clone())
            },
            devices: instance.usb_devices.clone(),
            labels: Default::default(),
            capabilities: manifest.capabilities.clone(),
            default_network,
            init_network_after_start: manifest.init_network_after_start(),
            conffiles: Vec::new(),
        })
    }

    async fn host_ports_in_use(&self, excluding: InstanceId) -> Vec<PortRange> {
        self.catalog
            .lock()
            .await
            .instances
            .values()
            .filter(|i| i.id != excluding && i.status == InstanceStatus::Running)
            .flat_map(|i| i.port_overrides.clone().unwrap_or_default())
            .collect()
    }

    /// §4.6 start: legal only from `Created`/`Stopped`.
    pub async fn start(&self, manifest: &Manifest, id: InstanceId, once: bool) -> Result<(), InstancesError> {
        let mut instance = self
            .get(id)
            .await
            .ok_or(InstancesError::NotFound(id))?;

        if self.deployment.is_instance_running(id).await? {
            return Ok(());
        }

        if !once {
            instance.desired = Desired::Running;
        }
        self.persist(&instance).await?;

        let init_after_start = manifest.init_network_after_start();
        if init_after_start {
            for net in &instance.networks {
                let _ = self.deployment.disconnect_network(id, &net.network_name).await;
            }
        }

        self.deployment.start_instance(id).await?;

        if init_after_start {
            for net in &instance.networks {
                self.deployment
                    .connect_network(id, &net.network_name, net.ip_address)
                    .await?;
            }
        }

        if let Some(ip) = instance.networks.first().and_then(|n| n.ip_address) {
            let ports: Vec<EditorPort> = manifest
                .editors
                .iter()
                .map(|(port, cfg)| EditorPort {
                    container_port: *port,
                    dest_port: *port,
                    name: cfg.name.clone(),
                    supports_reverse_proxy: cfg.supports_reverse_proxy,
                })
                .collect();
            if let Err(err) = self
                .floxy
                .write_instance_snippet(manifest.app.as_str(), &id.to_string(), ip, &ports)
                .await
            {
                warn!(%err, %id, "failed to write reverse-proxy snippet");
            }
        }

        self.deployment.ready_instance(id).await?;

        instance.status = InstanceStatus::Running;
        self.persist(&instance).await?;
        info!(%id, "instance started");
        Ok(())
    }

    /// §4.6 stop.
    pub async fn stop(&self, manifest: &Manifest, id: InstanceId, once: bool) -> Result<(), InstancesError> {
        let mut instance = self.get(id).await.ok_or(InstancesError::NotFound(id))?;

        if !once {
            instance.desired = Desired::Stopped;
        }
        self.deployment.stop_instance(id).await?;
        self.floxy
            .delete_server_snippets(manifest.app.as_str(), &id.to_string())
            .await?;
        instance.editor_port_map.clear();

        if manifest.init_network_after_start() {
            for net in &instance.networks {
                let _ = self.deployment.disconnect_network(id, &net.network_name).await;
            }
        }

        instance.status = InstanceStatus::Stopped;
        self.persist(&instance).await?;
        info!(%id, "instance stopped");
        Ok(())
    }

    /// §4.6 remove: stop, delete volumes, delete container, drop the record.
    pub async fn remove(&self, manifest: &Manifest, id: InstanceId) -> Result<(), InstancesError> {
        let instance = self.get(id).await.ok_or(InstancesError::NotFound(id))?;

        if self.deployment.is_instance_running(id).await.unwrap_or(false) {
            self.stop(manifest, id, false).await?;
        }

        for name in manifest.named_volume_names() {
            let engine_name = volume_engine_name(id, &name);
            self.deployment.delete_volume(&engine_name).await?;
        }
        self.deployment.delete_instance(id).await?;
        self.floxy
            .delete_instance_snippet(manifest.app.as_str(), &id.to_string())
            .await?;

        self.catalog.lock().await.instances.remove(&id);
        self.save().await?;
        info!(%id, "instance removed");
        Ok(())
    }

    async fn persist(&self, instance: &Instance) -> Result<(), InstancesError> {
        self.catalog
            .lock()
            .await
            .instances
            .insert(instance.id, instance.clone());
        self.save().await
    }

    async fn backup_root(&self) -> Option<PathBuf> {
        self.base_path
            .lock()
            .await
            .as_deref()
            .and_then(Path::parent)
            .map(|root| root.join("backup"))
    }

    /// §4.6 update: stop, back up named volumes, rebind to the target App,
    /// restart if it was running before.
    pub async fn update(
        &self,
        apps: &Apps,
        id: InstanceId,
        to: AppKey,
        created_at: u64,
    ) -> Result<(), InstancesError> {
        let mut instance = self.get(id).await.ok_or(InstancesError::NotFound(id))?;
        let current_manifest = self
            .manifests
            .query(&instance.app_ref)
            .ok_or_else(|| InstancesError::NoManifest(instance.app_ref.clone()))?;
        let was_running = instance.status == InstanceStatus::Running;

        if was_running {
            self.stop(&current_manifest, id, false).await?;
        }

        if let Some(backup_root) = self.backup_root().await {
            let dir = backup_root
                .join(id.to_string())
                .join(&current_manifest.version)
                .join(created_at.to_string());
            for name in current_manifest.named_volume_names() {
                let engine_name = volume_engine_name(id, &name);
                let volume_dir = dir.join(&name);
                std::fs::create_dir_all(&volume_dir)?;
                self.deployment.export_volume(&engine_name, &volume_dir).await?;
            }
        }

        apps.get(&to)
            .await
            .filter(|a| a.status == AppStatus::Installed)
            .ok_or(InstancesError::AppNotInstalled)?;

        instance.app_ref = to;
        instance.status = InstanceStatus::Created;
        self.persist(&instance).await?;

        if was_running {
            let new_manifest = self
                .manifests
                .query(&instance.app_ref)
                .ok_or_else(|| InstancesError::NoManifest(instance.app_ref.clone()))?;
            self.start(&new_manifest, id, false).await?;
        }

        info!(%id, to = %instance.app_ref, "instance updated");
        Ok(())
    }

    async fn ips_on_network(&self, network_name: &str) -> Vec<IpAddr> {
        self.catalog
            .lock()
            .await
            .instances
            .values()
            .flat_map(|i| {
                i.networks
                    .iter()
                    .filter(|n| n.network_name == network_name)
                    .filter_map(|n| n.ip_address)
            })
            .collect()
    }

    /// §4.6 network reconfiguration via POST /config, one adapter entry at a
    /// time. Returns a suggested IP when the caller asked for one without
    /// supplying it; otherwise applies the change and returns the IP used.
    pub async fn reconfigure_network(
        &self,
        id: InstanceId,
        adapter: &str,
        active: bool,
        requested_ip: Option<IpAddr>,
    ) -> Result<Option<IpAddr>, InstancesError> {
        let mut instance = self.get(id).await.ok_or(InstancesError::NotFound(id))?;
        let network_name = format!("flecs-ipvlan_l2-{adapter}");

        if !active {
            if let Some(pos) = instance.networks.iter().position(|n| n.network_name == network_name) {
                let _ = self.deployment.disconnect_network(id, &network_name).await;
                self.deployment.delete_network(&network_name).await?;
                instance.networks.remove(pos);
                self.persist(&instance).await?;
            }
            return Ok(None);
        }

        let existing = self.deployment.query_network(&network_name).await?;

        let Some(ip) = requested_ip else {
            let cidr = existing
                .as_ref()
                .and_then(|c| c.cidr_subnet)
                .ok_or(IpAllocatorError::InvalidSubnet)?;
            let gateway = existing
                .as_ref()
                .and_then(|c| c.gateway)
                .ok_or(IpAllocatorError::InvalidSubnet)?;
            let taken = self.ips_on_network(&network_name).await;
            return Ok(Some(allocate_ip(cidr, gateway, &taken)?));
        };

        if existing.is_none() {
            self.deployment
                .create_network(&NetworkConfig {
                    name: network_name.clone(),
                    network_type: NetworkType::IpvlanL2,
                    cidr_subnet: None,
                    gateway: None,
                    parent_adapter: Some(adapter.to_owned()),
                })
                .await?;
        }

        if let Some(pos) = instance.networks.iter().position(|n| n.network_name == network_name) {
            let _ = self.deployment.disconnect_network(id, &network_name).await;
            instance.networks.remove(pos);
        }

        self.deployment.connect_network(id, &network_name, Some(ip)).await?;
        instance.networks.push(NetworkAttachment {
            network_name,
            mac_address: None,
            ip_address: Some(ip),
        });
        self.persist(&instance).await?;
        Ok(Some(ip))
    }

    /// Records a freshly allocated host port for a non-proxy-aware editor, so
    /// repeated requests to the same editor port reuse the mapping.
    pub async fn set_editor_port(
        &self,
        id: InstanceId,
        container_port: u16,
        host_port: u16,
    ) -> Result<(), InstancesError> {
        let mut instance = self.get(id).await.ok_or(InstancesError::NotFound(id))?;
        instance.editor_port_map.insert(container_port, host_port);
        self.persist(&instance).await
    }

    pub fn container_name(id: InstanceId) -> String {
        container_name(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_renders_as_eight_hex_digits() {
        assert_eq!(InstanceId::new(1).to_string(), "00000001");
        assert_eq!(InstanceId::new(0xdeadbeef).to_string(), "deadbeef");
    }

    #[test]
    fn instance_id_round_trips_through_string() {
        let id = InstanceId::new(0x1234abcd);
        let parsed: InstanceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn default_network_matches_fixed_subnet() {
        let net = default_network_config();
        assert_eq!(net.name, "flecs");
        assert_eq!(net.network_type, NetworkType::Bridge);
    }
}
