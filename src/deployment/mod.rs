//! C2: the abstraction over a container engine that realises [`crate::instances::Instance`]s.
//!
//! Expressed as a capability trait (§9 design notes: "polymorphism over
//! deployments") so that an alternate engine can be added later without a
//! subclass hierarchy. [`docker::DockerDeployment`] is the concrete,
//! subprocess-driven implementation.

pub mod docker;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instances::InstanceId;
use crate::manifest::{Capability, Manifest, PortRange};

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("container engine exited with an error: {0}")]
    Engine(String),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse engine output: {0}")]
    Malformed(String),
    #[error("no free host port available")]
    PortsExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    None,
    Internal,
    Bridge,
    Macvlan,
    IpvlanL2,
    IpvlanL3,
}

impl NetworkType {
    pub fn requires_parent_adapter(self) -> bool {
        matches!(self, NetworkType::IpvlanL2 | NetworkType::IpvlanL3)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub network_type: NetworkType,
    pub cidr_subnet: Option<IpNetwork>,
    pub gateway: Option<IpAddr>,
    pub parent_adapter: Option<String>,
}

/// One network attachment recorded on an instance; element 0 of
/// `Instance::networks` is always the default network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub network_name: String,
    pub mac_address: Option<String>,
    pub ip_address: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeMount {
    /// `flecs-<instance_id>-<name>:/container/path`
    Named { engine_name: String, container_path: String },
    /// passed through verbatim
    Bind { host_path: String, container_path: String },
}

/// Fully resolved parameters for creating a container, assembled by C6 from
/// the manifest plus any instance-level overrides (§4.2 materialisation order).
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub instance_id: InstanceId,
    pub image_with_tag: String,
    pub env: Vec<(String, String)>,
    pub volumes: Vec<VolumeMount>,
    pub ports: Vec<PortRange>,
    pub interactive: bool,
    pub hostname: Option<String>,
    pub devices: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub capabilities: std::collections::BTreeSet<Capability>,
    /// The default (first) network, attached at creation time. Additional
    /// networks are connected afterwards via `connect_network`.
    pub default_network: Option<NetworkAttachment>,
    pub init_network_after_start: bool,
    pub conffiles: Vec<(PathBuf, String)>,
}

pub fn container_name(instance_id: InstanceId) -> String {
    format!("flecs-{instance_id}")
}

pub fn volume_engine_name(instance_id: InstanceId, manifest_volume_name: &str) -> String {
    format!("flecs-{instance_id}-{manifest_volume_name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyRunning,
}

/// The capability set a container engine must expose (§4.2). The Docker
/// implementation drives this via the `docker` CLI; nothing else in the
/// crate depends on Docker specifically.
#[async_trait]
pub trait Deployment: Send + Sync {
    async fn download_app(
        &self,
        manifest: &Manifest,
        token: Option<&str>,
    ) -> Result<(), DeploymentError>;
    async fn delete_app(&self, manifest: &Manifest) -> Result<(), DeploymentError>;
    async fn import_app(&self, manifest: &Manifest, archive: &Path) -> Result<(), DeploymentError>;
    async fn export_app(&self, manifest: &Manifest, archive: &Path) -> Result<(), DeploymentError>;
    async fn determine_app_size(&self, manifest: &Manifest) -> Result<Option<u64>, DeploymentError>;

    async fn create_instance(&self, spec: &ContainerSpec) -> Result<CreateOutcome, DeploymentError>;
    async fn delete_instance(&self, instance_id: InstanceId) -> Result<(), DeploymentError>;
    async fn start_instance(&self, instance_id: InstanceId) -> Result<(), DeploymentError>;
    async fn stop_instance(&self, instance_id: InstanceId) -> Result<(), DeploymentError>;
    async fn ready_instance(&self, instance_id: InstanceId) -> Result<(), DeploymentError>;
    async fn is_instance_running(&self, instance_id: InstanceId) -> Result<bool, DeploymentError>;
    async fn instance_logs(&self, instance_id: InstanceId) -> Result<(String, String), DeploymentError>;

    async fn create_network(&self, config: &NetworkConfig) -> Result<(), DeploymentError>;
    async fn delete_network(&self, name: &str) -> Result<(), DeploymentError>;
    async fn query_network(&self, name: &str) -> Result<Option<NetworkConfig>, DeploymentError>;
    /// Lists networks named `flecs*`.
    async fn networks(&self) -> Result<Vec<NetworkConfig>, DeploymentError>;
    async fn connect_network(
        &self,
        instance_id: InstanceId,
        network: &str,
        ip: Option<IpAddr>,
    ) -> Result<(), DeploymentError>;
    async fn disconnect_network(
        &self,
        instance_id: InstanceId,
        network: &str,
    ) -> Result<(), DeploymentError>;

    async fn create_volume(&self, engine_name: &str) -> Result<(), DeploymentError>;
    async fn delete_volume(&self, engine_name: &str) -> Result<(), DeploymentError>;
    async fn import_volume(&self, engine_name: &str, src_dir: &Path) -> Result<(), DeploymentError>;
    async fn export_volume(&self, engine_name: &str, dest_dir: &Path) -> Result<(), DeploymentError>;

    async fn copy_file_from_image(
        &self,
        image: &str,
        file: &Path,
        dest: &Path,
    ) -> Result<(), DeploymentError>;
    async fn copy_file_to_instance(
        &self,
        instance_id: InstanceId,
        local: &Path,
        container_path: &str,
    ) -> Result<(), DeploymentError>;
    async fn copy_file_from_instance(
        &self,
        instance_id: InstanceId,
        container_path: &str,
        local: &Path,
    ) -> Result<(), DeploymentError>;

    /// Reads the image's declared entrypoint, used to synthesise the
    /// spin-wait wrapper for `InitNetworkAfterStart` (§4.2 step 8).
    async fn image_entrypoint(&self, image: &str) -> Result<Vec<String>, DeploymentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_and_volume_names_follow_convention() {
        assert_eq!(container_name(InstanceId::new(0x1234)), "flecs-00001234");
        assert_eq!(
            volume_engine_name(InstanceId::new(0x1234), "data"),
            "flecs-00001234-data"
        );
    }

    #[test]
    fn ipvlan_requires_parent_adapter() {
        assert!(NetworkType::IpvlanL2.requires_parent_adapter());
        assert!(!NetworkType::Bridge.requires_parent_adapter());
    }
}
