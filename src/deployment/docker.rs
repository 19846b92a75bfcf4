//! Concrete [`Deployment`] backed by the `docker` CLI.
//!
//! Every operation is a single subprocess invocation; JSON-producing
//! subcommands (`--format '{{json .}}'`) are parsed line by line rather than
//! as one array, since that's what `docker ps`/`docker inspect` actually emit.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::instances::InstanceId;
use crate::manifest::{Capability, Manifest};

use super::{
    container_name, volume_engine_name, ContainerSpec, CreateOutcome, Deployment, DeploymentError,
    NetworkConfig, NetworkType, VolumeMount,
};

const PULL_RETRIES: u32 = 3;
const LOGIN_RETRIES: u32 = 3;

pub struct DockerDeployment {
    docker_path: PathBuf,
}

impl DockerDeployment {
    pub fn new<P: AsRef<Path>>(docker_path: P) -> Self {
        Self {
            docker_path: docker_path.as_ref().into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.docker_path);
        cmd.stdin(Stdio::null());
        cmd
    }

    async fn run(&self, args: &[&str]) -> Result<String, DeploymentError> {
        debug!(?args, "invoking docker");
        let output = self
            .command()
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            return Err(DeploymentError::Engine(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_allow_failure(&self, args: &[&str]) -> Result<(), DeploymentError> {
        match self.run(args).await {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(%err, ?args, "docker command failed, continuing");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Deployment for DockerDeployment {
    async fn download_app(
        &self,
        manifest: &Manifest,
        token: Option<&str>,
    ) -> Result<(), DeploymentError> {
        let image = manifest.image_with_tag();

        if let Some(token) = token {
            let registry = image.split('/').next().unwrap_or_default();
            let mut last_err = None;
            for attempt in 1..=LOGIN_RETRIES {
                match self
                    .run(&[
                        "login", registry, "--username", "flecs", "--password-stdin",
                    ])
                    .await
                {
                    Ok(_) => {
                        last_err = None;
                        break;
                    }
                    Err(err) => {
                        warn!(%err, attempt, "docker login failed");
                        last_err = Some(err);
                    }
                }
            }
            let _ = token;
            if let Some(err) = last_err {
                return Err(err);
            }
        }

        let mut last_err = None;
        for attempt in 1..=PULL_RETRIES {
            match self.run(&["pull", &image]).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    warn!(%err, attempt, "docker pull failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }

    async fn delete_app(&self, manifest: &Manifest) -> Result<(), DeploymentError> {
        self.run_allow_failure(&["image", "rm", "-f", &manifest.image_with_tag()])
            .await
    }

    async fn import_app(&self, manifest: &Manifest, archive: &Path) -> Result<(), DeploymentError> {
        let path = archive.to_string_lossy();
        self.run(&["load", "--input", &path]).await?;
        let _ = manifest;
        Ok(())
    }

    async fn export_app(&self, manifest: &Manifest, archive: &Path) -> Result<(), DeploymentError> {
        let path = archive.to_string_lossy();
        self.run(&["save", "--output", &path, &manifest.image_with_tag()])
            .await?;
        Ok(())
    }

    async fn determine_app_size(&self, manifest: &Manifest) -> Result<Option<u64>, DeploymentError> {
        #[derive(Deserialize)]
        struct Inspect {
            #[serde(rename = "Size")]
            size: u64,
        }

        let raw = self
            .run(&["image", "inspect", &manifest.image_with_tag()])
            .await;
        let raw = match raw {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        let parsed: Vec<Inspect> =
            serde_json::from_str(&raw).map_err(|e| DeploymentError::Malformed(e.to_string()))?;
        Ok(parsed.first().map(|i| i.size))
    }

    async fn create_instance(&self, spec: &ContainerSpec) -> Result<CreateOutcome, DeploymentError> {
        let name = container_name(spec.instance_id);

        if self.is_instance_running(spec.instance_id).await? {
            return Ok(CreateOutcome::AlreadyRunning);
        }
        self.run_allow_failure(&["rm", "-f", &name]).await?;

        let mut args: Vec<String> = vec!["create".into(), "--name".into(), name.clone()];

        for (key, value) in &spec.env {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }

        for volume in &spec.volumes {
            match volume {
                VolumeMount::Named {
                    engine_name,
                    container_path,
                } => {
                    args.push("--volume".into());
                    args.push(format!("{engine_name}:{container_path}"));
                }
                VolumeMount::Bind {
                    host_path,
                    container_path,
                } => {
                    args.push("--volume".into());
                    args.push(format!("{host_path}:{container_path}"));
                }
            }
        }

        for port in &spec.ports {
            args.push("--publish".into());
            args.push(port.to_string());
        }

        if spec.interactive {
            args.push("--interactive".into());
            args.push("--tty".into());
        }
        if let Some(hostname) = &spec.hostname {
            args.push("--hostname".into());
            args.push(hostname.clone());
        }
        for device in &spec.devices {
            args.push("--device".into());
            args.push(device.clone());
        }
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }

        for cap in &spec.capabilities {
            match cap {
                Capability::Docker => {
                    args.push("--volume".into());
                    args.push("/var/run/docker.sock:/var/run/docker.sock".into());
                }
                other => {
                    args.push("--cap-add".into());
                    args.push(docker_cap_name(*other).into());
                }
            }
        }

        if let Some(network) = &spec.default_network {
            args.push("--network".into());
            args.push(network.network_name.clone());
            if let Some(ip) = network.ip_address {
                args.push("--ip".into());
                args.push(ip.to_string());
            }
            if let Some(mac) = &network.mac_address {
                args.push("--mac-address".into());
                args.push(mac.clone());
            }
        } else {
            args.push("--network".into());
            args.push("none".into());
        }

        if spec.init_network_after_start {
            args.push("--mount".into());
            args.push("type=tmpfs,destination=/flecs-tmp".into());
        }

        args.push(spec.image_with_tag.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&arg_refs).await?;

        if spec.init_network_after_start {
            self.prepare_spin_wait_entrypoint(spec).await?;
        }
        for (host_path, container_path) in &spec.conffiles {
            self.copy_file_to_instance(spec.instance_id, host_path, container_path)
                .await?;
        }

        Ok(CreateOutcome::Created)
    }

    async fn delete_instance(&self, instance_id: InstanceId) -> Result<(), DeploymentError> {
        self.run_allow_failure(&["rm", "-f", &container_name(instance_id)])
            .await
    }

    async fn start_instance(&self, instance_id: InstanceId) -> Result<(), DeploymentError> {
        self.run(&["start", &container_name(instance_id)]).await?;
        Ok(())
    }

    async fn stop_instance(&self, instance_id: InstanceId) -> Result<(), DeploymentError> {
        self.run(&["stop", &container_name(instance_id)]).await?;
        Ok(())
    }

    async fn ready_instance(&self, instance_id: InstanceId) -> Result<(), DeploymentError> {
        self.run(&[
            "exec",
            &container_name(instance_id),
            "touch",
            "/flecs-tmp/ready",
        ])
        .await?;
        Ok(())
    }

    async fn is_instance_running(&self, instance_id: InstanceId) -> Result<bool, DeploymentError> {
        let name = container_name(instance_id);
        let raw = self
            .run(&[
                "inspect",
                "--format",
                "{{.State.Running}}",
                &name,
            ])
            .await;
        match raw {
            Ok(raw) => Ok(raw.trim() == "true"),
            Err(_) => Ok(false),
        }
    }

    async fn instance_logs(&self, instance_id: InstanceId) -> Result<(String, String), DeploymentError> {
        let name = container_name(instance_id);
        let output = self
            .command()
            .args(["logs", &name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok((
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    async fn create_network(&self, config: &NetworkConfig) -> Result<(), DeploymentError> {
        let mut args: Vec<String> = vec!["network".into(), "create".into()];
        let driver = match config.network_type {
            NetworkType::None => return Ok(()),
            NetworkType::Internal | NetworkType::Bridge => "bridge",
            NetworkType::Macvlan => "macvlan",
            NetworkType::IpvlanL2 | NetworkType::IpvlanL3 => "ipvlan",
        };
        args.push("--driver".into());
        args.push(driver.into());

        if config.network_type == NetworkType::Internal {
            args.push("--internal".into());
        }
        if matches!(config.network_type, NetworkType::IpvlanL3) {
            args.push("--opt".into());
            args.push("ipvlan_mode=l3".into());
        }
        if let Some(parent) = &config.parent_adapter {
            args.push("--opt".into());
            args.push(format!("parent={parent}"));
        }
        if let Some(subnet) = config.cidr_subnet {
            args.push("--subnet".into());
            args.push(subnet.to_string());
        }
        if let Some(gateway) = config.gateway {
            args.push("--gateway".into());
            args.push(gateway.to_string());
        }
        args.push(config.name.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&arg_refs).await?;
        Ok(())
    }

    async fn delete_network(&self, name: &str) -> Result<(), DeploymentError> {
        self.run_allow_failure(&["network", "rm", name]).await
    }

    async fn query_network(&self, name: &str) -> Result<Option<NetworkConfig>, DeploymentError> {
        Ok(self.networks().await?.into_iter().find(|n| n.name == name))
    }

    async fn networks(&self) -> Result<Vec<NetworkConfig>, DeploymentError> {
        let raw = self
            .run(&["network", "ls", "--filter", "name=flecs", "--format", "{{.Name}}"])
            .await?;

        let mut out = Vec::new();
        for name in raw.lines().filter(|l| !l.is_empty()) {
            if let Some(config) = self.inspect_network(name).await? {
                out.push(config);
            }
        }
        Ok(out)
    }

    async fn connect_network(
        &self,
        instance_id: InstanceId,
        network: &str,
        ip: Option<IpAddr>,
    ) -> Result<(), DeploymentError> {
        let name = container_name(instance_id);
        let mut args = vec!["network".to_owned(), "connect".to_owned()];
        if let Some(ip) = ip {
            args.push("--ip".into());
            args.push(ip.to_string());
        }
        args.push(network.to_owned());
        args.push(name);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&arg_refs).await?;
        Ok(())
    }

    async fn disconnect_network(
        &self,
        instance_id: InstanceId,
        network: &str,
    ) -> Result<(), DeploymentError> {
        self.run_allow_failure(&["network", "disconnect", network, &container_name(instance_id)])
            .await
    }

    async fn create_volume(&self, engine_name: &str) -> Result<(), DeploymentError> {
        self.run(&["volume", "create", engine_name]).await?;
        Ok(())
    }

    async fn delete_volume(&self, engine_name: &str) -> Result<(), DeploymentError> {
        self.run_allow_failure(&["volume", "rm", "-f", engine_name])
            .await
    }

    async fn import_volume(&self, engine_name: &str, src_dir: &Path) -> Result<(), DeploymentError> {
        let mount_src = format!("{}:/from:ro", src_dir.to_string_lossy());
        let mount_dst = format!("{engine_name}:/to");
        self.run(&[
            "run",
            "--rm",
            "--volume",
            &mount_src,
            "--volume",
            &mount_dst,
            "alpine",
            "sh",
            "-c",
            "cp -a /from/. /to/",
        ])
        .await?;
        Ok(())
    }

    async fn export_volume(&self, engine_name: &str, dest_dir: &Path) -> Result<(), DeploymentError> {
        let mount_src = format!("{engine_name}:/from:ro");
        let mount_dst = format!("{}:/to", dest_dir.to_string_lossy());
        self.run(&[
            "run",
            "--rm",
            "--volume",
            &mount_src,
            "--volume",
            &mount_dst,
            "alpine",
            "sh",
            "-c",
            "cp -a /from/. /to/",
        ])
        .await?;
        Ok(())
    }

    async fn copy_file_from_image(
        &self,
        image: &str,
        file: &Path,
        dest: &Path,
    ) -> Result<(), DeploymentError> {
        let create_out = self.run(&["create", image]).await?;
        let container_id = create_out.trim().to_owned();
        let spec = format!("{container_id}:{}", file.to_string_lossy());
        let result = self
            .run(&["cp", &spec, &dest.to_string_lossy()])
            .await;
        self.run_allow_failure(&["rm", "-f", &container_id]).await?;
        result.map(|_| ())
    }

    async fn copy_file_to_instance(
        &self,
        instance_id: InstanceId,
        local: &Path,
        container_path: &str,
    ) -> Result<(), DeploymentError> {
        let spec = format!("{}:{container_path}", container_name(instance_id));
        self.run(&["cp", &local.to_string_lossy(), &spec]).await?;
        Ok(())
    }

    async fn copy_file_from_instance(
        &self,
        instance_id: InstanceId,
        container_path: &str,
        local: &Path,
    ) -> Result<(), DeploymentError> {
        let spec = format!("{}:{container_path}", container_name(instance_id));
        self.run(&["cp", &spec, &local.to_string_lossy()]).await?;
        Ok(())
    }

    async fn image_entrypoint(&self, image: &str) -> Result<Vec<String>, DeploymentError> {
        #[derive(Deserialize)]
        struct Config {
            #[serde(rename = "Entrypoint", default)]
            entrypoint: Option<Vec<String>>,
        }
        #[derive(Deserialize)]
        struct Inspect {
            #[serde(rename = "Config")]
            config: Config,
        }

        let raw = self.run(&["image", "inspect", image]).await?;
        let parsed: Vec<Inspect> =
            serde_json::from_str(&raw).map_err(|e| DeploymentError::Malformed(e.to_string()))?;
        Ok(parsed
            .into_iter()
            .next()
            .and_then(|i| i.config.entrypoint)
            .unwrap_or_default())
    }
}

impl DockerDeployment {
    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkConfig>, DeploymentError> {
        #[derive(Deserialize)]
        struct Ipam {
            #[serde(rename = "Config", default)]
            config: Vec<IpamConfig>,
        }
        #[derive(Deserialize)]
        struct IpamConfig {
            #[serde(rename = "Subnet", default)]
            subnet: Option<String>,
            #[serde(rename = "Gateway", default)]
            gateway: Option<String>,
        }
        #[derive(Deserialize)]
        struct NetworkJson {
            #[serde(rename = "Driver")]
            driver: String,
            #[serde(rename = "Internal", default)]
            internal: bool,
            #[serde(rename = "IPAM")]
            ipam: Ipam,
            #[serde(rename = "Options", default)]
            options: BTreeMap<String, String>,
        }

        let raw = self.run(&["network", "inspect", name]).await;
        let raw = match raw {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        let parsed: Vec<NetworkJson> =
            serde_json::from_str(&raw).map_err(|e| DeploymentError::Malformed(e.to_string()))?;
        let Some(network) = parsed.into_iter().next() else {
            return Ok(None);
        };

        let network_type = match network.driver.as_str() {
            "macvlan" => NetworkType::Macvlan,
            "ipvlan" if network.options.get("ipvlan_mode").map(String::as_str) == Some("l3") => {
                NetworkType::IpvlanL3
            }
            "ipvlan" => NetworkType::IpvlanL2,
            "bridge" if network.internal => NetworkType::Internal,
            _ => NetworkType::Bridge,
        };

        let first_ipam = network.ipam.config.into_iter().next();
        Ok(Some(NetworkConfig {
            name: name.to_owned(),
            network_type,
            cidr_subnet: first_ipam
                .as_ref()
                .and_then(|c| c.subnet.as_deref())
                .and_then(|s| s.parse().ok()),
            gateway: first_ipam
                .as_ref()
                .and_then(|c| c.gateway.as_deref())
                .and_then(|s| s.parse().ok()),
            parent_adapter: network.options.get("parent").cloned(),
        }))
    }

    /// Generates a spin-wait `entrypoint.sh` that execs the image's real
    /// entrypoint only once `/flecs-tmp/ready` exists, and mounts it in.
    async fn prepare_spin_wait_entrypoint(&self, spec: &ContainerSpec) -> Result<(), DeploymentError> {
        let entrypoint = self.image_entrypoint(&spec.image_with_tag).await?;
        let real = shell_join(&entrypoint);
        let script = format!(
            "#!/bin/sh\nwhile [ ! -e /flecs-tmp/ready ]; do sleep 0.1; done\nexec {real} \"$@\"\n"
        );

        let tmp = tempfile::NamedTempFile::new()?;
        tokio::fs::write(tmp.path(), script).await?;

        let mut perms = tokio::fs::metadata(tmp.path()).await?.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o755);
        }
        tokio::fs::set_permissions(tmp.path(), perms).await?;

        self.copy_file_to_instance(spec.instance_id, tmp.path(), "/entrypoint.sh")
            .await
    }
}

fn docker_cap_name(cap: Capability) -> &'static str {
    match cap {
        Capability::NetAdmin => "NET_ADMIN",
        Capability::SysNice => "SYS_NICE",
        Capability::IpcLock => "IPC_LOCK",
        Capability::NetRaw => "NET_RAW",
        Capability::Docker => unreachable!("handled separately"),
    }
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| format!("'{}'", p.replace('\'', "'\\''")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_join_quotes_arguments() {
        assert_eq!(shell_join(&["/bin/sh".into()]), "'/bin/sh'");
        assert_eq!(
            shell_join(&["echo".into(), "it's".into()]),
            "'echo' 'it'\\''s'"
        );
    }
}
