use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub manifests: ManifestsConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub containers: ContainerConfig,
    #[serde(default)]
    pub floxy: FloxyConfig,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DaemonConfig {
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    #[serde(default = "default_http_bind")]
    pub http_bind: std::net::SocketAddr,
    #[serde(default = "default_log")]
    pub log: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            http_bind: default_http_bind(),
            log: default_log(),
        }
    }
}

fn default_data_root() -> PathBuf {
    "/var/lib/flecs".into()
}

fn default_http_bind() -> std::net::SocketAddr {
    ([127, 0, 0, 1], 8951).into()
}

fn default_log() -> String {
    "flecsd=info".to_owned()
}

#[derive(Debug, Deserialize)]
pub(crate) struct ManifestsConfig {
    #[serde(default = "default_manifests_path")]
    pub storage_path: PathBuf,
}

impl Default for ManifestsConfig {
    fn default() -> Self {
        Self {
            storage_path: default_manifests_path(),
        }
    }
}

fn default_manifests_path() -> PathBuf {
    "/var/lib/flecs/manifests".into()
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConsoleConfig {
    #[serde(default = "default_console_url")]
    pub base_url: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            base_url: default_console_url(),
        }
    }
}

fn default_console_url() -> String {
    "https://console.flecs.tech".to_owned()
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContainerConfig {
    #[serde(default = "default_docker_path")]
    pub docker_path: PathBuf,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            docker_path: default_docker_path(),
        }
    }
}

fn default_docker_path() -> PathBuf {
    "docker".into()
}

#[derive(Debug, Deserialize)]
pub(crate) struct FloxyConfig {
    #[serde(default = "default_nginx_path")]
    pub nginx_path: PathBuf,
}

impl Default for FloxyConfig {
    fn default() -> Self {
        Self {
            nginx_path: default_nginx_path(),
        }
    }
}

fn default_nginx_path() -> PathBuf {
    "nginx".into()
}
