//! The validated form of a user-supplied app manifest (§3, §4.1 of the design).

mod ports;
pub(crate) mod store;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app_key::{AppKey, AppKeyError, AppName};

pub use ports::{PortRange, PortRangeError};
pub use store::{ManifestStore, ManifestStoreError};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid app key: {0}")]
    Key(#[from] AppKeyError),
    #[error("manifest has an empty `image` field")]
    EmptyImage,
    #[error("duplicate environment variable key `{0}`")]
    DuplicateEnvKey(String),
    #[error("malformed environment variable `{0}`, expected KEY=VALUE")]
    MalformedEnvVar(String),
    #[error("hostname `{hostname}` cannot be set on a multi-instance app")]
    HostnameOnMultiInstance { hostname: String },
    #[error("malformed conffile entry `{0}`, expected local:container[:mode]")]
    MalformedConffile(String),
    #[error(transparent)]
    PortRange(#[from] PortRangeError),
    #[error("yaml manifest could not be parsed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json manifest could not be parsed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Whitelisted Linux capabilities, plus the `DOCKER` pseudo-capability meaning
/// "mount the container engine's control socket into the instance".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "NET_ADMIN")]
    NetAdmin,
    #[serde(rename = "SYS_NICE")]
    SysNice,
    #[serde(rename = "IPC_LOCK")]
    IpcLock,
    #[serde(rename = "NET_RAW")]
    NetRaw,
    #[serde(rename = "DOCKER")]
    Docker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum StartupOption {
    InitNetworkAfterStart,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl EnvVar {
    pub fn parse(raw: &str) -> Result<Self, ManifestError> {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| ManifestError::MalformedEnvVar(raw.to_owned()))?;
        if key.is_empty() {
            return Err(ManifestError::MalformedEnvVar(raw.to_owned()));
        }
        Ok(Self {
            key: key.to_owned(),
            value: value.to_owned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conffile {
    pub local: String,
    pub container: String,
    pub mode: Option<u32>,
}

impl Conffile {
    pub fn parse(raw: &str) -> Result<Self, ManifestError> {
        let mut parts = raw.split(':');
        let local = parts.next().filter(|s| !s.is_empty());
        let container = parts.next().filter(|s| !s.is_empty());
        let (Some(local), Some(container)) = (local, container) else {
            return Err(ManifestError::MalformedConffile(raw.to_owned()));
        };
        let mode = match parts.next() {
            Some(mode_str) => Some(
                u32::from_str_radix(mode_str, 8)
                    .map_err(|_| ManifestError::MalformedConffile(raw.to_owned()))?,
            ),
            None => None,
        };
        if parts.next().is_some() {
            return Err(ManifestError::MalformedConffile(raw.to_owned()));
        }
        Ok(Self {
            local: local.to_owned(),
            container: container.to_owned(),
            mode,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Volume {
    /// `name:/container/path` — engine-managed, keyed by instance.
    Named { name: String, path: String },
    /// `/host/path:/container/path` — passed through verbatim.
    Bind { host: String, path: String },
}

impl Volume {
    pub fn parse(raw: &str) -> Result<Self, ManifestError> {
        let (left, path) = raw
            .split_once(':')
            .ok_or_else(|| ManifestError::MalformedConffile(raw.to_owned()))?;
        if left.starts_with('/') {
            Ok(Volume::Bind {
                host: left.to_owned(),
                path: path.to_owned(),
            })
        } else {
            Ok(Volume::Named {
                name: left.to_owned(),
                path: path.to_owned(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorConfig {
    pub name: String,
    #[serde(default, rename = "supportsReverseProxy")]
    pub supports_reverse_proxy: bool,
}

/// The validated declarative description of an [`crate::apps::App`].
///
/// Canonical on-disk form is JSON; [`Manifest::from_yaml_str`] accepts the
/// legacy YAML form and converts transparently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub app: AppName,
    pub version: String,
    pub image: String,

    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub conffiles: Vec<Conffile>,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub editors: BTreeMap<u16, EditorConfig>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, rename = "multiInstance")]
    pub multi_instance: bool,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortRange>,
    #[serde(default, rename = "startupOptions")]
    pub startup_options: BTreeSet<StartupOption>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl Manifest {
    pub fn key(&self) -> AppKey {
        AppKey {
            name: self.app.clone(),
            version: self.version.clone(),
        }
    }

    pub fn image_with_tag(&self) -> String {
        format!("{}:{}", self.image, self.version)
    }

    pub fn default_network(&self) -> Option<&str> {
        self.networks.first().map(String::as_str)
    }

    pub fn named_volume_names(&self) -> Vec<String> {
        self.volumes
            .iter()
            .filter_map(|v| match v {
                Volume::Named { name, .. } => Some(name.clone()),
                Volume::Bind { .. } => None,
            })
            .collect()
    }

    pub fn volume_container_path(&self, name: &str) -> Option<String> {
        self.volumes.iter().find_map(|v| match v {
            Volume::Named { name: n, path } if n == name => Some(path.clone()),
            _ => None,
        })
    }

    pub fn bind_mounts(&self) -> Vec<(String, String)> {
        self.volumes
            .iter()
            .filter_map(|v| match v {
                Volume::Bind { host, path } => Some((host.clone(), path.clone())),
                Volume::Named { .. } => None,
            })
            .collect()
    }

    pub fn init_network_after_start(&self) -> bool {
        self.startup_options.contains(&StartupOption::InitNetworkAfterStart)
    }

    /// Validates cross-field invariants that `serde` cannot express on its own.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.image.trim().is_empty() {
            return Err(ManifestError::EmptyImage);
        }

        if !self.hostname.is_empty() && self.multi_instance {
            return Err(ManifestError::HostnameOnMultiInstance {
                hostname: self.hostname.clone(),
            });
        }

        let mut seen = BTreeSet::new();
        for env in &self.env {
            if !seen.insert(env.key.clone()) {
                return Err(ManifestError::DuplicateEnvKey(env.key.clone()));
            }
        }

        Ok(())
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_json::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Accepts the legacy YAML manifest form, which shares field names with
    /// the JSON form, and transparently converts it.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_yaml::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_json_string(&self) -> Result<String, ManifestError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json(name: &str) -> String {
        format!(
            r#"{{"app":"{name}","version":"1.0.0","image":"library/demo"}}"#,
        )
    }

    #[test]
    fn parses_minimal_manifest() {
        let manifest = Manifest::from_json_str(&minimal_json("tech.flecs.demo")).unwrap();
        assert_eq!(manifest.app.as_str(), "tech.flecs.demo");
        assert_eq!(manifest.image_with_tag(), "library/demo:1.0.0");
    }

    #[test]
    fn round_trips_through_json() {
        let manifest = Manifest::from_json_str(&minimal_json("tech.flecs.demo")).unwrap();
        let json = manifest.to_json_string().unwrap();
        let reparsed = Manifest::from_json_str(&json).unwrap();
        assert_eq!(manifest, reparsed);
    }

    #[test]
    fn rejects_hostname_with_multi_instance() {
        let raw = r#"{
            "app": "tech.flecs.demo",
            "version": "1.0.0",
            "image": "library/demo",
            "hostname": "demo-host",
            "multiInstance": true
        }"#;
        let manifest: Manifest = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::HostnameOnMultiInstance { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_env_keys() {
        let raw = r#"{
            "app": "tech.flecs.demo",
            "version": "1.0.0",
            "image": "library/demo",
            "env": [
                {"key": "FOO", "value": "1"},
                {"key": "FOO", "value": "2"}
            ]
        }"#;
        let manifest: Manifest = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::DuplicateEnvKey(key)) if key == "FOO"
        ));
    }

    #[test]
    fn accepts_legacy_yaml_form() {
        let yaml = "app: tech.flecs.demo\nversion: 1.0.0\nimage: library/demo\n";
        let manifest = Manifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.app.as_str(), "tech.flecs.demo");
    }

    #[test]
    fn parses_conffile_with_octal_mode() {
        let conffile = Conffile::parse("config.yml:/etc/app/config.yml:644").unwrap();
        assert_eq!(conffile.mode, Some(0o644));
    }

    #[test]
    fn parses_named_and_bind_volumes() {
        assert!(matches!(
            Volume::parse("data:/var/lib/data").unwrap(),
            Volume::Named { .. }
        ));
        assert!(matches!(
            Volume::parse("/srv/data:/var/lib/data").unwrap(),
            Volume::Bind { .. }
        ));
    }
}
