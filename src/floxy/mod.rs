//! C3: the nginx reverse-proxy controller.
//!
//! Two snippet kinds live under `<root>/floxy/`: per-instance location
//! blocks for reverse-proxy-aware editors, and per-port `server` blocks for
//! editors that aren't. Writes are diffed against disk so nginx is reloaded
//! only when a snippet actually changes, minimising churn on the running
//! proxy.

use std::net::{IpAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FloxyError {
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no free host port available")]
    PortsExhausted,
    #[error("nginx reload failed: {0}")]
    ReloadFailed(String),
}

pub struct EditorPort {
    pub container_port: u16,
    pub dest_port: u16,
    pub name: String,
    pub supports_reverse_proxy: bool,
}

pub struct Floxy {
    base_path: Mutex<Option<PathBuf>>,
    nginx_path: PathBuf,
}

impl Floxy {
    pub fn new<P: AsRef<Path>>(nginx_path: P) -> Self {
        Self {
            base_path: Mutex::new(None),
            nginx_path: nginx_path.as_ref().into(),
        }
    }

    /// Sets the snippet root and wipes the server-snippet directory: server
    /// snippets represent host ports allocated for the previous process
    /// lifetime and do not survive a restart.
    pub fn base_path<P: AsRef<Path>>(&self, root: P) -> Result<(), FloxyError> {
        let root = root.as_ref();
        let instances_dir = root.join("instances");
        let servers_dir = root.join("servers");
        std::fs::create_dir_all(&instances_dir)?;

        if servers_dir.exists() {
            std::fs::remove_dir_all(&servers_dir)?;
        }
        std::fs::create_dir_all(&servers_dir)?;

        *self.base_path.lock().expect("lock poisoned") = Some(root.to_path_buf());
        Ok(())
    }

    fn require_base(&self) -> PathBuf {
        self.base_path
            .lock()
            .expect("lock poisoned")
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn instance_snippet_path(&self, app: &str, instance_id_hex: &str) -> PathBuf {
        self.require_base()
            .join("instances")
            .join(format!("{app}-{instance_id_hex}.conf"))
    }

    fn server_snippet_path(&self, app: &str, instance_id_hex: &str, host_port: u16) -> PathBuf {
        self.require_base()
            .join("servers")
            .join(format!("{app}-{instance_id_hex}_{host_port}.conf"))
    }

    /// Writes the combined location block for every reverse-proxy-aware
    /// editor port of one instance. A no-op if the instance has none.
    pub async fn write_instance_snippet(
        &self,
        app: &str,
        instance_id_hex: &str,
        instance_ip: IpAddr,
        ports: &[EditorPort],
    ) -> Result<(), FloxyError> {
        let proxied: Vec<_> = ports.iter().filter(|p| p.supports_reverse_proxy).collect();
        let path = self.instance_snippet_path(app, instance_id_hex);
        if proxied.is_empty() {
            return self.remove_if_present(&path).await;
        }

        let mut content = String::new();
        for port in &proxied {
            content.push_str(&format!(
                "location /v2/instances/{instance_id_hex}/editor/{} {{\n",
                port.container_port
            ));
            content.push_str(&format!(
                "    proxy_pass http://{instance_ip}:{};\n",
                port.dest_port
            ));
            content.push_str("    proxy_http_version 1.1;\n");
            content.push_str("    proxy_set_header Upgrade $http_upgrade;\n");
            content.push_str("    proxy_set_header Connection \"upgrade\";\n");
            content.push_str("    proxy_set_header Host $host;\n");
            content.push_str("    proxy_set_header X-Real-IP $remote_addr;\n");
            content.push_str("    proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
            content.push_str("}\n");
        }

        self.write_if_changed(&path, &content).await
    }

    /// Writes one `server {}` block for a single non-proxy-aware editor port
    /// and returns the host port it was bound to (the caller-supplied one).
    pub async fn write_server_snippet(
        &self,
        app: &str,
        instance_id_hex: &str,
        instance_ip: IpAddr,
        host_port: u16,
        dest_port: u16,
    ) -> Result<(), FloxyError> {
        let path = self.server_snippet_path(app, instance_id_hex, host_port);
        let content = format!(
            "server {{\n    listen {host_port};\n    location / {{\n        proxy_pass http://{instance_ip}:{dest_port};\n        proxy_http_version 1.1;\n        proxy_set_header Upgrade $http_upgrade;\n        proxy_set_header Connection \"upgrade\";\n    }}\n}}\n"
        );
        self.write_if_changed(&path, &content).await
    }

    pub async fn delete_server_snippets(
        &self,
        app: &str,
        instance_id_hex: &str,
    ) -> Result<(), FloxyError> {
        let dir = self.require_base().join("servers");
        let prefix = format!("{app}-{instance_id_hex}_");
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                std::fs::remove_file(entry.path())?;
            }
        }
        self.reload().await
    }

    pub async fn delete_instance_snippet(
        &self,
        app: &str,
        instance_id_hex: &str,
    ) -> Result<(), FloxyError> {
        let path = self.instance_snippet_path(app, instance_id_hex);
        self.remove_if_present(&path).await
    }

    async fn remove_if_present(&self, path: &Path) -> Result<(), FloxyError> {
        if path.exists() {
            std::fs::remove_file(path)?;
            self.reload().await?;
        }
        Ok(())
    }

    async fn write_if_changed(&self, path: &Path, content: &str) -> Result<(), FloxyError> {
        let existing = std::fs::read_to_string(path).ok();
        if existing.as_deref() == Some(content) {
            debug!(?path, "snippet unchanged, skipping reload");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("conf.new");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        self.reload().await
    }

    async fn reload(&self) -> Result<(), FloxyError> {
        let output = Command::new(&self.nginx_path)
            .arg("-s")
            .arg("reload")
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            warn!(%stderr, "nginx reload failed");
            return Err(FloxyError::ReloadFailed(stderr));
        }
        info!("nginx reloaded");
        Ok(())
    }

    /// Binds to an ephemeral port, reads it back, then releases it. There is
    /// an inherent race between release and the caller's own bind; see the
    /// concurrency notes on host port allocation.
    pub fn free_host_port(&self) -> Result<u16, FloxyError> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).map_err(|_| FloxyError::PortsExhausted)?;
        let port = listener.local_addr()?.port();
        drop(listener);
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_if_changed_skips_identical_content() {
        let tmp = tempfile::tempdir().unwrap();
        let floxy = Floxy::new("/bin/true");
        floxy.base_path(tmp.path()).unwrap();

        let path = floxy.instance_snippet_path("demo", "00000001");
        std::fs::write(&path, "same\n").unwrap();

        // nginx_path points at /bin/true so reload always "succeeds"; this
        // only matters if a reload is actually attempted.
        floxy.write_if_changed(&path, "same\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "same\n");
    }

    #[test]
    fn free_host_port_returns_a_bindable_port() {
        let floxy = Floxy::new("/bin/true");
        let port = floxy.free_host_port().unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn base_path_wipes_server_snippets_but_keeps_instance_snippets() {
        let tmp = tempfile::tempdir().unwrap();
        let floxy = Floxy::new("/bin/true");
        floxy.base_path(tmp.path()).unwrap();

        std::fs::write(tmp.path().join("servers/stale.conf"), "x").unwrap();
        std::fs::write(tmp.path().join("instances/demo-1.conf"), "x").unwrap();

        floxy.base_path(tmp.path()).unwrap();
        assert!(!tmp.path().join("servers/stale.conf").exists());
        assert!(tmp.path().join("instances/demo-1.conf").exists());
    }
}
