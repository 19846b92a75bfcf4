//! C7: device/session identity and license activation against the Console.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use sec::Secret;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::console::{ConsoleClient, ConsoleError};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed session file")]
    Malformed,
    #[error(transparent)]
    Console(#[from] ConsoleError),
}

/// An opaque device identity token used to authenticate against the Console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId {
    pub id: Uuid,
    pub timestamp: u64,
}

impl SessionId {
    fn generate() -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: now_unix(),
        }
    }

    fn serialize(&self) -> String {
        format!("{}\n{}\n", self.id, self.timestamp)
    }

    fn parse(raw: &str) -> Result<Self, DeviceError> {
        let mut lines = raw.lines();
        let id = lines.next().ok_or(DeviceError::Malformed)?;
        let timestamp = lines.next().ok_or(DeviceError::Malformed)?;

        Ok(Self {
            id: id.parse().map_err(|_| DeviceError::Malformed)?,
            timestamp: timestamp.parse().map_err(|_| DeviceError::Malformed)?,
        })
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

pub struct Device {
    session_path: Mutex<Option<PathBuf>>,
    session: Mutex<Option<SessionId>>,
    license_key: Mutex<Option<Secret<String>>>,
}

impl Device {
    pub fn new() -> Self {
        Self {
            session_path: Mutex::new(None),
            session: Mutex::new(None),
            license_key: Mutex::new(None),
        }
    }

    pub fn base_path<P: AsRef<Path>>(&self, root: P) -> Result<(), DeviceError> {
        let dir = root.as_ref();
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
        *self.session_path.lock().expect("lock poisoned") = Some(dir.join(".session_id"));
        Ok(())
    }

    fn path(&self) -> Option<PathBuf> {
        self.session_path.lock().expect("lock poisoned").clone()
    }

    pub fn load(&self) -> Result<(), DeviceError> {
        let Some(path) = self.path() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(path)?;
        let session = SessionId::parse(&raw)?;
        *self.session.lock().expect("lock poisoned") = Some(session);
        Ok(())
    }

    pub fn save(&self) -> Result<(), DeviceError> {
        let Some(path) = self.path() else {
            return Ok(());
        };
        let Some(session) = *self.session.lock().expect("lock poisoned") else {
            return Ok(());
        };
        let tmp = path.with_extension("new");
        std::fs::write(&tmp, session.serialize())?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Lazily generates a session id if none is present yet.
    pub fn session_id(&self) -> Result<SessionId, DeviceError> {
        if let Some(session) = *self.session.lock().expect("lock poisoned") {
            return Ok(session);
        }
        let session = SessionId::generate();
        *self.session.lock().expect("lock poisoned") = Some(session);
        self.save()?;
        Ok(session)
    }

    /// Overwrites the stored session iff `new` is a different, non-stale id.
    pub fn save_session_id(&self, new: SessionId) -> Result<(), DeviceError> {
        let should_replace = match *self.session.lock().expect("lock poisoned") {
            Some(current) => new.id != current.id && new.timestamp >= current.timestamp,
            None => true,
        };

        if should_replace {
            debug!(new_id = %new.id, "adopting fresher session id");
            *self.session.lock().expect("lock poisoned") = Some(new);
            self.save()?;
        }

        Ok(())
    }

    pub async fn activate(
        &self,
        console: &ConsoleClient,
        license_key: Option<String>,
    ) -> Result<(), DeviceError> {
        let session = self.session_id()?;
        let outcome = console.activate_license(session, license_key).await?;
        self.save_session_id(outcome.session)?;
        if let Some(key) = outcome.license_key {
            *self.license_key.lock().expect("lock poisoned") = Some(Secret::new(key));
        }
        info!("device license activated");
        Ok(())
    }

    pub async fn validate(&self, console: &ConsoleClient) -> Result<bool, DeviceError> {
        let session = self.session_id()?;
        let (is_valid, fresh_session) = console.validate_license(session).await?;
        if let Some(fresh) = fresh_session {
            self.save_session_id(fresh)?;
        }
        Ok(is_valid)
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_generated_once_and_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let device = Device::new();
        device.base_path(tmp.path()).unwrap();

        let first = device.session_id().unwrap();
        let second = device.session_id().unwrap();
        assert_eq!(first, second);

        let device2 = Device::new();
        device2.base_path(tmp.path()).unwrap();
        device2.load().unwrap();
        assert_eq!(device2.session_id().unwrap(), first);
    }

    #[test]
    fn save_session_id_ignores_stale_updates() {
        let tmp = tempfile::tempdir().unwrap();
        let device = Device::new();
        device.base_path(tmp.path()).unwrap();
        let current = device.session_id().unwrap();

        let stale = SessionId {
            id: Uuid::new_v4(),
            timestamp: current.timestamp.saturating_sub(100),
        };
        device.save_session_id(stale).unwrap();
        assert_eq!(device.session_id().unwrap(), current);

        let fresh = SessionId {
            id: Uuid::new_v4(),
            timestamp: current.timestamp + 100,
        };
        device.save_session_id(fresh).unwrap();
        assert_eq!(device.session_id().unwrap(), fresh);
    }

    #[test]
    fn save_session_id_ignores_same_id() {
        let tmp = tempfile::tempdir().unwrap();
        let device = Device::new();
        device.base_path(tmp.path()).unwrap();
        let current = device.session_id().unwrap();

        let same_id_newer_ts = SessionId {
            id: current.id,
            timestamp: current.timestamp + 1000,
        };
        device.save_session_id(same_id_newer_ts).unwrap();
        assert_eq!(device.session_id().unwrap(), current);
    }
}
