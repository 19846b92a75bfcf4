//! C1: canonical on-disk cache of validated app manifests, keyed by `(name, version)`.
//!
//! Mirrors the teacher's `FilesystemStorage`: canonicalise the root once,
//! lay out subdirectories eagerly, and write through a `.new` temp file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::app_key::{AppKey, AppKeyError};
use crate::console::{ConsoleClient, ConsoleError};
use crate::device::SessionId;
use crate::manifest::{Manifest, ManifestError};

const MAX_DOWNLOAD_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ManifestStoreError {
    #[error("no manifest base path configured")]
    NoBasePath,
    #[error(transparent)]
    InvalidKey(#[from] AppKeyError),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] ManifestError),
    #[error("downloaded manifest exceeds the {MAX_DOWNLOAD_BYTES} byte limit")]
    NetworkSize,
    #[error("network error fetching manifest: {0}")]
    Network(#[from] reqwest::Error),
    #[error(transparent)]
    Console(#[from] ConsoleError),
    #[error("no manifest found for {0}")]
    NotFound(AppKey),
}

#[derive(Default)]
struct Cache {
    manifests: BTreeMap<AppKey, Arc<Manifest>>,
}

pub struct ManifestStore {
    base_path: Mutex<Option<PathBuf>>,
    cache: Mutex<Cache>,
    http: reqwest::Client,
}

impl ManifestStore {
    pub fn new() -> Self {
        Self {
            base_path: Mutex::new(None),
            cache: Mutex::new(Cache::default()),
            http: reqwest::Client::new(),
        }
    }

    /// Sets the on-disk root, clearing the in-memory cache. Fails closed: if
    /// `p` cannot be created/canonicalised, the base path is cleared instead
    /// of left pointing at a half-initialised directory.
    pub fn base_path<P: AsRef<Path>>(&self, p: P) -> Result<(), ManifestStoreError> {
        let mut base = self.base_path.lock().expect("lock poisoned");
        *base = None;
        self.cache.lock().expect("lock poisoned").manifests.clear();

        let p = p.as_ref();
        if !p.exists() {
            std::fs::create_dir_all(p)?;
        }
        let canonical = p.canonicalize()?;
        *base = Some(canonical);
        Ok(())
    }

    fn require_base(&self) -> Result<PathBuf, ManifestStoreError> {
        self.base_path
            .lock()
            .expect("lock poisoned")
            .clone()
            .ok_or(ManifestStoreError::NoBasePath)
    }

    fn manifest_path(base: &Path, key: &AppKey) -> PathBuf {
        base.join(key.name.as_str())
            .join(&key.version)
            .join("manifest.json")
    }

    /// Moves every direct subdirectory of the current base path into `new_p`,
    /// then switches to it. On any error, the cache is cleared and the base
    /// path left unset.
    pub fn migrate<P: AsRef<Path>>(&self, new_p: P) -> Result<(), ManifestStoreError> {
        let result = self.migrate_inner(new_p.as_ref());
        if result.is_err() {
            *self.base_path.lock().expect("lock poisoned") = None;
            self.cache.lock().expect("lock poisoned").manifests.clear();
        }
        result
    }

    fn migrate_inner(&self, new_p: &Path) -> Result<(), ManifestStoreError> {
        let old_base = self.require_base()?;

        if !new_p.exists() {
            std::fs::create_dir_all(new_p)?;
        }
        let new_base = new_p.canonicalize()?;

        for entry in std::fs::read_dir(&old_base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dest = new_base.join(entry.file_name());
            copy_dir_recursive(&entry.path(), &dest)?;
            std::fs::remove_dir_all(entry.path())?;
        }

        self.base_path(new_base)
    }

    pub fn contains(&self, key: &AppKey) -> bool {
        self.cache
            .lock()
            .expect("lock poisoned")
            .manifests
            .contains_key(key)
    }

    /// Returns the cached entry, falling back to disk on a cache miss.
    /// Returns `None` on any failure, per the teacher's fail-closed posture.
    pub fn query(&self, key: &AppKey) -> Option<Arc<Manifest>> {
        if let Some(manifest) = self.cache.lock().expect("lock poisoned").manifests.get(key) {
            return Some(manifest.clone());
        }

        let base = self.base_path.lock().expect("lock poisoned").clone()?;
        let path = Self::manifest_path(&base, key);
        let raw = std::fs::read_to_string(path).ok()?;
        let manifest = Manifest::from_json_str(&raw).ok()?;
        if &manifest.key() != key {
            return None;
        }

        let manifest = Arc::new(manifest);
        self.cache
            .lock()
            .expect("lock poisoned")
            .manifests
            .insert(key.clone(), manifest.clone());
        Some(manifest)
    }

    /// Inserts or updates a manifest, writing it to disk unless an identical
    /// file is already present. Returns whether a *new* entry was inserted.
    pub fn add(&self, manifest: Manifest) -> Result<(Arc<Manifest>, bool), ManifestStoreError> {
        manifest.validate()?;
        let base = self.require_base()?;
        let key = manifest.key();
        let path = Self::manifest_path(&base, &key);
        let json = manifest.to_json_string()?;

        let existing_matches = std::fs::read_to_string(&path).ok().as_deref() == Some(json.as_str());
        if !existing_matches {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.new");
            std::fs::write(&tmp, &json)?;
            std::fs::rename(&tmp, &path)?;
        }

        let mut cache = self.cache.lock().expect("lock poisoned");
        let inserted = !cache.manifests.contains_key(&key);
        let manifest = Arc::new(manifest);
        cache.manifests.insert(key, manifest.clone());
        Ok((manifest, inserted))
    }

    pub fn add_from_string(&self, raw: &str) -> Result<(Arc<Manifest>, bool), ManifestStoreError> {
        let manifest = match Manifest::from_json_str(raw) {
            Ok(manifest) => manifest,
            Err(_) => Manifest::from_yaml_str(raw)?,
        };
        self.add(manifest)
    }

    pub fn add_from_file<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<(Arc<Manifest>, bool), ManifestStoreError> {
        let raw = std::fs::read_to_string(path)?;
        self.add_from_string(&raw)
    }

    pub async fn add_from_url(
        &self,
        url: &str,
    ) -> Result<(Arc<Manifest>, bool), ManifestStoreError> {
        let response = self.http.get(url).send().await?;
        if let Some(len) = response.content_length() {
            if len > MAX_DOWNLOAD_BYTES {
                return Err(ManifestStoreError::NetworkSize);
            }
        }

        let bytes = response.bytes().await?;
        if bytes.len() as u64 > MAX_DOWNLOAD_BYTES {
            return Err(ManifestStoreError::NetworkSize);
        }

        let raw = String::from_utf8_lossy(&bytes);
        self.add_from_string(&raw)
    }

    pub async fn add_from_console(
        &self,
        console: &ConsoleClient,
        session: SessionId,
        key: &AppKey,
    ) -> Result<(Arc<Manifest>, bool), ManifestStoreError> {
        debug!(%key, "fetching manifest from console");
        let raw = console.fetch_manifest(session, key).await?;
        self.add_from_string(&raw)
    }

    pub fn erase(&self, key: &AppKey) -> Result<(), ManifestStoreError> {
        self.cache.lock().expect("lock poisoned").manifests.remove(key);

        let base = self.require_base()?;
        let dir = base.join(key.name.as_str()).join(&key.version);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        info!(%key, "erased manifest");
        Ok(())
    }

    pub fn remove(&self, key: &AppKey) {
        self.cache.lock().expect("lock poisoned").manifests.remove(key);
    }
}

impl Default for ManifestStore {
    fn default() -> Self {
        Self::new()
    }
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dest_path = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), &dest_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_manifest(version: &str) -> Manifest {
        let raw = format!(
            r#"{{"app":"tech.flecs.demo","version":"{version}","image":"library/demo"}}"#
        );
        Manifest::from_json_str(&raw).unwrap()
    }

    #[test]
    fn query_misses_without_base_path() {
        let store = ManifestStore::new();
        let key = AppKey::parse("tech.flecs.demo", "1.0.0").unwrap();
        assert!(store.query(&key).is_none());
    }

    #[test]
    fn add_then_query_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ManifestStore::new();
        store.base_path(tmp.path()).unwrap();

        let (manifest, inserted) = store.add(demo_manifest("1.0.0")).unwrap();
        assert!(inserted);
        assert!(store.contains(&manifest.key()));

        let path = tmp.path().join("tech.flecs.demo/1.0.0/manifest.json");
        assert!(path.exists());

        let (_, inserted_again) = store.add(demo_manifest("1.0.0")).unwrap();
        assert!(!inserted_again);
    }

    #[test]
    fn query_falls_back_to_disk_after_base_path_reset() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ManifestStore::new();
        store.base_path(tmp.path()).unwrap();
        let (manifest, _) = store.add(demo_manifest("1.0.0")).unwrap();
        let key = manifest.key();

        // Resetting the base path to the same directory clears the cache but
        // not the disk contents.
        store.base_path(tmp.path()).unwrap();
        assert!(!store.contains(&key));
        assert!(store.query(&key).is_some());
    }

    #[test]
    fn erase_removes_from_cache_and_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ManifestStore::new();
        store.base_path(tmp.path()).unwrap();
        let (manifest, _) = store.add(demo_manifest("1.0.0")).unwrap();
        let key = manifest.key();

        store.erase(&key).unwrap();
        assert!(!store.contains(&key));
        assert!(store.query(&key).is_none());
    }

    #[test]
    fn base_path_failure_fails_closed() {
        let store = ManifestStore::new();
        // A path nested under a file cannot be created.
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let bogus = tmp.path().join("subdir");
        assert!(store.base_path(bogus).is_err());
        assert!(store.base_path.lock().unwrap().is_none());
    }
}
