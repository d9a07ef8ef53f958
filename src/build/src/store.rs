//! Content-addressed blob store.
//!
//! Blobs live under `<root>/blobs/sha256/<hex>`. Writes go to
//! `<root>/tmp/<uuid>` first and are renamed into place, so a reader never
//! observes a partial blob and racing writers of the same content converge
//! on one file.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use strata_core::error::{BuildError, Result};

use crate::digest::Digest;

/// Disk-backed content store. Cheap to clone; safe to share across builds.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [root.join("blobs").join("sha256"), root.join("tmp")] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                BuildError::Store(format!(
                    "Failed to create store directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location of a blob.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join("sha256").join(digest.hex())
    }

    /// Store bytes, returning their digest. Idempotent.
    pub fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::of(data);
        let target = self.blob_path(&digest);
        if target.is_file() {
            return Ok(digest);
        }

        let tmp = self.root.join("tmp").join(uuid::Uuid::new_v4().to_string());
        std::fs::write(&tmp, data).map_err(|e| {
            BuildError::Store(format!("Failed to write blob {}: {}", tmp.display(), e))
        })?;
        if let Err(e) = std::fs::rename(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(BuildError::Store(format!(
                "Failed to commit blob {}: {}",
                digest, e
            )));
        }

        tracing::trace!(digest = %digest, size = data.len(), "Stored blob");
        Ok(digest)
    }

    /// Read a blob. Fails with `NotFound` when absent.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        match std::fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BuildError::NotFound(digest.to_string()))
            }
            Err(e) => Err(BuildError::Store(format!(
                "Failed to read blob {}: {}",
                digest, e
            ))),
        }
    }

    pub fn has(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Size of a stored blob in bytes.
    pub fn size(&self, digest: &Digest) -> Result<u64> {
        std::fs::metadata(self.blob_path(digest))
            .map(|m| m.len())
            .map_err(|_| BuildError::NotFound(digest.to_string()))
    }

    /// Serialize a value as JSON and store it.
    pub fn put_json<T: Serialize>(&self, value: &T) -> Result<Digest> {
        let bytes = serde_json::to_vec(value)?;
        self.put(&bytes)
    }

    /// Load and deserialize a JSON blob.
    pub fn get_json<T: DeserializeOwned>(&self, digest: &Digest) -> Result<T> {
        let bytes = self.get(digest)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Every digest currently stored, sorted.
    pub fn list(&self) -> Result<Vec<Digest>> {
        let dir = self.root.join("blobs").join("sha256");
        let read_dir = std::fs::read_dir(&dir).map_err(|e| {
            BuildError::Store(format!("Failed to read {}: {}", dir.display(), e))
        })?;

        let mut digests = Vec::new();
        for entry in read_dir.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            match format!("sha256:{}", name).parse::<Digest>() {
                Ok(digest) => digests.push(digest),
                Err(e) => tracing::warn!(file = %name, error = %e, "Skipping foreign file in blob store"),
            }
        }
        digests.sort();
        Ok(digests)
    }

    /// Delete a blob. Returns whether it existed.
    pub fn remove(&self, digest: &Digest) -> Result<bool> {
        match std::fs::remove_file(self.blob_path(digest)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BuildError::Store(format!(
                "Failed to remove blob {}: {}",
                digest, e
            ))),
        }
    }

    /// Total bytes held by all blobs.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0;
        for digest in self.list()? {
            total += self.size(&digest).unwrap_or(0);
        }
        Ok(total)
    }
}
