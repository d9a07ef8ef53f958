//! Image references: human tags pointing at manifest digests.
//!
//! Stored as a single `refs.json` under the cache root and rewritten
//! atomically (tmp + rename) on every change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strata_core::error::{BuildError, Result};

use crate::digest::Digest;
use crate::store::ContentStore;

/// A tagged image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefEntry {
    pub manifest: Digest,
    pub tagged_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RefsFile {
    refs: BTreeMap<String, RefEntry>,
}

/// Tag → manifest mapping.
pub struct RefStore {
    path: PathBuf,
    tmp_dir: PathBuf,
    refs: Mutex<BTreeMap<String, RefEntry>>,
}

impl RefStore {
    /// Open `<root>/refs.json`, starting empty when it does not exist.
    pub fn open(root: &Path) -> Result<Self> {
        let path = root.join("refs.json");
        let tmp_dir = root.join("tmp");
        std::fs::create_dir_all(&tmp_dir).map_err(|e| {
            BuildError::Store(format!("Failed to create {}: {}", tmp_dir.display(), e))
        })?;

        let refs = if path.is_file() {
            let content = std::fs::read(&path).map_err(|e| {
                BuildError::Store(format!("Failed to read {}: {}", path.display(), e))
            })?;
            serde_json::from_slice::<RefsFile>(&content)?.refs
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            tmp_dir,
            refs: Mutex::new(refs),
        })
    }

    /// Point `tag` at `manifest`, replacing any previous target.
    pub fn tag(&self, tag: &str, manifest: &Digest) -> Result<String> {
        let tag = normalize_tag(tag)?;
        let mut refs = self.refs.lock();
        refs.insert(
            tag.clone(),
            RefEntry {
                manifest: manifest.clone(),
                tagged_at: Utc::now(),
            },
        );
        self.persist(&refs)?;
        tracing::info!(tag = %tag, manifest = %manifest, "Tagged image");
        Ok(tag)
    }

    /// Manifest a tag points at.
    pub fn resolve(&self, tag: &str) -> Option<Digest> {
        let tag = normalize_tag(tag).ok()?;
        self.refs.lock().get(&tag).map(|e| e.manifest.clone())
    }

    /// Remove a tag. Returns the manifest it pointed at.
    pub fn remove(&self, tag: &str) -> Result<Option<Digest>> {
        let tag = normalize_tag(tag)?;
        let mut refs = self.refs.lock();
        let removed = refs.remove(&tag).map(|e| e.manifest);
        if removed.is_some() {
            self.persist(&refs)?;
        }
        Ok(removed)
    }

    /// All tags, sorted.
    pub fn list(&self) -> Vec<(String, RefEntry)> {
        self.refs
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Manifests referenced by at least one tag.
    pub fn manifests(&self) -> Vec<Digest> {
        let mut digests: Vec<Digest> = self
            .refs
            .lock()
            .values()
            .map(|e| e.manifest.clone())
            .collect();
        digests.sort();
        digests.dedup();
        digests
    }

    /// Resolve a user-supplied image reference: a tag, a full manifest
    /// digest, or a unique prefix of a tagged manifest's hex.
    pub fn lookup(&self, reference: &str, store: &ContentStore) -> Result<Digest> {
        if let Some(digest) = self.resolve(reference) {
            return Ok(digest);
        }
        if let Ok(digest) = reference.parse::<Digest>() {
            if store.has(&digest) {
                return Ok(digest);
            }
        }

        let prefix = reference.strip_prefix("sha256:").unwrap_or(reference);
        if prefix.len() >= 4 && prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
            let matches: Vec<Digest> = self
                .manifests()
                .into_iter()
                .filter(|d| d.hex().starts_with(prefix))
                .collect();
            if let [only] = matches.as_slice() {
                return Ok(only.clone());
            }
        }

        Err(BuildError::ImageNotFound(reference.to_string()))
    }

    fn persist(&self, refs: &BTreeMap<String, RefEntry>) -> Result<()> {
        let file = RefsFile { refs: refs.clone() };
        let json = serde_json::to_vec_pretty(&file)?;
        let tmp = self
            .tmp_dir
            .join(format!("refs-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, json).map_err(|e| {
            BuildError::Store(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            BuildError::Store(format!("Failed to update {}: {}", self.path.display(), e))
        })
    }
}

/// `name[:tag]` with the tag defaulting to `latest`.
pub fn normalize_tag(tag: &str) -> Result<String> {
    let tag = tag.trim();
    if tag.is_empty() || tag.chars().any(char::is_whitespace) {
        return Err(BuildError::Config(format!("invalid image tag '{}'", tag)));
    }
    let last_slash = tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    if tag[last_slash..].contains(':') {
        Ok(tag.to_string())
    } else {
        Ok(format!("{}:latest", tag))
    }
}
