//! Cache index: `(parent layer, instruction canonical form) → layer`.
//!
//! Entries are held in a `DashMap` and persisted one JSON file per key under
//! `<root>/index/<key id>.json`. Recording is insert-if-absent across
//! processes: the file is published with `hard_link`, which fails if another
//! builder got there first, in which case the existing entry wins.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strata_core::error::{BuildError, Result};

use crate::digest::Digest;

/// Cache lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Layer the step builds on (`None` for the first step)
    pub parent: Option<Digest>,
    /// Instruction canonical form
    pub instruction: String,
}

impl CacheKey {
    pub fn new(parent: Option<&Digest>, instruction: impl Into<String>) -> Self {
        Self {
            parent: parent.cloned(),
            instruction: instruction.into(),
        }
    }

    /// Stable file-name-safe identifier.
    pub fn id(&self) -> String {
        let parent = self.parent.as_ref().map(Digest::as_str).unwrap_or("");
        Digest::of_parts(&[parent.as_bytes(), self.instruction.as_bytes()])
            .hex()
            .to_string()
    }
}

/// A persisted cache record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub layer: Digest,
    pub recorded_at: DateTime<Utc>,
}

/// Shared, persistent cache index.
pub struct CacheIndex {
    index_dir: PathBuf,
    tmp_dir: PathBuf,
    entries: DashMap<String, CacheEntry>,
}

impl CacheIndex {
    /// Open the index under `root`, loading every readable entry.
    pub fn open(root: &Path) -> Result<Self> {
        let index_dir = root.join("index");
        let tmp_dir = root.join("tmp");
        for dir in [&index_dir, &tmp_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                BuildError::Store(format!(
                    "Failed to create cache directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        let index = Self {
            index_dir,
            tmp_dir,
            entries: DashMap::new(),
        };
        index.load()?;
        Ok(index)
    }

    fn load(&self) -> Result<()> {
        let read_dir = std::fs::read_dir(&self.index_dir).map_err(|e| {
            BuildError::Store(format!(
                "Failed to read cache index {}: {}",
                self.index_dir.display(),
                e
            ))
        })?;

        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_entry(&path) {
                Ok(record) => {
                    self.entries.insert(record.key.id(), record);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable cache entry");
                }
            }
        }

        tracing::debug!(entries = self.entries.len(), "Loaded cache index");
        Ok(())
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.index_dir.join(format!("{}.json", id))
    }

    /// Layer recorded for `key`, if any. Falls back to disk so entries
    /// recorded by other processes are seen.
    pub fn lookup(&self, key: &CacheKey) -> Option<Digest> {
        let id = key.id();
        if let Some(entry) = self.entries.get(&id) {
            return Some(entry.layer.clone());
        }

        let record = read_entry(&self.entry_path(&id)).ok()?;
        if &record.key != key {
            tracing::warn!(id = %id, "Cache entry key does not match its file name");
            return None;
        }
        let layer = record.layer.clone();
        self.entries.insert(id, record);
        Some(layer)
    }

    /// Record `key → layer` unless an entry already exists. Returns the layer
    /// that ends up recorded (the existing one if another builder won).
    pub fn record(&self, key: &CacheKey, layer: &Digest) -> Result<Digest> {
        let id = key.id();
        let record = CacheEntry {
            key: key.clone(),
            layer: layer.clone(),
            recorded_at: Utc::now(),
        };
        let tmp = self.write_tmp(&record)?;
        let target = self.entry_path(&id);

        let outcome = std::fs::hard_link(&tmp, &target);
        let _ = std::fs::remove_file(&tmp);

        match outcome {
            Ok(()) => {
                self.entries.insert(id, record);
                tracing::debug!(layer = %layer, "Recorded cache entry");
                Ok(layer.clone())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let existing = read_entry(&target)?;
                let winner = existing.layer.clone();
                if &winner != layer {
                    tracing::debug!(ours = %layer, winner = %winner, "Cache entry already recorded; adopting it");
                }
                self.entries.insert(id, existing);
                Ok(winner)
            }
            Err(e) => Err(BuildError::Store(format!(
                "Failed to publish cache entry {}: {}",
                target.display(),
                e
            ))),
        }
    }

    /// Overwrite the entry for `key`. Used when a step is rebuilt on purpose.
    pub fn replace(&self, key: &CacheKey, layer: &Digest) -> Result<()> {
        let id = key.id();
        let record = CacheEntry {
            key: key.clone(),
            layer: layer.clone(),
            recorded_at: Utc::now(),
        };
        let tmp = self.write_tmp(&record)?;
        let target = self.entry_path(&id);
        if let Err(e) = std::fs::rename(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(BuildError::Store(format!(
                "Failed to replace cache entry {}: {}",
                target.display(),
                e
            )));
        }
        self.entries.insert(id, record);
        Ok(())
    }

    /// Drop the entry for `key`. Returns whether one existed.
    pub fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        let id = key.id();
        let in_memory = self.entries.remove(&id).is_some();
        let on_disk = remove_if_exists(&self.entry_path(&id))?;
        Ok(in_memory || on_disk)
    }

    /// Drop every entry for which `keep` returns false. Returns the number
    /// removed.
    pub fn retain(&self, keep: impl Fn(&CacheEntry) -> bool) -> Result<usize> {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !keep(e.value()))
            .map(|e| e.key().clone())
            .collect();

        for id in &doomed {
            self.entries.remove(id);
            remove_if_exists(&self.entry_path(id))?;
        }
        Ok(doomed.len())
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<usize> {
        self.retain(|_| false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all entries, oldest first.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut all: Vec<CacheEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        all
    }

    fn write_tmp(&self, record: &CacheEntry) -> Result<PathBuf> {
        let tmp = self.tmp_dir.join(format!("{}.json", uuid::Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(record)?;
        std::fs::write(&tmp, json).map_err(|e| {
            BuildError::Store(format!(
                "Failed to write cache entry {}: {}",
                tmp.display(),
                e
            ))
        })?;
        Ok(tmp)
    }
}

fn read_entry(path: &Path) -> Result<CacheEntry> {
    let content = std::fs::read(path).map_err(|e| {
        BuildError::Store(format!("Failed to read {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_slice(&content)?)
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(BuildError::Store(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn key(parent: Option<&Digest>, instruction: &str) -> CacheKey {
        CacheKey::new(parent, instruction)
    }

    #[test]
    fn test_record_and_lookup() {
        let tmp = TempDir::new().unwrap();
        let index = CacheIndex::open(tmp.path()).unwrap();
        let k = key(None, r#"FROM {"reference":"base:v1"}"#);
        let layer = Digest::of(b"layer");

        assert!(index.lookup(&k).is_none());
        assert_eq!(index.record(&k, &layer).unwrap(), layer);
        assert_eq!(index.lookup(&k), Some(layer));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_key_depends_on_parent() {
        let a = Digest::of(b"a");
        let b = Digest::of(b"b");
        assert_ne!(key(Some(&a), "RUN x").id(), key(Some(&b), "RUN x").id());
        assert_ne!(key(None, "RUN x").id(), key(Some(&a), "RUN x").id());
        assert_eq!(key(Some(&a), "RUN x").id(), key(Some(&a), "RUN x").id());
    }

    #[test]
    fn test_record_keeps_first_writer() {
        let tmp = TempDir::new().unwrap();
        let index = CacheIndex::open(tmp.path()).unwrap();
        let k = key(None, "RUN date");
        let first = Digest::of(b"first");
        let second = Digest::of(b"second");

        assert_eq!(index.record(&k, &first).unwrap(), first);
        assert_eq!(index.record(&k, &second).unwrap(), first);
        assert_eq!(index.lookup(&k), Some(first));
    }

    #[test]
    fn test_replace_overwrites() {
        let tmp = TempDir::new().unwrap();
        let index = CacheIndex::open(tmp.path()).unwrap();
        let k = key(None, "RUN date");
        index.record(&k, &Digest::of(b"old")).unwrap();
        index.replace(&k, &Digest::of(b"new")).unwrap();
        assert_eq!(index.lookup(&k), Some(Digest::of(b"new")));

        let reopened = CacheIndex::open(tmp.path()).unwrap();
        assert_eq!(reopened.lookup(&k), Some(Digest::of(b"new")));
    }

    #[test]
    fn test_persists_across_open() {
        let tmp = TempDir::new().unwrap();
        let k = key(Some(&Digest::of(b"p")), "COPY x");
        {
            let index = CacheIndex::open(tmp.path()).unwrap();
            index.record(&k, &Digest::of(b"l")).unwrap();
        }
        let index = CacheIndex::open(tmp.path()).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup(&k), Some(Digest::of(b"l")));
    }

    #[test]
    fn test_lookup_sees_other_process_entries() {
        let tmp = TempDir::new().unwrap();
        let a = CacheIndex::open(tmp.path()).unwrap();
        let b = CacheIndex::open(tmp.path()).unwrap();
        let k = key(None, "RUN true");
        b.record(&k, &Digest::of(b"from b")).unwrap();
        assert_eq!(a.lookup(&k), Some(Digest::of(b"from b")));
        // a now adopts b's entry instead of overwriting it
        assert_eq!(a.record(&k, &Digest::of(b"from a")).unwrap(), Digest::of(b"from b"));
    }

    #[test]
    fn test_concurrent_record_converges() {
        let tmp = TempDir::new().unwrap();
        let index = Arc::new(CacheIndex::open(tmp.path()).unwrap());
        let k = key(None, "RUN race");

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let index = Arc::clone(&index);
                let k = k.clone();
                std::thread::spawn(move || index.record(&k, &Digest::of(&[i])).unwrap())
            })
            .collect();
        let winners: Vec<Digest> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(winners.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(index.lookup(&k), Some(winners[0].clone()));
    }

    #[test]
    fn test_invalidate_and_clear() {
        let tmp = TempDir::new().unwrap();
        let index = CacheIndex::open(tmp.path()).unwrap();
        let k1 = key(None, "RUN a");
        let k2 = key(None, "RUN b");
        index.record(&k1, &Digest::of(b"1")).unwrap();
        index.record(&k2, &Digest::of(b"2")).unwrap();

        assert!(index.invalidate(&k1).unwrap());
        assert!(!index.invalidate(&k1).unwrap());
        assert!(index.lookup(&k1).is_none());

        assert_eq!(index.clear().unwrap(), 1);
        assert!(index.is_empty());
        assert!(CacheIndex::open(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_retain() {
        let tmp = TempDir::new().unwrap();
        let index = CacheIndex::open(tmp.path()).unwrap();
        let keep = Digest::of(b"keep");
        index.record(&key(None, "RUN a"), &keep).unwrap();
        index.record(&key(None, "RUN b"), &Digest::of(b"drop")).unwrap();

        let removed = index.retain(|e| e.layer == keep).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.entries().len(), 1);
    }

    #[test]
    fn test_corrupt_entry_skipped() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("index")).unwrap();
        std::fs::write(tmp.path().join("index").join("bad.json"), "{not json").unwrap();
        let index = CacheIndex::open(tmp.path()).unwrap();
        assert!(index.is_empty());
    }
}
