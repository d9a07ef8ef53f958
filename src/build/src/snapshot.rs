//! Filesystem snapshots and diffs.
//!
//! A [`Snapshot`] is an immutable, content-addressed tree of image paths.
//! File contents live in the content store; the snapshot records only
//! `(path → node)` entries, so two snapshots are identical iff their
//! digests are equal. Modification times are never recorded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_core::error::{BuildError, Result};

use crate::digest::Digest;
use crate::store::ContentStore;

const DEFAULT_DIR_MODE: u32 = 0o755;

/// A single entry in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Node {
    Dir { mode: u32 },
    File { mode: u32, digest: Digest, size: u64 },
    Symlink { target: String },
}

/// One entry of a layer diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Change {
    /// Path added or modified
    Upsert { path: String, node: Node },
    /// Path removed (explicit whiteout)
    Delete { path: String },
}

impl Change {
    pub fn path(&self) -> &str {
        match self {
            Change::Upsert { path, .. } | Change::Delete { path } => path,
        }
    }
}

/// Ordered set of changes between a parent snapshot and its child.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub changes: Vec<Change>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Number of explicit deletions.
    pub fn deletions(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, Change::Delete { .. }))
            .count()
    }
}

/// An immutable view of a full filesystem tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    entries: BTreeMap<String, Node>,
}

impl Snapshot {
    /// The empty tree (`scratch`).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&Node> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.entries.iter()
    }

    /// Root content hash.
    pub fn digest(&self) -> Digest {
        Digest::of(&self.canonical_bytes())
    }

    fn canonical_bytes(&self) -> Vec<u8> {
        // BTreeMap keeps the serialization ordered.
        serde_json::to_vec(&self.entries).unwrap_or_default()
    }

    /// Digests of every file blob the tree references.
    pub fn file_digests(&self) -> impl Iterator<Item = &Digest> {
        self.entries.values().filter_map(|node| match node {
            Node::File { digest, .. } => Some(digest),
            _ => None,
        })
    }

    /// Total size of file contents in bytes.
    pub fn content_size(&self) -> u64 {
        self.entries
            .values()
            .map(|node| match node {
                Node::File { size, .. } => *size,
                _ => 0,
            })
            .sum()
    }

    /// Insert a node, creating any missing parent directories and replacing
    /// whatever previously lived at (or under) `path`.
    pub fn insert(&mut self, path: &str, node: Node) {
        let path = normalize_image_path(path);
        if path == "/" {
            return;
        }
        for parent in ancestors(&path) {
            match self.entries.get(&parent) {
                Some(Node::Dir { .. }) => {}
                _ => {
                    self.remove_tree(&parent);
                    self.entries
                        .insert(parent, Node::Dir { mode: DEFAULT_DIR_MODE });
                }
            }
        }
        let replacing_dir_with_other = matches!(self.entries.get(&path), Some(Node::Dir { .. }))
            && !matches!(node, Node::Dir { .. });
        if replacing_dir_with_other {
            self.remove_tree(&path);
        }
        self.entries.insert(path, node);
    }

    /// Remove a path and everything beneath it.
    pub fn remove_tree(&mut self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.entries
            .retain(|p, _| p != path && !p.starts_with(&prefix));
    }

    /// Changes that turn `self` into `after`, in path order.
    pub fn diff(&self, after: &Snapshot) -> Diff {
        let mut changes = Vec::new();

        for (path, node) in &after.entries {
            if self.entries.get(path) != Some(node) {
                changes.push(Change::Upsert {
                    path: path.clone(),
                    node: node.clone(),
                });
            }
        }
        for path in self.entries.keys() {
            if !after.entries.contains_key(path) {
                changes.push(Change::Delete { path: path.clone() });
            }
        }

        changes.sort_by(|a, b| a.path().cmp(b.path()));
        Diff { changes }
    }

    /// Produce the child snapshot described by `diff`.
    pub fn apply(&self, diff: &Diff) -> Snapshot {
        let mut entries = self.entries.clone();
        for change in &diff.changes {
            match change {
                Change::Upsert { path, node } => {
                    entries.insert(path.clone(), node.clone());
                }
                Change::Delete { path } => {
                    entries.remove(path);
                }
            }
        }
        Snapshot { entries }
    }

    /// Persist the tree as a blob; returns its digest.
    pub fn save(&self, store: &ContentStore) -> Result<Digest> {
        store.put(&self.canonical_bytes())
    }

    /// Load a tree previously written with [`Snapshot::save`].
    pub fn load(store: &ContentStore, digest: &Digest) -> Result<Self> {
        let bytes = store.get(digest)?;
        let entries: BTreeMap<String, Node> = serde_json::from_slice(&bytes)?;
        Ok(Snapshot { entries })
    }

    /// Walk a materialized directory, storing file contents and recording
    /// every entry.
    pub fn capture(root: &Path, store: &ContentStore) -> Result<Self> {
        let mut entries = BTreeMap::new();
        walk_dir(root, root, store, &mut entries)?;
        Ok(Snapshot { entries })
    }

    /// Recreate this tree under `root` (which must exist and be empty).
    pub fn materialize(&self, root: &Path, store: &ContentStore) -> Result<()> {
        for (path, node) in &self.entries {
            let target = host_path(root, path);
            match node {
                Node::Dir { .. } => {
                    std::fs::create_dir_all(&target).map_err(|e| {
                        store_err(format!("Failed to create directory {}: {}", target.display(), e))
                    })?;
                }
                Node::File { mode, digest, .. } => {
                    let data = store.get(digest)?;
                    std::fs::write(&target, &data).map_err(|e| {
                        store_err(format!("Failed to write {}: {}", target.display(), e))
                    })?;
                    set_mode(&target, *mode)?;
                }
                Node::Symlink { target: link } => {
                    make_symlink(link, &target)?;
                }
            }
        }

        // Directory modes last (deepest first) so read-only dirs do not block
        // writing their children.
        for (path, node) in self.entries.iter().rev() {
            if let Node::Dir { mode } = node {
                set_mode(&host_path(root, path), *mode)?;
            }
        }

        tracing::debug!(
            root = %root.display(),
            entries = self.entries.len(),
            "Materialized snapshot"
        );
        Ok(())
    }
}

/// Recursively walk a directory and collect snapshot entries.
fn walk_dir(
    root: &Path,
    current: &Path,
    store: &ContentStore,
    entries: &mut BTreeMap<String, Node>,
) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        store_err(format!("Failed to read directory {}: {}", current.display(), e))
    })?;

    for entry in read_dir {
        let entry = entry.map_err(|e| store_err(format!("Failed to read directory entry: {}", e)))?;
        let path = entry.path();
        let relative = path.strip_prefix(root).map_err(|e| {
            store_err(format!(
                "Failed to compute relative path for {}: {}",
                path.display(),
                e
            ))
        })?;
        let image_path = to_image_path(relative);

        let metadata = std::fs::symlink_metadata(&path).map_err(|e| {
            store_err(format!("Failed to read metadata for {}: {}", path.display(), e))
        })?;

        if metadata.file_type().is_symlink() {
            let target = std::fs::read_link(&path).map_err(|e| {
                store_err(format!("Failed to read symlink {}: {}", path.display(), e))
            })?;
            entries.insert(
                image_path,
                Node::Symlink {
                    target: target.to_string_lossy().into_owned(),
                },
            );
        } else if metadata.is_dir() {
            entries.insert(
                image_path,
                Node::Dir {
                    mode: mode_of(&metadata, DEFAULT_DIR_MODE),
                },
            );
            walk_dir(root, &path, store, entries)?;
        } else {
            let data = std::fs::read(&path).map_err(|e| {
                store_err(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let digest = store.put(&data)?;
            entries.insert(
                image_path,
                Node::File {
                    mode: mode_of(&metadata, 0o644),
                    digest,
                    size: data.len() as u64,
                },
            );
        }
    }

    Ok(())
}

fn store_err(message: String) -> BuildError {
    BuildError::Store(message)
}

#[cfg(unix)]
pub(crate) fn mode_of(metadata: &std::fs::Metadata, _default: u32) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn mode_of(metadata: &std::fs::Metadata, default: u32) -> u32 {
    if metadata.permissions().readonly() {
        default & !0o222
    } else {
        default
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| store_err(format!("Failed to set mode on {}: {}", path.display(), e)))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(link: &str, at: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, at)
        .map_err(|e| store_err(format!("Failed to create symlink {}: {}", at.display(), e)))
}

#[cfg(not(unix))]
fn make_symlink(link: &str, at: &Path) -> Result<()> {
    tracing::warn!(link, at = %at.display(), "Symlinks are not materialized on this platform");
    Ok(())
}

// --- Image path helpers ---

/// Normalize an image path: absolute, `.`/`..` resolved (clamped at `/`),
/// no trailing slash.
pub fn normalize_image_path(p: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in p.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Resolve `p` against `base` when relative.
pub fn join_image_path(base: &str, p: &str) -> String {
    if p.starts_with('/') {
        normalize_image_path(p)
    } else {
        normalize_image_path(&format!("{}/{}", base, p))
    }
}

/// Location of an image path inside a materialized root.
pub fn host_path(root: &Path, image_path: &str) -> PathBuf {
    root.join(image_path.trim_start_matches('/'))
}

fn to_image_path(relative: &Path) -> String {
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    format!("/{}", parts.join("/"))
}

/// Proper ancestors of a normalized path, outermost first (excluding `/`).
fn ancestors(path: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();
    let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    for part in &parts[..parts.len().saturating_sub(1)] {
        current.push('/');
        current.push_str(part);
        result.push(current.clone());
    }
    result
}
