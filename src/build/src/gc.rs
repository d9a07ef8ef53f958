//! Garbage collection of unreachable blobs.
//!
//! Roots are the manifests named by tags. From each root the mark phase
//! follows manifest → layers → parent layers → snapshot trees → file
//! blobs. Everything else in the store is swept.
//!
//! Collection is not coordinated with running builds; run it while the
//! cache is idle.

use std::collections::HashSet;

use serde::Serialize;
use strata_core::error::{BuildError, Result};

use crate::cache::CacheIndex;
use crate::digest::Digest;
use crate::layer::LayerRecord;
use crate::manifest::ImageManifest;
use crate::refs::RefStore;
use crate::snapshot::Snapshot;
use crate::store::ContentStore;

/// Summary of one collection pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcReport {
    /// Blobs kept
    pub reachable: usize,
    /// Blobs removed (or that would be, on a dry run)
    pub removed: Vec<Digest>,
    pub freed_bytes: u64,
    pub dry_run: bool,
}

/// Reachability roots: every tagged manifest.
pub fn roots(refs: &RefStore) -> Vec<Digest> {
    refs.manifests()
}

/// Every blob reachable from `roots`. Missing blobs are skipped with a
/// warning so a damaged store can still be collected.
pub fn reachable(store: &ContentStore, roots: &[Digest]) -> Result<HashSet<Digest>> {
    let mut marked: HashSet<Digest> = HashSet::new();
    let mut layers: Vec<Digest> = Vec::new();

    for root in roots {
        if !marked.insert(root.clone()) {
            continue;
        }
        match ImageManifest::load(store, root) {
            Ok(manifest) => layers.extend(manifest.layers),
            Err(BuildError::NotFound(_)) => {
                tracing::warn!(manifest = %root, "Tagged manifest is missing from the store");
            }
            Err(e) => return Err(e),
        }
    }

    while let Some(layer) = layers.pop() {
        if !marked.insert(layer.clone()) {
            continue;
        }
        let record = match LayerRecord::load(store, &layer) {
            Ok(record) => record,
            Err(BuildError::NotFound(_)) => {
                tracing::warn!(layer = %layer, "Referenced layer is missing from the store");
                continue;
            }
            Err(e) => return Err(e),
        };
        if let Some(parent) = record.parent.clone() {
            layers.push(parent);
        }
        if !marked.insert(record.snapshot.clone()) {
            continue;
        }
        match Snapshot::load(store, &record.snapshot) {
            Ok(tree) => marked.extend(tree.file_digests().cloned()),
            Err(BuildError::NotFound(_)) => {
                tracing::warn!(snapshot = %record.snapshot, "Referenced tree is missing from the store");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(marked)
}

/// Remove every blob not reachable from a tag.
pub fn collect_garbage(store: &ContentStore, refs: &RefStore, dry_run: bool) -> Result<GcReport> {
    let marked = reachable(store, &roots(refs))?;
    let mut report = GcReport {
        dry_run,
        ..Default::default()
    };

    for digest in store.list()? {
        if marked.contains(&digest) {
            report.reachable += 1;
            continue;
        }
        report.freed_bytes += store.size(&digest).unwrap_or(0);
        if !dry_run {
            store.remove(&digest)?;
        }
        report.removed.push(digest);
    }

    tracing::info!(
        removed = report.removed.len(),
        reachable = report.reachable,
        freed_bytes = report.freed_bytes,
        dry_run,
        "Garbage collection finished"
    );
    Ok(report)
}

/// Drop cache entries whose layer is no longer in the store. Returns the
/// number of entries removed.
pub fn prune_index(cache: &CacheIndex, store: &ContentStore) -> Result<usize> {
    let removed = cache.retain(|entry| store.has(&entry.layer))?;
    if removed > 0 {
        tracing::info!(removed, "Pruned dangling cache entries");
    }
    Ok(removed)
}
