//! Base image resolution.
//!
//! `FROM` references are turned into an initial [`Snapshot`] by a
//! [`BaseResolver`]. The local resolver reads unpacked directories or tar
//! archives from a bases directory; registry transport is left to other
//! implementations of the trait.

use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use strata_core::error::{BuildError, Result};
use tar::Archive;

use crate::snapshot::Snapshot;
use crate::store::ContentStore;

/// Reference that resolves to the empty filesystem.
pub const SCRATCH: &str = "scratch";

/// Turns a base image reference into a filesystem snapshot.
#[async_trait]
pub trait BaseResolver: Send + Sync {
    /// Resolve `reference`, storing any file contents in `store`.
    async fn resolve(&self, reference: &str, store: &ContentStore) -> Result<Snapshot>;
}

/// Resolves `name[:tag]` against `<bases_dir>/<name>/<tag>{/,.tar.gz,.tgz,.tar}`.
#[derive(Debug, Clone)]
pub struct LocalBaseResolver {
    bases_dir: PathBuf,
}

impl LocalBaseResolver {
    pub fn new(bases_dir: impl Into<PathBuf>) -> Self {
        Self {
            bases_dir: bases_dir.into(),
        }
    }

    pub fn bases_dir(&self) -> &Path {
        &self.bases_dir
    }

    /// Locate the on-disk source for a reference.
    fn locate(&self, reference: &str) -> Result<BaseSource> {
        let (name, tag) = split_reference(reference)?;
        let dir = self.bases_dir.join(name).join(tag);
        if dir.is_dir() {
            return Ok(BaseSource::Directory(dir));
        }

        for ext in ["tar.gz", "tgz"] {
            let path = self.bases_dir.join(name).join(format!("{}.{}", tag, ext));
            if path.is_file() {
                return Ok(BaseSource::Archive { path, gzip: true });
            }
        }
        let path = self.bases_dir.join(name).join(format!("{}.tar", tag));
        if path.is_file() {
            return Ok(BaseSource::Archive { path, gzip: false });
        }

        Err(BuildError::Resolve {
            reference: reference.to_string(),
            message: format!("no directory or archive under {}", self.bases_dir.display()),
        })
    }
}

enum BaseSource {
    Directory(PathBuf),
    Archive { path: PathBuf, gzip: bool },
}

#[async_trait]
impl BaseResolver for LocalBaseResolver {
    async fn resolve(&self, reference: &str, store: &ContentStore) -> Result<Snapshot> {
        if reference == SCRATCH {
            return Ok(Snapshot::empty());
        }

        let snapshot = match self.locate(reference)? {
            BaseSource::Directory(dir) => Snapshot::capture(&dir, store)?,
            BaseSource::Archive { path, gzip } => {
                let scratch = tempfile::tempdir().map_err(|e| {
                    BuildError::Store(format!("Failed to create scratch directory: {}", e))
                })?;
                extract_archive(&path, scratch.path(), gzip).map_err(|e| BuildError::Resolve {
                    reference: reference.to_string(),
                    message: e.to_string(),
                })?;
                Snapshot::capture(scratch.path(), store)?
            }
        };

        tracing::debug!(
            reference,
            entries = snapshot.len(),
            digest = %snapshot.digest(),
            "Resolved base image"
        );
        Ok(snapshot)
    }
}

/// Split `name[:tag]`, defaulting the tag to `latest`. Path-like components
/// that could escape the bases directory are rejected.
pub fn split_reference(reference: &str) -> Result<(&str, &str)> {
    let invalid = |message: &str| BuildError::Resolve {
        reference: reference.to_string(),
        message: message.to_string(),
    };

    // A colon after the last slash separates the tag (registry ports stay in the name).
    let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (name, tag) = match reference[last_slash..].rfind(':') {
        Some(i) => (&reference[..last_slash + i], &reference[last_slash + i + 1..]),
        None => (reference, "latest"),
    };

    if name.is_empty() || tag.is_empty() {
        return Err(invalid("empty name or tag"));
    }
    if name.starts_with('/')
        || name.split('/').any(|c| c.is_empty() || c == "." || c == "..")
        || tag.contains('/')
        || tag == "."
        || tag == ".."
    {
        return Err(invalid("reference must not contain path traversal"));
    }

    Ok((name, tag))
}

/// Extract a (optionally gzip-compressed) tar archive into `target_dir`.
fn extract_archive(path: &Path, target_dir: &Path, gzip: bool) -> std::io::Result<()> {
    let file = File::open(path)?;
    if gzip {
        Archive::new(GzDecoder::new(file)).unpack(target_dir)?;
    } else {
        Archive::new(file).unpack(target_dir)?;
    }

    tracing::debug!(
        archive = %path.display(),
        target = %target_dir.display(),
        "Extracted base archive"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Node;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use tempfile::TempDir;

    fn write_archive(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn setup() -> (TempDir, ContentStore, LocalBaseResolver) {
        let tmp = TempDir::new().unwrap();
        let store = ContentStore::open(&tmp.path().join("store")).unwrap();
        let resolver = LocalBaseResolver::new(tmp.path().join("bases"));
        fs::create_dir_all(resolver.bases_dir()).unwrap();
        (tmp, store, resolver)
    }

    #[tokio::test]
    async fn test_resolve_scratch() {
        let (_tmp, store, resolver) = setup();
        let snap = resolver.resolve("scratch", &store).await.unwrap();
        assert!(snap.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_directory() {
        let (_tmp, store, resolver) = setup();
        let dir = resolver.bases_dir().join("base").join("v1");
        fs::create_dir_all(dir.join("etc")).unwrap();
        fs::write(dir.join("etc/os-release"), "ID=base\n").unwrap();

        let snap = resolver.resolve("base:v1", &store).await.unwrap();
        assert!(matches!(snap.get("/etc"), Some(Node::Dir { .. })));
        assert!(matches!(snap.get("/etc/os-release"), Some(Node::File { size: 8, .. })));
    }

    #[tokio::test]
    async fn test_resolve_archive() {
        let (_tmp, store, resolver) = setup();
        let name_dir = resolver.bases_dir().join("alpine");
        fs::create_dir_all(&name_dir).unwrap();
        write_archive(&name_dir.join("3.19.tar.gz"), &[("bin/sh", b"#!")]);

        let snap = resolver.resolve("alpine:3.19", &store).await.unwrap();
        assert!(snap.get("/bin/sh").is_some());
    }

    #[tokio::test]
    async fn test_resolve_default_tag() {
        let (_tmp, store, resolver) = setup();
        fs::create_dir_all(resolver.bases_dir().join("busybox").join("latest")).unwrap();
        assert!(resolver.resolve("busybox", &store).await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_unknown() {
        let (_tmp, store, resolver) = setup();
        let err = resolver.resolve("nope:v9", &store).await.unwrap_err();
        assert!(matches!(err, BuildError::Resolve { .. }));
    }

    #[test]
    fn test_split_reference() {
        assert_eq!(split_reference("base:v1").unwrap(), ("base", "v1"));
        assert_eq!(split_reference("base").unwrap(), ("base", "latest"));
        assert_eq!(
            split_reference("registry:5000/team/app:2").unwrap(),
            ("registry:5000/team/app", "2")
        );
        assert!(split_reference("../etc:v1").is_err());
        assert!(split_reference("base:..").is_err());
        assert!(split_reference("/abs:v1").is_err());
        assert!(split_reference("base:").is_err());
    }
}
