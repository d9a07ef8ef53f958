//! Layer builder: applies one instruction to a parent snapshot.
//!
//! - `FROM` asks the base resolver for the initial tree.
//! - `COPY` is a pure tree edit: context files are hashed into the store
//!   and inserted, nothing is materialized.
//! - `RUN` materializes the parent into a scratch rootfs, runs the command
//!   there and captures the result. The scratch directory is removed on
//!   every exit path unless `keep_failed_rootfs` is set.
//! - Metadata instructions return the parent unchanged.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_core::error::{BuildError, Result};
use tokio_util::sync::CancellationToken;

use crate::digest::Digest;
use crate::exec::{ExecRequest, ExecStatus, Executor};
use crate::instruction::Instruction;
use crate::resolver::BaseResolver;
use crate::snapshot::{join_image_path, mode_of, normalize_image_path, Diff, Node, Snapshot};
use crate::store::ContentStore;

/// The stored form of a layer. Its blob digest is the layer digest, so the
/// address covers the parent, the instruction and the diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub parent: Option<Digest>,
    /// Instruction canonical form
    pub instruction: String,
    pub diff: Diff,
    /// Digest of the full resulting tree
    pub snapshot: Digest,
}

impl LayerRecord {
    /// Store the child tree and its layer record, returning the layer digest.
    pub fn commit(
        store: &ContentStore,
        parent_layer: Option<&Digest>,
        instruction: &Instruction,
        parent: &Snapshot,
        child: &Snapshot,
    ) -> Result<(Digest, LayerRecord)> {
        let snapshot = child.save(store)?;
        let record = LayerRecord {
            parent: parent_layer.cloned(),
            instruction: instruction.canonical_form(),
            diff: parent.diff(child),
            snapshot,
        };
        let digest = store.put_json(&record)?;
        Ok((digest, record))
    }

    pub fn load(store: &ContentStore, digest: &Digest) -> Result<Self> {
        store.get_json(digest)
    }

    /// Load the tree this layer produced.
    pub fn load_snapshot(&self, store: &ContentStore) -> Result<Snapshot> {
        Snapshot::load(store, &self.snapshot)
    }
}

/// The build context directory; every COPY source must resolve inside it.
#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
}

impl BuildContext {
    pub fn new(root: &Path) -> Result<Self> {
        let root = root.canonicalize().map_err(|e| {
            BuildError::Config(format!(
                "Build context {} is not accessible: {}",
                root.display(),
                e
            ))
        })?;
        if !root.is_dir() {
            return Err(BuildError::Config(format!(
                "Build context {} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a context-relative source path. Paths that leave the root,
    /// lexically or through symlinks, are rejected before anything outside
    /// is read.
    pub fn resolve(&self, step: usize, source: &str) -> Result<PathBuf> {
        let context_err = |message: String| BuildError::Context { step, message };
        let relative = Path::new(source);

        let mut depth: usize = 0;
        for component in relative.components() {
            match component {
                Component::Normal(_) => depth += 1,
                Component::CurDir => {}
                Component::ParentDir => {
                    depth = depth.checked_sub(1).ok_or_else(|| {
                        context_err(format!("'{}' escapes the build context", source))
                    })?;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(context_err(format!(
                        "'{}' is absolute; COPY sources are relative to the build context",
                        source
                    )));
                }
            }
        }

        let candidate = self.root.join(relative);
        if std::fs::symlink_metadata(&candidate).is_err() {
            return Err(context_err(format!(
                "'{}' not found in build context",
                source
            )));
        }
        let resolved = candidate.canonicalize().map_err(|e| {
            context_err(format!("Failed to resolve '{}': {}", source, e))
        })?;
        if !resolved.starts_with(&self.root) {
            return Err(context_err(format!(
                "'{}' resolves outside the build context",
                source
            )));
        }
        Ok(resolved)
    }

    /// Digest over COPY sources: relative paths, node kinds, modes, link
    /// targets and file contents. Nothing is written to the store.
    pub fn digest_sources(&self, step: usize, sources: &[String]) -> Result<Digest> {
        let mut entries: Vec<String> = Vec::new();
        for source in sources {
            let host = self.resolve(step, source)?;
            let metadata = std::fs::metadata(&host).map_err(|e| BuildError::Context {
                step,
                message: format!("Failed to stat '{}': {}", source, e),
            })?;
            if metadata.is_dir() {
                entries.push(format!("{}\0dir\0{:o}", source, mode_of(&metadata, 0o755)));
                digest_tree(step, &host, source, &mut entries)?;
            } else {
                entries.push(file_entry(step, source, &host, &metadata)?);
            }
        }
        let parts: Vec<&[u8]> = entries.iter().map(|e| e.as_bytes()).collect();
        Ok(Digest::of_parts(&parts))
    }
}

fn digest_tree(step: usize, dir: &Path, prefix: &str, entries: &mut Vec<String>) -> Result<()> {
    let context_err = |message: String| BuildError::Context { step, message };

    let mut children: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| context_err(format!("Failed to read {}: {}", dir.display(), e)))?
        .collect::<std::io::Result<_>>()
        .map_err(|e| context_err(format!("Failed to read {}: {}", dir.display(), e)))?;
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let path = child.path();
        let relative = format!("{}/{}", prefix, child.file_name().to_string_lossy());
        let metadata = std::fs::symlink_metadata(&path)
            .map_err(|e| context_err(format!("Failed to stat {}: {}", path.display(), e)))?;

        if metadata.file_type().is_symlink() {
            let link = std::fs::read_link(&path).map_err(|e| {
                context_err(format!("Failed to read link {}: {}", path.display(), e))
            })?;
            entries.push(format!("{}\0link\0{}", relative, link.to_string_lossy()));
        } else if metadata.is_dir() {
            entries.push(format!("{}\0dir\0{:o}", relative, mode_of(&metadata, 0o755)));
            digest_tree(step, &path, &relative, entries)?;
        } else {
            entries.push(file_entry(step, &relative, &path, &metadata)?);
        }
    }
    Ok(())
}

fn file_entry(
    step: usize,
    relative: &str,
    path: &Path,
    metadata: &std::fs::Metadata,
) -> Result<String> {
    let data = std::fs::read(path).map_err(|e| BuildError::Context {
        step,
        message: format!("Failed to read {}: {}", path.display(), e),
    })?;
    Ok(format!(
        "{}\0file\0{:o}\0{}",
        relative,
        mode_of(metadata, 0o644),
        Digest::of(&data)
    ))
}

/// Applies instructions to snapshots.
pub struct LayerBuilder {
    store: ContentStore,
    resolver: Arc<dyn BaseResolver>,
    executor: Arc<dyn Executor>,
    timeout: Duration,
    keep_failed_rootfs: bool,
}

impl LayerBuilder {
    pub fn new(
        store: ContentStore,
        resolver: Arc<dyn BaseResolver>,
        executor: Arc<dyn Executor>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            executor,
            timeout,
            keep_failed_rootfs: false,
        }
    }

    /// Leave failed RUN scratch directories on disk.
    pub fn keep_failed_rootfs(mut self, keep: bool) -> Self {
        self.keep_failed_rootfs = keep;
        self
    }

    /// Produce the snapshot that results from applying `instruction` (step
    /// `step`) to `parent`.
    pub async fn apply(
        &self,
        step: usize,
        parent: &Snapshot,
        instruction: &Instruction,
        context: &BuildContext,
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        match instruction {
            Instruction::ImportBase { reference } => {
                self.resolver.resolve(reference, &self.store).await
            }
            Instruction::RunCommand {
                argv,
                working_dir,
                env,
                ..
            } => {
                self.run(step, parent, argv, working_dir, env, cancel)
                    .await
            }
            Instruction::CopyContext { sources, dest } => {
                self.copy(step, parent, sources, dest, context)
            }
            _ => Ok(parent.clone()),
        }
    }

    async fn run(
        &self,
        step: usize,
        parent: &Snapshot,
        argv: &[String],
        working_dir: &str,
        env: &std::collections::BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        let scratch = tempfile::Builder::new()
            .prefix("strata-run-")
            .tempdir_in(self.store.root().join("tmp"))
            .map_err(|e| BuildError::Store(format!("Failed to create scratch rootfs: {}", e)))?;
        parent.materialize(scratch.path(), &self.store)?;

        tracing::debug!(
            step,
            executor = self.executor.name(),
            rootfs = %scratch.path().display(),
            "Running command"
        );

        let request = ExecRequest {
            rootfs: scratch.path(),
            argv,
            working_dir,
            env,
            timeout: self.timeout,
            cancel,
        };
        let failure = match self.executor.run(&request).await {
            Ok(ExecStatus::Exited(output)) if output.success() => None,
            Ok(ExecStatus::Exited(output)) => Some(BuildError::BuildStep {
                step,
                message: format!(
                    "RUN command failed (exit {}): {}",
                    output
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string()),
                    output.stderr_tail()
                ),
            }),
            Ok(ExecStatus::TimedOut) => Some(BuildError::Timeout {
                step,
                seconds: self.timeout.as_secs(),
            }),
            Ok(ExecStatus::Cancelled) => Some(BuildError::Cancelled { step }),
            Err(e) => Some(BuildError::BuildStep {
                step,
                message: format!("Failed to execute RUN command: {}", e),
            }),
        };

        if let Some(err) = failure {
            if self.keep_failed_rootfs {
                let kept = scratch.keep();
                tracing::warn!(step, rootfs = %kept.display(), "Kept rootfs of failed step");
            }
            return Err(err);
        }

        Snapshot::capture(scratch.path(), &self.store)
    }

    fn copy(
        &self,
        step: usize,
        parent: &Snapshot,
        sources: &[String],
        dest: &str,
        context: &BuildContext,
    ) -> Result<Snapshot> {
        let dest_path = normalize_image_path(dest);
        let into_dir = dest.ends_with('/')
            || matches!(parent.get(&dest_path), Some(Node::Dir { .. }));
        let mut snapshot = parent.clone();

        for source in sources {
            let host = context.resolve(step, source)?;
            let metadata = std::fs::metadata(&host).map_err(|e| BuildError::Context {
                step,
                message: format!("Failed to stat '{}': {}", source, e),
            })?;

            if metadata.is_dir() {
                snapshot.insert(&dest_path, Node::Dir { mode: mode_of(&metadata, 0o755) });
                self.copy_tree(step, &host, &dest_path, &mut snapshot)?;
            } else {
                let target = if into_dir {
                    join_image_path(&dest_path, &source_name(source, &host))
                } else {
                    dest_path.clone()
                };
                let node = self.file_node(step, &host, &metadata)?;
                snapshot.insert(&target, node);
            }
        }

        tracing::debug!(step, dest = %dest_path, sources = sources.len(), "Copied context files");
        Ok(snapshot)
    }

    /// Insert the contents of a context directory under `dest`. Symlinks are
    /// recorded as links and never followed.
    fn copy_tree(
        &self,
        step: usize,
        dir: &Path,
        dest: &str,
        snapshot: &mut Snapshot,
    ) -> Result<()> {
        let context_err = |message: String| BuildError::Context { step, message };

        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| context_err(format!("Failed to read {}: {}", dir.display(), e)))?
            .collect::<std::io::Result<_>>()
            .map_err(|e| context_err(format!("Failed to read {}: {}", dir.display(), e)))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let target = join_image_path(dest, &name);
            let metadata = std::fs::symlink_metadata(&path)
                .map_err(|e| context_err(format!("Failed to stat {}: {}", path.display(), e)))?;

            if metadata.file_type().is_symlink() {
                let link = std::fs::read_link(&path).map_err(|e| {
                    context_err(format!("Failed to read link {}: {}", path.display(), e))
                })?;
                snapshot.insert(
                    &target,
                    Node::Symlink {
                        target: link.to_string_lossy().into_owned(),
                    },
                );
            } else if metadata.is_dir() {
                snapshot.insert(&target, Node::Dir { mode: mode_of(&metadata, 0o755) });
                self.copy_tree(step, &path, &target, snapshot)?;
            } else {
                let node = self.file_node(step, &path, &metadata)?;
                snapshot.insert(&target, node);
            }
        }
        Ok(())
    }

    fn file_node(&self, step: usize, path: &Path, metadata: &std::fs::Metadata) -> Result<Node> {
        let data = std::fs::read(path).map_err(|e| BuildError::Context {
            step,
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;
        Ok(Node::File {
            mode: mode_of(metadata, 0o644),
            digest: self.store.put(&data)?,
            size: data.len() as u64,
        })
    }
}

/// Name a copied file takes inside a destination directory: the last
/// component of the source as written, not of the path it resolves to.
fn source_name(source: &str, host: &Path) -> String {
    Path::new(source)
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .last()
        .or_else(|| host.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{HostExecutor, SandboxExecutor};
    use crate::resolver::LocalBaseResolver;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: ContentStore,
        builder: LayerBuilder,
        context: BuildContext,
        context_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(HostExecutor::new()))
    }

    fn fixture_with(executor: Arc<dyn Executor>) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = ContentStore::open(&tmp.path().join("store")).unwrap();
        let context_dir = tmp.path().join("context");
        fs::create_dir_all(&context_dir).unwrap();
        let builder = LayerBuilder::new(
            store.clone(),
            Arc::new(LocalBaseResolver::new(tmp.path().join("bases"))),
            executor,
            Duration::from_secs(30),
        );
        let context = BuildContext::new(&context_dir).unwrap();
        Fixture {
            _tmp: tmp,
            store,
            builder,
            context,
            context_dir,
        }
    }

    fn copy(sources: &[&str], dest: &str) -> Instruction {
        Instruction::CopyContext {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            dest: dest.to_string(),
        }
    }

    fn run(script: &str) -> Instruction {
        Instruction::RunCommand {
            argv: vec!["/bin/sh".into(), "-c".into(), script.into()],
            working_dir: "/".to_string(),
            env: BTreeMap::new(),
            no_cache: false,
        }
    }

    async fn apply(f: &Fixture, parent: &Snapshot, instruction: &Instruction) -> Result<Snapshot> {
        f.builder
            .apply(1, parent, instruction, &f.context, &CancellationToken::new())
            .await
    }

    // --- COPY ---

    #[tokio::test]
    async fn test_copy_single_file() {
        let f = fixture();
        fs::write(f.context_dir.join("readme.txt"), "read me").unwrap();

        let snap = apply(&f, &Snapshot::empty(), &copy(&["readme.txt"], "/readme.txt"))
            .await
            .unwrap();
        match snap.get("/readme.txt") {
            Some(Node::File { digest, size, .. }) => {
                assert_eq!(*size, 7);
                assert_eq!(f.store.get(digest).unwrap(), b"read me");
            }
            other => panic!("unexpected node: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_copy_into_directory() {
        let f = fixture();
        fs::write(f.context_dir.join("a.txt"), "a").unwrap();
        fs::write(f.context_dir.join("b.txt"), "b").unwrap();

        let snap = apply(&f, &Snapshot::empty(), &copy(&["a.txt", "b.txt"], "/app/"))
            .await
            .unwrap();
        assert!(matches!(snap.get("/app"), Some(Node::Dir { .. })));
        assert!(snap.get("/app/a.txt").is_some());
        assert!(snap.get("/app/b.txt").is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copy_symlink_into_directory_keeps_source_name() {
        let f = fixture();
        fs::write(f.context_dir.join("real.txt"), "real").unwrap();
        std::os::unix::fs::symlink("real.txt", f.context_dir.join("link")).unwrap();

        let snap = apply(&f, &Snapshot::empty(), &copy(&["link"], "/app/"))
            .await
            .unwrap();
        match snap.get("/app/link") {
            Some(Node::File { digest, .. }) => assert_eq!(f.store.get(digest).unwrap(), b"real"),
            other => panic!("unexpected node: {:?}", other),
        }
        assert!(snap.get("/app/real.txt").is_none());
    }

    #[tokio::test]
    async fn test_copy_directory_contents() {
        let f = fixture();
        fs::create_dir_all(f.context_dir.join("src/lib")).unwrap();
        fs::write(f.context_dir.join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(f.context_dir.join("src/lib/mod.rs"), "").unwrap();

        let snap = apply(&f, &Snapshot::empty(), &copy(&["src"], "/app"))
            .await
            .unwrap();
        assert!(snap.get("/app/main.rs").is_some());
        assert!(snap.get("/app/lib/mod.rs").is_some());
        assert!(snap.get("/app/src").is_none());
    }

    #[tokio::test]
    async fn test_copy_rejects_traversal() {
        let f = fixture();
        let err = apply(&f, &Snapshot::empty(), &copy(&["../../etc/passwd"], "/passwd"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Context { step: 1, .. }));
    }

    #[tokio::test]
    async fn test_copy_rejects_absolute_source() {
        let f = fixture();
        let err = apply(&f, &Snapshot::empty(), &copy(&["/etc/hostname"], "/h"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Context { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copy_rejects_symlink_escape() {
        let f = fixture();
        let outside = f._tmp.path().join("secret");
        fs::write(&outside, "secret").unwrap();
        std::os::unix::fs::symlink(&outside, f.context_dir.join("link")).unwrap();

        let err = apply(&f, &Snapshot::empty(), &copy(&["link"], "/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Context { .. }));
    }

    #[tokio::test]
    async fn test_copy_missing_source() {
        let f = fixture();
        let err = apply(&f, &Snapshot::empty(), &copy(&["nope"], "/nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Context { .. }));
    }

    #[test]
    fn test_digest_sources_tracks_content() {
        let f = fixture();
        fs::create_dir_all(f.context_dir.join("src")).unwrap();
        fs::write(f.context_dir.join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(f.context_dir.join("readme.txt"), "v1").unwrap();
        let sources = vec!["readme.txt".to_string(), "src".to_string()];

        let first = f.context.digest_sources(1, &sources).unwrap();
        assert_eq!(f.context.digest_sources(1, &sources).unwrap(), first);

        fs::write(f.context_dir.join("src/main.rs"), "fn main() { loop {} }").unwrap();
        let nested = f.context.digest_sources(1, &sources).unwrap();
        assert_ne!(nested, first);

        fs::write(f.context_dir.join("readme.txt"), "v2").unwrap();
        assert_ne!(f.context.digest_sources(1, &sources).unwrap(), nested);
    }

    #[test]
    fn test_digest_sources_rejects_missing() {
        let f = fixture();
        let err = f.context.digest_sources(4, &["nope".to_string()]).unwrap_err();
        assert!(matches!(err, BuildError::Context { step: 4, .. }));
    }

    #[test]
    fn test_context_allows_inner_parent_dir() {
        let f = fixture();
        fs::create_dir_all(f.context_dir.join("a")).unwrap();
        fs::write(f.context_dir.join("b.txt"), "b").unwrap();
        assert!(f.context.resolve(0, "a/../b.txt").is_ok());
    }

    // --- metadata ---

    #[tokio::test]
    async fn test_metadata_instruction_keeps_tree() {
        let f = fixture();
        fs::write(f.context_dir.join("x"), "x").unwrap();
        let parent = apply(&f, &Snapshot::empty(), &copy(&["x"], "/x")).await.unwrap();

        let env = Instruction::SetEnv {
            key: "A".to_string(),
            value: "1".to_string(),
        };
        let child = apply(&f, &parent, &env).await.unwrap();
        assert_eq!(child.digest(), parent.digest());
    }

    // --- RUN ---

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_additions_and_deletions() {
        let f = fixture();
        fs::write(f.context_dir.join("old"), "old").unwrap();
        let parent = apply(&f, &Snapshot::empty(), &copy(&["old"], "/old")).await.unwrap();

        let child = apply(&f, &parent, &run("touch a && rm old")).await.unwrap();
        assert!(child.get("/a").is_some());
        assert!(child.get("/old").is_none());

        let diff = parent.diff(&child);
        assert_eq!(diff.deletions(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sandbox_run_writes_absolute_path_into_layer() {
        if !SandboxExecutor::available().await {
            eprintln!("skipping: unprivileged user namespaces unavailable");
            return;
        }
        let f = fixture_with(Arc::new(SandboxExecutor::new()));
        let touch = Instruction::RunCommand {
            argv: vec!["touch".into(), "/a".into()],
            working_dir: "/".to_string(),
            env: BTreeMap::new(),
            no_cache: false,
        };

        let child = apply(&f, &Snapshot::empty(), &touch).await.unwrap();

        assert!(matches!(child.get("/a"), Some(Node::File { size: 0, .. })));
        // host tool mount points never reach the layer
        assert!(child.get("/usr").is_none());
        assert!(child.get("/bin").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_failure_is_build_step_error() {
        let f = fixture();
        let err = apply(&f, &Snapshot::empty(), &run("echo nope >&2; exit 7"))
            .await
            .unwrap_err();
        match err {
            BuildError::BuildStep { step, message } => {
                assert_eq!(step, 1);
                assert!(message.contains("exit 7"));
                assert!(message.contains("nope"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // scratch rootfs is gone
        let leftovers = fs::read_dir(f.store.root().join("tmp")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_rootfs_kept_on_request() {
        let tmp = TempDir::new().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();
        let builder = LayerBuilder::new(
            store.clone(),
            Arc::new(LocalBaseResolver::new(tmp.path().join("bases"))),
            Arc::new(HostExecutor::new()),
            Duration::from_secs(30),
        )
        .keep_failed_rootfs(true);
        let context = BuildContext::new(tmp.path()).unwrap();

        let failing = run("touch evidence; exit 1");
        builder
            .apply(1, &Snapshot::empty(), &failing, &context, &CancellationToken::new())
            .await
            .unwrap_err();

        let kept: Vec<PathBuf> = fs::read_dir(store.root().join("tmp"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(kept.len(), 1);
        assert!(kept[0].join("evidence").is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_timeout() {
        let tmp = TempDir::new().unwrap();
        let store = ContentStore::open(tmp.path()).unwrap();
        let builder = LayerBuilder::new(
            store,
            Arc::new(LocalBaseResolver::new(tmp.path().join("bases"))),
            Arc::new(HostExecutor::new()),
            Duration::from_millis(200),
        );
        let context = BuildContext::new(tmp.path()).unwrap();
        let err = builder
            .apply(2, &Snapshot::empty(), &run("sleep 30"), &context, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Timeout { step: 2, .. }));
    }

    // --- LayerRecord ---

    #[tokio::test]
    async fn test_layer_commit_is_deterministic() {
        let f = fixture();
        fs::write(f.context_dir.join("readme.txt"), "hi").unwrap();
        let instruction = copy(&["readme.txt"], "/readme.txt");
        let child = apply(&f, &Snapshot::empty(), &instruction).await.unwrap();

        let (a, record) =
            LayerRecord::commit(&f.store, None, &instruction, &Snapshot::empty(), &child).unwrap();
        let (b, _) =
            LayerRecord::commit(&f.store, None, &instruction, &Snapshot::empty(), &child).unwrap();
        assert_eq!(a, b);
        assert_eq!(record.diff.len(), 1);

        let loaded = LayerRecord::load(&f.store, &a).unwrap();
        assert_eq!(loaded.load_snapshot(&f.store).unwrap(), child);
    }

    #[tokio::test]
    async fn test_metadata_layers_differ_by_instruction() {
        let f = fixture();
        let snap = Snapshot::empty();
        let env_a = Instruction::SetEnv { key: "A".into(), value: "1".into() };
        let env_b = Instruction::SetEnv { key: "A".into(), value: "2".into() };
        let (a, rec) = LayerRecord::commit(&f.store, None, &env_a, &snap, &snap).unwrap();
        let (b, _) = LayerRecord::commit(&f.store, None, &env_b, &snap, &snap).unwrap();
        assert_ne!(a, b);
        assert!(rec.diff.is_empty());
    }
}
