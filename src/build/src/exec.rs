//! RUN step execution.
//!
//! An [`Executor`] runs one argv against a materialized rootfs. Every run is
//! bounded by a timeout and a cancellation token; on either the whole
//! process group is killed and the caller discards the scratch rootfs.
//!
//! [`SandboxExecutor`] is the default: the rootfs becomes `/` inside an
//! unprivileged user + mount namespace, so absolute paths land in the layer.
//! [`ChrootExecutor`] does the same for root without namespaces.
//! [`HostExecutor`] only anchors the working directory and must be opted
//! into explicitly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use strata_core::error::{BuildError, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::snapshot::host_path;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const STDERR_TAIL_BYTES: usize = 2048;

/// Host directories offered read-only to sandboxed commands when the image
/// does not provide them.
pub const DEFAULT_HOST_TOOLS: &[&str] = &["/bin", "/sbin", "/usr", "/lib", "/lib64", "/lib32"];

/// Runs inside the new namespaces: bind the host tool directories, then
/// chroot. Arguments: rootfs, workdir, tool count, tools..., argv...
const SANDBOX_SCRIPT: &str = r#"set -e
root="$1"; wd="$2"; n="$3"; shift 3
while [ "$n" -gt 0 ]; do
  mount --bind "$1" "$root$1"
  mount -o remount,bind,ro "$root$1"
  shift; n=$((n - 1))
done
exec chroot "$root" /bin/sh -c 'cd "$0" && exec "$@"' "$wd" "$@"
"#;

/// Checks the namespace, bind mount and read-only remount the sandbox needs.
const SANDBOX_CHECK: &str = r#"d=$(mktemp -d) || exit 1
trap 'umount "$d" 2>/dev/null; rmdir "$d"' EXIT
mount --bind /usr "$d" && mount -o remount,bind,ro "$d"
"#;

/// One command to run.
#[derive(Debug, Clone)]
pub struct ExecRequest<'a> {
    /// Materialized scratch rootfs
    pub rootfs: &'a Path,
    pub argv: &'a [String],
    /// Image path the command starts in
    pub working_dir: &'a str,
    pub env: &'a BTreeMap<String, String>,
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Exit code (`None` when killed by a signal)
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last couple of KiB of stderr, for error messages.
    pub fn stderr_tail(&self) -> String {
        let start = self.stderr.len().saturating_sub(STDERR_TAIL_BYTES);
        String::from_utf8_lossy(&self.stderr[start..]).trim().to_string()
    }
}

/// How a command ended.
#[derive(Debug)]
pub enum ExecStatus {
    Exited(ExecOutput),
    TimedOut,
    Cancelled,
}

/// Runs RUN commands against a rootfs.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Run a command. Spawn failures surface as `Err`; everything else,
    /// including non-zero exits, is an [`ExecStatus`].
    async fn run(&self, request: &ExecRequest<'_>) -> std::io::Result<ExecStatus>;
}

/// Runs commands on the host, anchored at `<rootfs>/<working_dir>` with a
/// cleared environment. Needs no privileges but isolates nothing: a command
/// writing to an absolute path writes to the host.
#[derive(Debug, Clone, Default)]
pub struct HostExecutor;

impl HostExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for HostExecutor {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn run(&self, request: &ExecRequest<'_>) -> std::io::Result<ExecStatus> {
        let (program, args) = split_argv(request.argv)?;
        let cwd = host_path(request.rootfs, request.working_dir);
        std::fs::create_dir_all(&cwd)?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(&cwd);
        cmd.env_clear();
        cmd.env("PATH", DEFAULT_PATH);
        cmd.env("HOME", request.rootfs);
        cmd.env("SOURCE_DATE_EPOCH", "0");
        cmd.env("STRATA_ROOTFS", request.rootfs);
        cmd.envs(request.env);

        run_bounded(cmd, request.timeout, request.cancel).await
    }
}

/// Runs commands with the rootfs as `/` in a fresh user and mount namespace
/// (`unshare --user --map-root-user --mount`). Needs no privileges when the
/// kernel allows unprivileged user namespaces.
///
/// Host tool directories the image lacks are bind-mounted read-only for the
/// duration of the command; their mount points are removed afterwards so
/// they never reach the captured layer.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    unshare_bin: PathBuf,
    host_tools: Vec<PathBuf>,
}

impl Default for SandboxExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxExecutor {
    pub fn new() -> Self {
        Self {
            unshare_bin: PathBuf::from("unshare"),
            host_tools: DEFAULT_HOST_TOOLS.iter().map(PathBuf::from).collect(),
        }
    }

    /// Replace the host directories offered to commands. An empty list
    /// makes the image solely responsible for its tools.
    pub fn with_host_tools(mut self, dirs: Vec<PathBuf>) -> Self {
        self.host_tools = dirs;
        self
    }

    /// Whether this host can create the namespaces and mounts the sandbox
    /// relies on.
    pub async fn available() -> bool {
        Command::new("unshare")
            .args(["--user", "--map-root-user", "--mount", "/bin/sh", "-c"])
            .arg(SANDBOX_CHECK)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Create mount points for host tools the rootfs does not have.
    /// Returns the tool paths to bind and every directory created, parents
    /// first.
    fn prepare_tools(&self, rootfs: &Path) -> std::io::Result<(Vec<String>, Vec<PathBuf>)> {
        let mut binds = Vec::new();
        let mut created = Vec::new();
        for tool in &self.host_tools {
            let Some(image_path) = tool.to_str().filter(|t| t.starts_with('/')) else {
                continue;
            };
            let mount_point = host_path(rootfs, image_path);
            if !tool.is_dir() || std::fs::symlink_metadata(&mount_point).is_ok() {
                continue;
            }
            let missing: Vec<PathBuf> = mount_point
                .ancestors()
                .take_while(|dir| *dir != rootfs && std::fs::symlink_metadata(dir).is_err())
                .map(Path::to_path_buf)
                .collect();
            std::fs::create_dir_all(&mount_point)?;
            created.extend(missing.into_iter().rev());
            binds.push(image_path.to_string());
        }
        Ok((binds, created))
    }
}

fn remove_mount_points(created: &[PathBuf]) {
    for dir in created.iter().rev() {
        if let Err(e) = std::fs::remove_dir(dir) {
            tracing::warn!(path = %dir.display(), error = %e, "Failed to remove tool mount point");
        }
    }
}

#[async_trait]
impl Executor for SandboxExecutor {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn run(&self, request: &ExecRequest<'_>) -> std::io::Result<ExecStatus> {
        split_argv(request.argv)?;
        std::fs::create_dir_all(host_path(request.rootfs, request.working_dir))?;
        let (binds, created) = self.prepare_tools(request.rootfs)?;

        let mut cmd = Command::new(&self.unshare_bin);
        cmd.args(["--user", "--map-root-user", "--mount", "/bin/sh", "-c"]);
        cmd.arg(SANDBOX_SCRIPT);
        cmd.arg("strata-sandbox");
        cmd.arg(request.rootfs);
        cmd.arg(request.working_dir);
        cmd.arg(binds.len().to_string());
        cmd.args(&binds);
        cmd.args(request.argv);
        cmd.env_clear();
        cmd.env("PATH", DEFAULT_PATH);
        cmd.env("HOME", "/root");
        cmd.env("SOURCE_DATE_EPOCH", "0");
        cmd.envs(request.env);

        let result = run_bounded(cmd, request.timeout, request.cancel).await;
        remove_mount_points(&created);
        result
    }
}

/// Runs commands inside `chroot <rootfs>` (Linux, root only).
#[derive(Debug, Clone)]
pub struct ChrootExecutor {
    chroot_bin: PathBuf,
}

impl ChrootExecutor {
    /// Fails unless the current process is root.
    pub fn new() -> Result<Self> {
        if !is_root() {
            return Err(BuildError::Config(
                "chroot executor requires root privileges".to_string(),
            ));
        }
        Ok(Self {
            chroot_bin: PathBuf::from("chroot"),
        })
    }
}

#[async_trait]
impl Executor for ChrootExecutor {
    fn name(&self) -> &'static str {
        "chroot"
    }

    async fn run(&self, request: &ExecRequest<'_>) -> std::io::Result<ExecStatus> {
        split_argv(request.argv)?;
        std::fs::create_dir_all(host_path(request.rootfs, request.working_dir))?;

        // `$0` carries the working directory, `$@` the argv.
        let mut cmd = Command::new(&self.chroot_bin);
        cmd.arg(request.rootfs);
        cmd.arg("/bin/sh");
        cmd.arg("-c");
        cmd.arg(r#"cd "$0" && exec "$@""#);
        cmd.arg(request.working_dir);
        cmd.args(request.argv);
        cmd.env_clear();
        cmd.env("PATH", DEFAULT_PATH);
        cmd.env("HOME", "/root");
        cmd.env("SOURCE_DATE_EPOCH", "0");
        cmd.envs(request.env);

        run_bounded(cmd, request.timeout, request.cancel).await
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

fn split_argv(argv: &[String]) -> std::io::Result<(&String, &[String])> {
    argv.split_first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")
    })
}

enum Waited {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Spawn `cmd` in its own process group and wait for it under `timeout` and
/// `cancel`. The group is killed on every exit path so no stray writer
/// outlives the step.
async fn run_bounded(
    mut cmd: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> std::io::Result<ExecStatus> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id();
    let stdout = tokio::spawn(read_pipe(child.stdout.take()));
    let stderr = tokio::spawn(read_pipe(child.stderr.take()));

    let waited = tokio::select! {
        result = tokio::time::timeout(timeout, child.wait()) => match result {
            Ok(status) => Waited::Exited(status?),
            Err(_) => Waited::TimedOut,
        },
        _ = cancel.cancelled() => Waited::Cancelled,
    };

    kill_process_group(pid);

    match waited {
        Waited::Exited(status) => {
            let output = ExecOutput {
                exit_code: status.code(),
                stdout: stdout.await.unwrap_or_default(),
                stderr: stderr.await.unwrap_or_default(),
            };
            Ok(ExecStatus::Exited(output))
        }
        Waited::TimedOut => {
            abort_readers(&mut child, stdout, stderr).await;
            tracing::warn!(pid, timeout_secs = timeout.as_secs(), "Step timed out; killed");
            Ok(ExecStatus::TimedOut)
        }
        Waited::Cancelled => {
            abort_readers(&mut child, stdout, stderr).await;
            tracing::warn!(pid, "Step cancelled; killed");
            Ok(ExecStatus::Cancelled)
        }
    }
}

async fn abort_readers(
    child: &mut tokio::process::Child,
    stdout: tokio::task::JoinHandle<Vec<u8>>,
    stderr: tokio::task::JoinHandle<Vec<u8>>,
) {
    let _ = child.kill().await;
    stdout.abort();
    stderr.abort();
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            tracing::warn!(error = %e, "Error reading command output");
        }
    }
    buf
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: signalling a process group we created; ESRCH is ignored.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    async fn run_host(
        rootfs: &Path,
        argv: &[String],
        env: &BTreeMap<String, String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ExecStatus {
        let request = ExecRequest {
            rootfs,
            argv,
            working_dir: "/",
            env,
            timeout,
            cancel,
        };
        HostExecutor::new().run(&request).await.unwrap()
    }

    #[tokio::test]
    async fn test_host_writes_into_rootfs() {
        let rootfs = TempDir::new().unwrap();
        let status = run_host(
            rootfs.path(),
            &sh("echo hi > a"),
            &BTreeMap::new(),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(status, ExecStatus::Exited(ref out) if out.success()));
        assert_eq!(std::fs::read_to_string(rootfs.path().join("a")).unwrap(), "hi\n");
    }

    #[tokio::test]
    async fn test_host_working_dir_created() {
        let rootfs = TempDir::new().unwrap();
        let argv = sh("pwd > where");
        let env = BTreeMap::new();
        let cancel = CancellationToken::new();
        let request = ExecRequest {
            rootfs: rootfs.path(),
            argv: &argv,
            working_dir: "/app/src",
            env: &env,
            timeout: Duration::from_secs(10),
            cancel: &cancel,
        };
        HostExecutor::new().run(&request).await.unwrap();
        assert!(rootfs.path().join("app/src/where").is_file());
    }

    #[tokio::test]
    async fn test_host_env_is_cleared_and_injected() {
        let rootfs = TempDir::new().unwrap();
        let env: BTreeMap<String, String> =
            [("GREETING".to_string(), "hello".to_string())].into_iter().collect();
        run_host(
            rootfs.path(),
            &sh("echo \"$GREETING:$SOURCE_DATE_EPOCH:${CARGO:-unset}\" > env"),
            &env,
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await;

        let content = std::fs::read_to_string(rootfs.path().join("env")).unwrap();
        assert_eq!(content.trim(), "hello:0:unset");
    }

    #[tokio::test]
    async fn test_host_nonzero_exit() {
        let rootfs = TempDir::new().unwrap();
        let status = run_host(
            rootfs.path(),
            &sh("echo boom >&2; exit 3"),
            &BTreeMap::new(),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await;

        match status {
            ExecStatus::Exited(out) => {
                assert_eq!(out.exit_code, Some(3));
                assert_eq!(out.stderr_tail(), "boom");
            }
            other => panic!("unexpected status: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_host_timeout_kills() {
        let rootfs = TempDir::new().unwrap();
        let started = Instant::now();
        let status = run_host(
            rootfs.path(),
            &sh("sleep 30"),
            &BTreeMap::new(),
            Duration::from_millis(200),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(status, ExecStatus::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_host_cancellation() {
        let rootfs = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let status = run_host(
            rootfs.path(),
            &sh("sleep 30"),
            &BTreeMap::new(),
            Duration::from_secs(60),
            &cancel,
        )
        .await;
        assert!(matches!(status, ExecStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_empty_argv_is_error() {
        let rootfs = TempDir::new().unwrap();
        let env = BTreeMap::new();
        let cancel = CancellationToken::new();
        let request = ExecRequest {
            rootfs: rootfs.path(),
            argv: &[],
            working_dir: "/",
            env: &env,
            timeout: Duration::from_secs(1),
            cancel: &cancel,
        };
        assert!(HostExecutor::new().run(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_sandbox_absolute_path_stays_in_rootfs() {
        if !SandboxExecutor::available().await {
            eprintln!("skipping: unprivileged user namespaces unavailable");
            return;
        }
        let rootfs = TempDir::new().unwrap();
        let target = format!("/strata-sandbox-{}", uuid::Uuid::new_v4().simple());
        let argv = vec!["touch".to_string(), target.clone()];
        let env = BTreeMap::new();
        let cancel = CancellationToken::new();
        let request = ExecRequest {
            rootfs: rootfs.path(),
            argv: &argv,
            working_dir: "/",
            env: &env,
            timeout: Duration::from_secs(30),
            cancel: &cancel,
        };

        let status = SandboxExecutor::new().run(&request).await.unwrap();

        assert!(matches!(status, ExecStatus::Exited(ref out) if out.success()), "{status:?}");
        assert!(host_path(rootfs.path(), &target).is_file());
        assert!(!Path::new(&target).exists());
        // Tool mount points are gone; only the new file remains.
        let entries: Vec<_> = std::fs::read_dir(rootfs.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1, "{entries:?}");
    }

    #[tokio::test]
    async fn test_sandbox_runs_in_working_dir() {
        if !SandboxExecutor::available().await {
            eprintln!("skipping: unprivileged user namespaces unavailable");
            return;
        }
        let rootfs = TempDir::new().unwrap();
        let argv = sh("pwd > where");
        let env = BTreeMap::new();
        let cancel = CancellationToken::new();
        let request = ExecRequest {
            rootfs: rootfs.path(),
            argv: &argv,
            working_dir: "/app",
            env: &env,
            timeout: Duration::from_secs(30),
            cancel: &cancel,
        };

        SandboxExecutor::new().run(&request).await.unwrap();

        let content = std::fs::read_to_string(rootfs.path().join("app/where")).unwrap();
        assert_eq!(content.trim(), "/app");
    }

    #[test]
    fn test_sandbox_prepares_only_missing_tools() {
        let rootfs = TempDir::new().unwrap();
        let host = TempDir::new().unwrap();
        std::fs::create_dir(host.path().join("tools")).unwrap();
        let tools = host.path().join("tools");
        let image_tools = tools.to_str().unwrap().to_string();
        std::fs::create_dir_all(host_path(rootfs.path(), "/usr")).unwrap();

        let executor = SandboxExecutor::new().with_host_tools(vec![
            PathBuf::from("/usr"),
            tools.clone(),
            host.path().join("missing"),
        ]);
        let (binds, created) = executor.prepare_tools(rootfs.path()).unwrap();

        assert_eq!(binds, vec![image_tools.clone()]);
        assert_eq!(created.last(), Some(&host_path(rootfs.path(), &image_tools)));
        remove_mount_points(&created);
        let mut left: Vec<_> = std::fs::read_dir(rootfs.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        left.sort();
        assert_eq!(left, vec![std::ffi::OsString::from("usr")]);
    }

    #[test]
    fn test_stderr_tail_truncates() {
        let out = ExecOutput {
            exit_code: Some(1),
            stdout: Vec::new(),
            stderr: vec![b'x'; STDERR_TAIL_BYTES * 2],
        };
        assert_eq!(out.stderr_tail().len(), STDERR_TAIL_BYTES);
    }
}
