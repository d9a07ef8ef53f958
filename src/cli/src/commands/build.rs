//! `strata build` command - build an image from a Stratafile.
//!
//! Steps already in the cache index are reused; only misses run. The
//! resulting manifest is optionally tagged. Ctrl-C cancels the build at
//! the next step boundary and kills any running RUN command.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use strata_build::{
    BuildEngine, Buildfile, ChrootExecutor, Executor, HostExecutor, LocalBaseResolver,
    SandboxExecutor,
};
use strata_core::{BuildEvent, EngineConfig, EventEmitter, ExecutorKind, StepPhase};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

/// Default build file name inside the context directory.
const DEFAULT_BUILDFILE: &str = "Stratafile";

#[derive(Args)]
pub struct BuildArgs {
    /// Build context directory (contains the Stratafile and COPY sources)
    #[arg(default_value = ".")]
    pub path: String,

    /// Name and optionally tag for the image (e.g., "app:v1")
    #[arg(short = 't', long = "tag")]
    pub tag: Option<String>,

    /// Path to the Stratafile (default: <PATH>/Stratafile)
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Ignore the cache and rebuild every step
    #[arg(long)]
    pub no_cache: bool,

    /// Per-step time limit for RUN commands, in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// How RUN steps are executed: sandbox (default), chroot, or host
    #[arg(long, value_parser = parse_executor)]
    pub executor: Option<ExecutorKind>,

    /// Keep the scratch rootfs of a failed RUN step for inspection
    #[arg(long)]
    pub keep_failed_rootfs: bool,

    /// Suppress progress output; print only the manifest digest
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(
    args: BuildArgs,
    config: &EngineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = PathBuf::from(&args.path)
        .canonicalize()
        .map_err(|e| format!("Invalid build context path '{}': {}", args.path, e))?;
    if !context_dir.is_dir() {
        return Err(format!(
            "Build context '{}' is not a directory",
            context_dir.display()
        )
        .into());
    }

    let buildfile_path = resolve_buildfile(&context_dir, args.file.as_deref());
    if !buildfile_path.is_file() {
        return Err(format!("Stratafile not found at {}", buildfile_path.display()).into());
    }
    let buildfile = Buildfile::from_file(&buildfile_path)?;

    let mut options = config.build_options();
    options.no_cache |= args.no_cache;
    options.keep_failed_rootfs |= args.keep_failed_rootfs;
    if let Some(secs) = args.timeout {
        if secs == 0 {
            return Err("--timeout must be greater than zero".into());
        }
        options.timeout = Duration::from_secs(secs);
    }

    let executor = executor_for(args.executor.unwrap_or(config.executor))?;
    let resolver = Arc::new(LocalBaseResolver::new(config.bases_dir()));

    let events = EventEmitter::default();
    let printer = if args.quiet {
        None
    } else {
        Some(tokio::spawn(print_progress(
            events.subscribe(),
            buildfile.instructions.len(),
        )))
    };

    let engine = BuildEngine::open(&options, resolver, executor)?.with_events(events);
    let (_, refs) = super::open_stores(config)?;

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, cancelling build...");
                cancel.cancel();
            }
        })
    };

    let result = engine
        .build(&buildfile.instructions, &context_dir, &cancel)
        .await;
    interrupt.abort();
    // Closes the event channel so the printer drains and exits.
    drop(engine);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let outcome = result?;
    let tagged = match &args.tag {
        Some(tag) => Some(refs.tag(tag, &outcome.manifest_digest)?),
        None => None,
    };

    if args.quiet {
        println!("{}", outcome.manifest_digest);
        return Ok(());
    }

    println!(
        "Successfully built {} ({} cached, {} built)",
        outcome.manifest_digest.short(),
        outcome.cached_steps(),
        outcome.built_steps()
    );
    if let Some(tag) = tagged {
        println!("Successfully tagged {tag}");
    }
    Ok(())
}

/// `-f` relative to the context directory, or `<context>/Stratafile`.
fn resolve_buildfile(context_dir: &Path, file: Option<&str>) -> PathBuf {
    match file {
        Some(f) => {
            let p = PathBuf::from(f);
            if p.is_absolute() {
                p
            } else {
                context_dir.join(p)
            }
        }
        None => context_dir.join(DEFAULT_BUILDFILE),
    }
}

fn parse_executor(s: &str) -> Result<ExecutorKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "sandbox" => Ok(ExecutorKind::Sandbox),
        "chroot" => Ok(ExecutorKind::Chroot),
        "host" => Ok(ExecutorKind::Host),
        other => Err(format!("unknown executor '{other}' (expected sandbox, chroot or host)")),
    }
}

fn executor_for(kind: ExecutorKind) -> Result<Arc<dyn Executor>, Box<dyn std::error::Error>> {
    Ok(match kind {
        ExecutorKind::Sandbox => Arc::new(SandboxExecutor::new()),
        ExecutorKind::Chroot => Arc::new(ChrootExecutor::new()?),
        ExecutorKind::Host => {
            tracing::warn!("RUN steps execute unconfined on the host");
            Arc::new(HostExecutor::new())
        }
    })
}

async fn print_progress(mut rx: broadcast::Receiver<BuildEvent>, total: usize) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Some(line) = progress_line(&event, total) {
                    println!("{line}");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Progress output fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// One line of progress output, if the phase is worth showing.
fn progress_line(event: &BuildEvent, total: usize) -> Option<String> {
    match &event.phase {
        StepPhase::Resolving => Some(format!(
            "Step {}/{} : {}",
            event.step + 1,
            total,
            event.instruction
        )),
        StepPhase::CacheHit { layer } => Some(format!(" ---> Using cache {}", short(layer))),
        StepPhase::CacheMiss { reason } => {
            tracing::debug!(step = event.step, ?reason, "Cache miss");
            None
        }
        StepPhase::Built { layer } => Some(format!(" ---> {}", short(layer))),
        StepPhase::Failed { message } => Some(format!(" ---> Failed: {message}")),
    }
}

fn short(layer: &str) -> &str {
    let hex = layer.strip_prefix("sha256:").unwrap_or(layer);
    &hex[..hex.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::MissReason;

    #[test]
    fn test_resolve_buildfile() {
        let ctx = Path::new("/ctx");
        assert_eq!(resolve_buildfile(ctx, None), PathBuf::from("/ctx/Stratafile"));
        assert_eq!(
            resolve_buildfile(ctx, Some("build/Stratafile.dev")),
            PathBuf::from("/ctx/build/Stratafile.dev")
        );
        assert_eq!(
            resolve_buildfile(ctx, Some("/elsewhere/Stratafile")),
            PathBuf::from("/elsewhere/Stratafile")
        );
    }

    #[test]
    fn test_parse_executor() {
        assert_eq!(parse_executor("host").unwrap(), ExecutorKind::Host);
        assert_eq!(parse_executor("CHROOT").unwrap(), ExecutorKind::Chroot);
        assert_eq!(parse_executor("sandbox").unwrap(), ExecutorKind::Sandbox);
        assert!(parse_executor("vm").is_err());
    }

    #[test]
    fn test_progress_lines() {
        let layer = format!("sha256:{}", "ab".repeat(32));
        let resolving = BuildEvent::new(0, "FROM base:v1", StepPhase::Resolving);
        assert_eq!(
            progress_line(&resolving, 3).unwrap(),
            "Step 1/3 : FROM base:v1"
        );

        let hit = BuildEvent::new(0, "FROM base:v1", StepPhase::CacheHit { layer });
        assert_eq!(
            progress_line(&hit, 3).unwrap(),
            " ---> Using cache abababababab"
        );

        let miss = BuildEvent::new(
            1,
            "RUN true",
            StepPhase::CacheMiss {
                reason: MissReason::Absent,
            },
        );
        assert!(progress_line(&miss, 3).is_none());
    }
}
