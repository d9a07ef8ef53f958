//! CLI command definitions and dispatch.

mod build;
mod history;
mod images;
mod inspect;
mod prune;
mod rmi;
mod tag;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use strata_build::{CacheIndex, ContentStore, RefStore};
use strata_core::EngineConfig;

/// Strata - layered, cached container image builds.
#[derive(Parser)]
#[command(name = "strata", version, about)]
pub struct Cli {
    /// Cache directory (content store, cache index and tags)
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Configuration file (default: <cache dir>/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a Stratafile
    Build(build::BuildArgs),
    /// List tagged images
    Images(images::ImagesArgs),
    /// Display an image manifest as JSON
    Inspect(inspect::InspectArgs),
    /// Show the layers of an image
    History(history::HistoryArgs),
    /// Create a tag that refers to an existing image
    Tag(tag::TagArgs),
    /// Remove one or more tags
    Rmi(rmi::RmiArgs),
    /// Remove blobs no tag can reach
    Prune(prune::PruneArgs),
}

/// Dispatch a parsed CLI command.
pub async fn dispatch(cli: Cli, config: &EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::debug!(cache_dir = %config.cache_dir.display(), "Using cache directory");

    match cli.command {
        Command::Build(args) => build::execute(args, config).await,
        Command::Images(args) => images::execute(args, config).await,
        Command::Inspect(args) => inspect::execute(args, config).await,
        Command::History(args) => history::execute(args, config).await,
        Command::Tag(args) => tag::execute(args, config).await,
        Command::Rmi(args) => rmi::execute(args, config).await,
        Command::Prune(args) => prune::execute(args, config).await,
    }
}

/// Resolve the engine configuration: config file, then `STRATA_*`
/// environment overrides, then the `--cache-dir` flag.
pub fn load_config(
    path: Option<&std::path::Path>,
    cache_dir: Option<PathBuf>,
) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => {
            let mut config = EngineConfig::from_file(path)?;
            config.apply_env(|key| std::env::var(key).ok())?;
            config
        }
        None => EngineConfig::load()?,
    };
    if let Some(dir) = cache_dir {
        config.cache_dir = dir;
    }
    config.validate()?;
    Ok(config)
}

/// Content store and tag store under the configured cache directory.
fn open_stores(
    config: &EngineConfig,
) -> Result<(ContentStore, RefStore), Box<dyn std::error::Error>> {
    let store = ContentStore::open(&config.cache_dir)?;
    let refs = RefStore::open(&config.cache_dir)?;
    Ok((store, refs))
}

/// Cache index under the configured cache directory.
fn open_cache(config: &EngineConfig) -> Result<CacheIndex, Box<dyn std::error::Error>> {
    Ok(CacheIndex::open(&config.cache_dir)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cache_dir_flag_is_global() {
        let cli = Cli::try_parse_from(["strata", "images", "--cache-dir", "/tmp/c"]).unwrap();
        assert_eq!(cli.cache_dir, Some(PathBuf::from("/tmp/c")));
        assert!(matches!(cli.command, Command::Images(_)));
    }

    #[test]
    fn test_load_config_cache_dir_override() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("config.yaml");
        std::fs::write(&file, "step_timeout_secs: 5\n").unwrap();

        let config = load_config(Some(&file), Some(tmp.path().join("cache"))).unwrap();
        assert_eq!(config.cache_dir, tmp.path().join("cache"));
        assert_eq!(config.step_timeout_secs, 5);
    }
}
