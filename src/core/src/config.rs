use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BuildError, Result};

/// Default per-step subprocess limit: 30 minutes.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 30 * 60;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Content store and cache index location
    pub cache_dir: PathBuf,

    /// Directory holding local base images (`<name>/<tag>/` or `<name>/<tag>.tar.gz`)
    pub bases_dir: Option<PathBuf>,

    /// Force a cache miss on every step
    pub no_cache: bool,

    /// Per-step subprocess time limit in seconds
    pub step_timeout_secs: u64,

    /// How RUN steps are executed
    pub executor: ExecutorKind,

    /// Leave the scratch rootfs of a failed RUN step on disk for inspection
    pub keep_failed_rootfs: bool,

    /// Log level used when RUST_LOG is not set
    pub log_level: LogLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            bases_dir: None,
            no_cache: false,
            step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            executor: ExecutorKind::default(),
            keep_failed_rootfs: false,
            log_level: LogLevel::Warn,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file, falling back to defaults for
    /// missing fields.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `<cache_dir>/config.yaml` if present, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let defaults = Self::default();
        let path = std::env::var_os("STRATA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| defaults.cache_dir.join("config.yaml"));

        let mut config = if path.is_file() {
            Self::from_file(&path)?
        } else {
            defaults
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `STRATA_*` overrides. The lookup is injected so tests do not
    /// touch the process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("STRATA_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("STRATA_BASES_DIR") {
            self.bases_dir = Some(PathBuf::from(dir));
        }
        if let Some(flag) = lookup("STRATA_NO_CACHE") {
            self.no_cache = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Some(secs) = lookup("STRATA_STEP_TIMEOUT") {
            self.step_timeout_secs = secs.parse().map_err(|_| {
                BuildError::Config(format!("STRATA_STEP_TIMEOUT is not a number: {}", secs))
            })?;
        }
        self.validate()
    }

    /// Reject settings the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.step_timeout_secs == 0 {
            return Err(BuildError::Config(
                "step_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.cache_dir.as_os_str().is_empty() {
            return Err(BuildError::Config("cache_dir must not be empty".to_string()));
        }
        Ok(())
    }

    /// Base images directory, defaulting to `<cache_dir>/bases`.
    pub fn bases_dir(&self) -> PathBuf {
        self.bases_dir
            .clone()
            .unwrap_or_else(|| self.cache_dir.join("bases"))
    }

    /// Per-invocation options derived from this configuration.
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            no_cache: self.no_cache,
            timeout: Duration::from_secs(self.step_timeout_secs),
            cache_dir: self.cache_dir.clone(),
            keep_failed_rootfs: self.keep_failed_rootfs,
        }
    }
}

/// Options recognised by a single `build` invocation.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Force-miss every step
    pub no_cache: bool,
    /// Per-step subprocess limit
    pub timeout: Duration,
    /// Content store + cache index location
    pub cache_dir: PathBuf,
    /// Keep the scratch rootfs of a failed RUN step
    pub keep_failed_rootfs: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        EngineConfig::default().build_options()
    }
}

/// RUN step execution strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Run with the materialized rootfs as `/` inside an unprivileged user
    /// and mount namespace (Linux, needs `unshare`)
    #[default]
    Sandbox,
    /// Run inside `chroot <rootfs>` (Linux, requires root)
    Chroot,
    /// Run directly on the host with only the working directory anchored in
    /// the rootfs; absolute paths reach the host filesystem
    Host,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// `<platform cache dir>/strata`, or `.strata` when no cache dir is known.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("strata"))
        .unwrap_or_else(|| PathBuf::from(".strata"))
}
