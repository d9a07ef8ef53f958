//! Strata Core - Foundational Types
//!
//! Error taxonomy, engine configuration and build events shared by the
//! build engine and the CLI.

pub mod config;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use config::{BuildOptions, EngineConfig, ExecutorKind, LogLevel};
pub use error::{BuildError, Result};
pub use event::{BuildEvent, EventEmitter, MissReason, StepPhase};

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
