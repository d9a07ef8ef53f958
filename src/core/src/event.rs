use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// What happened to a single build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepPhase {
    /// Cache key computed, about to consult the index
    Resolving,
    /// Recorded layer reused
    CacheHit { layer: String },
    /// No usable record; the builder will run
    CacheMiss { reason: MissReason },
    /// Builder produced a layer
    Built { layer: String },
    /// Step aborted the build
    Failed { message: String },
}

/// Why a step missed the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissReason {
    /// No entry for the key
    Absent,
    /// Build-wide no-cache option
    NoCacheOption,
    /// Instruction carries its own no-cache flag
    NoCacheFlag,
    /// Entry exists but its layer is gone from the content store
    KeyMismatch,
}

/// Build event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    /// Zero-based instruction index
    pub step: usize,

    /// Instruction as written (for display)
    pub instruction: String,

    /// Phase reached
    pub phase: StepPhase,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl BuildEvent {
    /// Create a new event
    pub fn new(step: usize, instruction: impl Into<String>, phase: StepPhase) -> Self {
        Self {
            step,
            instruction: instruction.into(),
            phase,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<BuildEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event
    pub fn emit(&self, event: BuildEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
