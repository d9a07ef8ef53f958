//! Strata Build - layered, content-addressed image builds
//!
//! Parses a Stratafile, resolves each step against the cache index and runs
//! the layer builder only on misses. Every blob (file contents, trees,
//! layer records, manifests) lives in one content store.

pub mod cache;
pub mod digest;
pub mod engine;
pub mod exec;
pub mod gc;
pub mod instruction;
pub mod layer;
pub mod manifest;
pub mod refs;
pub mod resolver;
pub mod snapshot;
pub mod store;

pub use cache::{CacheEntry, CacheIndex, CacheKey};
pub use digest::{Digest, DigestError};
pub use engine::{build, plan, BuildEngine, BuildOutcome, PlannedStep, StepReport, StepStatus};
pub use exec::{
    ChrootExecutor, ExecOutput, ExecRequest, ExecStatus, Executor, HostExecutor, SandboxExecutor,
};
pub use gc::{collect_garbage, prune_index, reachable, GcReport};
pub use instruction::{parse, Buildfile, Instruction};
pub use layer::{BuildContext, LayerBuilder, LayerRecord};
pub use manifest::{assemble, ImageConfig, ImageManifest};
pub use refs::{RefEntry, RefStore};
pub use resolver::{BaseResolver, LocalBaseResolver};
pub use snapshot::{Change, Diff, Node, Snapshot};
pub use store::ContentStore;
