//! Build planner and engine.
//!
//! Walks the instruction list in order. For each step the cache key is
//! `(parent layer, canonical form)`; a usable record advances the chain
//! without running anything, otherwise the layer builder produces the step
//! and the result is stored and recorded. The first step error aborts the
//! build; layers recorded by earlier steps stay in the cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_core::config::BuildOptions;
use strata_core::error::{BuildError, Result};
use strata_core::event::{BuildEvent, EventEmitter, MissReason, StepPhase};
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheIndex, CacheKey};
use crate::digest::Digest;
use crate::exec::{Executor, SandboxExecutor};
use crate::instruction::{Buildfile, Instruction};
use crate::layer::{BuildContext, LayerBuilder, LayerRecord};
use crate::manifest::{assemble, ImageConfig, ImageManifest};
use crate::resolver::{BaseResolver, LocalBaseResolver};
use crate::snapshot::Snapshot;
use crate::store::ContentStore;

/// How a step's layer was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Reused from the cache index
    Cached,
    /// Built; no prior record existed
    Built,
    /// Built although a record existed (no-cache or missing layer)
    Rebuilt,
}

/// Per-step summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub index: usize,
    /// Instruction as displayed to users
    pub instruction: String,
    pub status: StepStatus,
    pub layer: Digest,
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub manifest: ImageManifest,
    pub manifest_digest: Digest,
    pub steps: Vec<StepReport>,
}

impl BuildOutcome {
    /// Number of steps the layer builder actually ran.
    pub fn built_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status != StepStatus::Cached)
            .count()
    }

    pub fn cached_steps(&self) -> usize {
        self.steps.len() - self.built_steps()
    }
}

/// One step of the linearized plan.
#[derive(Debug, Clone)]
pub struct PlannedStep<'a> {
    pub index: usize,
    pub instruction: &'a Instruction,
    pub canonical: String,
}

/// Linearize an instruction list into plan steps (order is total).
pub fn plan(instructions: &[Instruction]) -> Vec<PlannedStep<'_>> {
    instructions
        .iter()
        .enumerate()
        .map(|(index, instruction)| PlannedStep {
            index,
            instruction,
            canonical: instruction.canonical_form(),
        })
        .collect()
}

/// Planner state, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlanState {
    Pending,
    Resolving(usize),
    CacheHit(usize),
    CacheMiss(usize),
    Building(usize),
    Completed,
    Failed(usize),
}

impl PlanState {
    fn step(&self) -> Option<usize> {
        match self {
            PlanState::Resolving(i)
            | PlanState::CacheHit(i)
            | PlanState::CacheMiss(i)
            | PlanState::Building(i)
            | PlanState::Failed(i) => Some(*i),
            PlanState::Pending | PlanState::Completed => None,
        }
    }
}

/// Outcome of consulting the cache for one step.
enum Decision {
    Hit(Digest),
    Miss { reason: MissReason, had_record: bool },
}

/// Shared build engine: one content store and cache index, any number of
/// builds (concurrent builds converge through the index).
pub struct BuildEngine {
    store: ContentStore,
    cache: Arc<CacheIndex>,
    builder: LayerBuilder,
    events: EventEmitter,
    no_cache: bool,
}

impl BuildEngine {
    /// Open the store and index under `options.cache_dir`.
    pub fn open(
        options: &BuildOptions,
        resolver: Arc<dyn BaseResolver>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        let store = ContentStore::open(&options.cache_dir)?;
        let cache = Arc::new(CacheIndex::open(&options.cache_dir)?);
        let builder = LayerBuilder::new(store.clone(), resolver, executor, options.timeout)
            .keep_failed_rootfs(options.keep_failed_rootfs);

        Ok(Self {
            store,
            cache,
            builder,
            events: EventEmitter::default(),
            no_cache: options.no_cache,
        })
    }

    /// Publish step events through `events`.
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn cache(&self) -> &CacheIndex {
        &self.cache
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Parse `buildfile` and build it against `context_root`.
    pub async fn build_file(
        &self,
        buildfile: &Path,
        context_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        let file = Buildfile::from_file(buildfile)?;
        self.build(&file.instructions, context_root, cancel).await
    }

    /// Build an instruction list.
    pub async fn build(
        &self,
        instructions: &[Instruction],
        context_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        let context = BuildContext::new(context_root)?;
        let steps = plan(instructions);
        let total = steps.len();
        let config = ImageConfig::from_instructions(instructions);

        let mut state = PlanState::Pending;
        let mut parent_layer: Option<Digest> = None;
        // Tree at `parent_layer`; loaded lazily since hits never need it.
        let mut current: Option<Snapshot> = Some(Snapshot::empty());
        let mut chain = Vec::with_capacity(total);
        let mut reports = Vec::with_capacity(total);

        tracing::info!(
            steps = total,
            context = %context.root().display(),
            no_cache = self.no_cache,
            "Starting build"
        );

        for step in &steps {
            let index = step.index;
            let shown = step.instruction.to_string();
            transition(&mut state, PlanState::Resolving(index));

            if cancel.is_cancelled() {
                transition(&mut state, PlanState::Failed(index));
                return Err(self.fail(index, &shown, BuildError::Cancelled { step: index }));
            }

            tracing::info!(step = index + 1, total, instruction = %step.instruction, "Build step");
            self.emit(index, &shown, StepPhase::Resolving);

            let key = match cache_form(step, &context) {
                Ok(form) => CacheKey::new(parent_layer.as_ref(), form),
                Err(e) => {
                    transition(&mut state, PlanState::Failed(index));
                    return Err(self.fail(index, &shown, e));
                }
            };

            let (layer, status) = match self.decide(&key, step.instruction) {
                Decision::Hit(layer) => {
                    transition(&mut state, PlanState::CacheHit(index));
                    self.emit(
                        index,
                        &shown,
                        StepPhase::CacheHit {
                            layer: layer.to_string(),
                        },
                    );
                    current = None;
                    (layer, StepStatus::Cached)
                }
                Decision::Miss { reason, had_record } => {
                    transition(&mut state, PlanState::CacheMiss(index));
                    self.emit(index, &shown, StepPhase::CacheMiss { reason });
                    transition(&mut state, PlanState::Building(index));

                    let built = self
                        .build_step(
                            step,
                            &key,
                            parent_layer.as_ref(),
                            current.take(),
                            had_record,
                            &context,
                            cancel,
                        )
                        .await;
                    let (layer, child) = match built {
                        Ok(built) => built,
                        Err(e) => {
                            transition(&mut state, PlanState::Failed(index));
                            return Err(self.fail(index, &shown, e));
                        }
                    };
                    current = child;

                    self.emit(
                        index,
                        &shown,
                        StepPhase::Built {
                            layer: layer.to_string(),
                        },
                    );
                    let status = if had_record {
                        StepStatus::Rebuilt
                    } else {
                        StepStatus::Built
                    };
                    (layer, status)
                }
            };

            tracing::debug!(step = index + 1, layer = %layer.short(), status = ?status, "Step complete");
            chain.push(layer.clone());
            reports.push(StepReport {
                index,
                instruction: shown,
                status,
                layer: layer.clone(),
            });
            parent_layer = Some(layer);
        }

        let manifest = assemble(&chain, &config)?;
        let manifest_digest = manifest.save(&self.store)?;
        transition(&mut state, PlanState::Completed);

        let outcome = BuildOutcome {
            manifest,
            manifest_digest,
            steps: reports,
        };
        tracing::info!(
            manifest = %outcome.manifest_digest,
            built = outcome.built_steps(),
            cached = outcome.cached_steps(),
            "Build complete"
        );
        Ok(outcome)
    }

    /// Run the layer builder for a missed step, store the layer and record
    /// it. Returns the recorded layer and, when it is the one just built,
    /// the resulting tree.
    #[allow(clippy::too_many_arguments)]
    async fn build_step(
        &self,
        step: &PlannedStep<'_>,
        key: &CacheKey,
        parent_layer: Option<&Digest>,
        current: Option<Snapshot>,
        had_record: bool,
        context: &BuildContext,
        cancel: &CancellationToken,
    ) -> Result<(Digest, Option<Snapshot>)> {
        let parent = match current {
            Some(snapshot) => snapshot,
            None => self.load_tree(parent_layer)?,
        };

        let child = self
            .builder
            .apply(step.index, &parent, step.instruction, context, cancel)
            .await?;

        let (built, _) =
            LayerRecord::commit(&self.store, parent_layer, step.instruction, &parent, &child)?;

        let layer = if had_record {
            self.cache.replace(key, &built)?;
            built.clone()
        } else {
            self.cache.record(key, &built)?
        };
        let child = if layer == built { Some(child) } else { None };
        Ok((layer, child))
    }

    /// Consult the index for one step.
    fn decide(&self, key: &CacheKey, instruction: &Instruction) -> Decision {
        let recorded = self.cache.lookup(key);

        match recorded {
            None => Decision::Miss {
                reason: MissReason::Absent,
                had_record: false,
            },
            Some(_) if self.no_cache => Decision::Miss {
                reason: MissReason::NoCacheOption,
                had_record: true,
            },
            Some(_) if !instruction.is_cacheable() => Decision::Miss {
                reason: MissReason::NoCacheFlag,
                had_record: true,
            },
            Some(layer) if self.layer_resolvable(&layer) => Decision::Hit(layer),
            Some(layer) => {
                tracing::warn!(layer = %layer, "Recorded layer is missing from the store; rebuilding");
                Decision::Miss {
                    reason: MissReason::KeyMismatch,
                    had_record: true,
                }
            }
        }
    }

    /// Whether a recorded layer and its tree can still be loaded.
    fn layer_resolvable(&self, layer: &Digest) -> bool {
        match LayerRecord::load(&self.store, layer) {
            Ok(record) => self.store.has(&record.snapshot),
            Err(_) => false,
        }
    }

    fn load_tree(&self, layer: Option<&Digest>) -> Result<Snapshot> {
        match layer {
            None => Ok(Snapshot::empty()),
            Some(digest) => LayerRecord::load(&self.store, digest)?.load_snapshot(&self.store),
        }
    }

    fn emit(&self, step: usize, instruction: &str, phase: StepPhase) {
        self.events.emit(BuildEvent::new(step, instruction, phase));
    }

    fn fail(&self, step: usize, instruction: &str, err: BuildError) -> BuildError {
        let err = err.at_step(step);
        tracing::error!(step = step + 1, instruction, error = %err, "Build step failed");
        self.emit(
            step,
            instruction,
            StepPhase::Failed {
                message: err.to_string(),
            },
        );
        err
    }
}

/// Cache key form of a step. COPY also covers the content of its sources,
/// so editing a context file misses.
fn cache_form(step: &PlannedStep<'_>, context: &BuildContext) -> Result<String> {
    match step.instruction {
        Instruction::CopyContext { sources, .. } => {
            let digest = context.digest_sources(step.index, sources)?;
            Ok(format!("{} {}", step.canonical, digest))
        }
        _ => Ok(step.canonical.clone()),
    }
}

fn transition(state: &mut PlanState, next: PlanState) {
    tracing::trace!(step = ?next.step(), from = ?*state, to = ?next, "Planner transition");
    *state = next;
}

/// Build `buildfile` against `context_root` with the local base resolver
/// (`<cache_dir>/bases`) and the sandbox executor.
pub async fn build(
    buildfile: &Path,
    context_root: &Path,
    options: &BuildOptions,
) -> Result<BuildOutcome> {
    let bases: PathBuf = options.cache_dir.join("bases");
    let engine = BuildEngine::open(
        options,
        Arc::new(LocalBaseResolver::new(bases)),
        Arc::new(SandboxExecutor::new()),
    )?;
    engine
        .build_file(buildfile, context_root, &CancellationToken::new())
        .await
}
