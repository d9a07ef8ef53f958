//! Image manifest assembly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_core::error::{BuildError, Result};

use crate::digest::Digest;
use crate::instruction::Instruction;
use crate::store::ContentStore;

/// Manifest format version.
pub const SCHEMA_VERSION: u32 = 1;

/// Runtime metadata accumulated from the instruction list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Environment variables (sorted)
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            env: BTreeMap::new(),
            entrypoint: None,
            cmd: None,
            working_dir: "/".to_string(),
            labels: BTreeMap::new(),
        }
    }
}

impl ImageConfig {
    /// Fold one instruction into the metadata (last writer wins).
    pub fn apply(&mut self, instruction: &Instruction) {
        match instruction {
            Instruction::SetEnv { key, value } => {
                self.env.insert(key.clone(), value.clone());
            }
            Instruction::SetEntrypoint { argv } => self.entrypoint = Some(argv.clone()),
            Instruction::SetCmd { argv } => self.cmd = Some(argv.clone()),
            Instruction::SetWorkdir { path } => self.working_dir = path.clone(),
            Instruction::SetLabel { key, value } => {
                self.labels.insert(key.clone(), value.clone());
            }
            Instruction::ImportBase { .. }
            | Instruction::RunCommand { .. }
            | Instruction::CopyContext { .. } => {}
        }
    }

    /// Metadata produced by a whole instruction list.
    pub fn from_instructions<'a>(instructions: impl IntoIterator<Item = &'a Instruction>) -> Self {
        let mut config = Self::default();
        for instruction in instructions {
            config.apply(instruction);
        }
        config
    }
}

/// Immutable image description: the ordered layer chain plus metadata.
///
/// Contains no timestamps, so identical builds yield identical digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    /// Layer digests, base first
    pub layers: Vec<Digest>,
    pub config: ImageConfig,
}

impl ImageManifest {
    /// Content digest of the stable JSON encoding.
    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::of(&serde_json::to_vec(self)?))
    }

    /// Topmost layer.
    pub fn top_layer(&self) -> Option<&Digest> {
        self.layers.last()
    }

    /// Write the manifest into the store; returns its digest.
    pub fn save(&self, store: &ContentStore) -> Result<Digest> {
        store.put_json(self)
    }

    pub fn load(store: &ContentStore, digest: &Digest) -> Result<Self> {
        let manifest: ImageManifest = store.get_json(digest)?;
        if manifest.schema_version != SCHEMA_VERSION {
            return Err(BuildError::Serialization(format!(
                "unsupported manifest schema version {} in {}",
                manifest.schema_version, digest
            )));
        }
        Ok(manifest)
    }
}

/// Compose the final manifest. Fails only when the chain is empty.
pub fn assemble(chain: &[Digest], config: &ImageConfig) -> Result<ImageManifest> {
    if chain.is_empty() {
        return Err(BuildError::EmptyChain);
    }
    Ok(ImageManifest {
        schema_version: SCHEMA_VERSION,
        layers: chain.to_vec(),
        config: config.clone(),
    })
}
