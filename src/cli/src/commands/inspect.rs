//! `strata inspect` command - print an image manifest as JSON.

use clap::Args;
use serde::Serialize;
use strata_build::{Digest, ImageManifest};
use strata_core::EngineConfig;

#[derive(Args)]
pub struct InspectArgs {
    /// Tag, manifest digest or digest prefix
    pub image: String,
}

/// Manifest plus the tags that point at it.
#[derive(Serialize)]
struct Inspection {
    digest: Digest,
    tags: Vec<String>,
    manifest: ImageManifest,
}

pub async fn execute(
    args: InspectArgs,
    config: &EngineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let (store, refs) = super::open_stores(config)?;
    let digest = refs.lookup(&args.image, &store)?;
    let manifest = ImageManifest::load(&store, &digest)?;
    let tags = refs
        .list()
        .into_iter()
        .filter(|(_, entry)| entry.manifest == digest)
        .map(|(tag, _)| tag)
        .collect();

    let inspection = Inspection {
        digest,
        tags,
        manifest,
    };
    println!("{}", serde_json::to_string_pretty(&inspection)?);
    Ok(())
}
