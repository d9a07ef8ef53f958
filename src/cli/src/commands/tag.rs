//! `strata tag` command - create a tag that refers to an existing image.

use clap::Args;
use strata_core::EngineConfig;

#[derive(Args)]
pub struct TagArgs {
    /// Source image (tag, manifest digest or digest prefix)
    pub source: String,

    /// New tag (e.g., "app:v2")
    pub target: String,
}

pub async fn execute(
    args: TagArgs,
    config: &EngineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let (store, refs) = super::open_stores(config)?;
    let digest = refs.lookup(&args.source, &store)?;
    let tag = refs.tag(&args.target, &digest)?;
    println!("Tagged {} as {}", digest.short(), tag);
    Ok(())
}
