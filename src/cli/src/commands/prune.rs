//! `strata prune` command - delete blobs that no tag reaches and drop
//! cache entries whose layers went with them.

use clap::Args;
use strata_build::{collect_garbage, prune_index};
use strata_core::EngineConfig;

use crate::output;

#[derive(Args)]
pub struct PruneArgs {
    /// Report what would be removed without deleting anything
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn execute(
    args: PruneArgs,
    config: &EngineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let (store, refs) = super::open_stores(config)?;
    let report = collect_garbage(&store, &refs, args.dry_run)?;

    if args.dry_run {
        println!(
            "Would remove {} blob(s), freeing {} ({} kept)",
            report.removed.len(),
            output::format_bytes(report.freed_bytes),
            report.reachable
        );
        return Ok(());
    }

    let cache = super::open_cache(config)?;
    let dropped = prune_index(&cache, &store)?;
    println!(
        "Removed {} blob(s), freed {} ({} kept)",
        report.removed.len(),
        output::format_bytes(report.freed_bytes),
        report.reachable
    );
    if dropped > 0 {
        println!("Dropped {dropped} stale cache entries");
    }
    Ok(())
}
