//! `strata history` command - show the layers of an image, newest first.

use clap::Args;
use strata_build::{Change, Diff, ImageManifest, LayerRecord, Node};
use strata_core::EngineConfig;

use crate::output;

#[derive(Args)]
pub struct HistoryArgs {
    /// Tag, manifest digest or digest prefix
    pub image: String,

    /// Only show layer digests
    #[arg(short, long)]
    pub quiet: bool,

    /// Do not truncate digests or instructions
    #[arg(long)]
    pub no_trunc: bool,
}

pub async fn execute(
    args: HistoryArgs,
    config: &EngineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let (store, refs) = super::open_stores(config)?;
    let digest = refs.lookup(&args.image, &store)?;
    let manifest = ImageManifest::load(&store, &digest)?;

    if args.quiet {
        for layer in manifest.layers.iter().rev() {
            println!("{layer}");
        }
        return Ok(());
    }

    let mut table = output::new_table(&["LAYER", "CREATED BY", "CHANGES", "SIZE"]);
    for layer in manifest.layers.iter().rev() {
        let record = LayerRecord::load(&store, layer)?;
        let id = if args.no_trunc {
            layer.to_string()
        } else {
            layer.short().to_string()
        };
        let created_by = if args.no_trunc {
            record.instruction.clone()
        } else {
            output::truncate_str(&record.instruction, 60)
        };
        table.add_row([
            id,
            created_by,
            describe_changes(&record.diff),
            output::format_bytes(added_bytes(&record.diff)),
        ]);
    }

    println!("{table}");
    Ok(())
}

/// "3 (1 deleted)" style change count.
fn describe_changes(diff: &Diff) -> String {
    match diff.deletions() {
        0 => diff.len().to_string(),
        deleted => format!("{} ({} deleted)", diff.len(), deleted),
    }
}

/// Bytes of file content the layer adds or replaces.
fn added_bytes(diff: &Diff) -> u64 {
    diff.changes
        .iter()
        .map(|change| match change {
            Change::Upsert {
                node: Node::File { size, .. },
                ..
            } => *size,
            _ => 0,
        })
        .sum()
}
