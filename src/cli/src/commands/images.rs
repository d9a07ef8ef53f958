//! `strata images` command.

use clap::Args;
use strata_build::{ContentStore, Digest, ImageManifest, LayerRecord};
use strata_core::EngineConfig;

use crate::output;

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show tags (one per line)
    #[arg(short, long)]
    pub quiet: bool,

    /// Show full manifest digests
    #[arg(long)]
    pub no_trunc: bool,
}

pub async fn execute(
    args: ImagesArgs,
    config: &EngineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let (store, refs) = super::open_stores(config)?;
    let tagged = refs.list();

    if args.quiet {
        for (tag, _) in &tagged {
            println!("{tag}");
        }
        return Ok(());
    }

    let mut table = output::new_table(&["TAG", "MANIFEST", "LAYERS", "SIZE", "TAGGED"]);
    for (tag, entry) in &tagged {
        let manifest_id = if args.no_trunc {
            entry.manifest.to_string()
        } else {
            entry.manifest.short().to_string()
        };
        let (layers, size) = match summarize(&store, &entry.manifest) {
            Ok((layers, size)) => (layers.to_string(), output::format_bytes(size)),
            Err(e) => {
                tracing::warn!(tag = %tag, error = %e, "Failed to read image");
                ("-".to_string(), "-".to_string())
            }
        };
        table.add_row(&[
            tag.as_str(),
            &manifest_id,
            &layers,
            &size,
            &output::format_ago(&entry.tagged_at),
        ]);
    }

    println!("{table}");
    Ok(())
}

/// Layer count and content size of the image's final tree.
fn summarize(
    store: &ContentStore,
    manifest: &Digest,
) -> Result<(usize, u64), Box<dyn std::error::Error>> {
    let manifest = ImageManifest::load(store, manifest)?;
    let size = match manifest.top_layer() {
        Some(top) => LayerRecord::load(store, top)?
            .load_snapshot(store)?
            .content_size(),
        None => 0,
    };
    Ok((manifest.layers.len(), size))
}
