//! `strata rmi` command - remove one or more tags.
//!
//! Only the tag goes away; blobs are reclaimed by `strata prune`.

use clap::Args;
use strata_build::refs::normalize_tag;
use strata_core::EngineConfig;

#[derive(Args)]
pub struct RmiArgs {
    /// Tags to remove
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Ignore tags that do not exist
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(
    args: RmiArgs,
    config: &EngineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let (_, refs) = super::open_stores(config)?;

    let mut errors: Vec<String> = Vec::new();
    for image in &args.images {
        let tag = match normalize_tag(image) {
            Ok(tag) => tag,
            Err(e) => {
                errors.push(format!("{image}: {e}"));
                continue;
            }
        };
        match refs.remove(&tag) {
            Ok(Some(manifest)) => println!("Untagged: {tag} ({})", manifest.short()),
            Ok(None) if args.force => {}
            Ok(None) => errors.push(format!("{tag}: no such image")),
            Err(e) => errors.push(format!("{tag}: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = errors.join("\n");
        Err(format!("Failed to remove image(s):\n{msg}").into())
    }
}
