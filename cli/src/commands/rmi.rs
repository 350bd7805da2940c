//! `sealreg rmi` command - remove one or more images.

use std::path::PathBuf;

use clap::Args;
use sealreg_core::{RegistryConfig, RegistryError};
use sealreg_registry::remove_image;

use super::Target;

#[derive(Args)]
pub struct RmiArgs {
    /// Image references to remove
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Registry directory holding the images
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Remote registry host holding the images
    #[arg(short, long)]
    pub registry: Option<String>,

    /// Ignore images that do not exist
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: RmiArgs, config: RegistryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let target = Target::from_args(args.dir, args.registry)?;
    let endpoint = target.open(&config).await?;

    let mut errors: Vec<String> = Vec::new();

    for reference in &args.images {
        match remove_image(endpoint.as_ref(), reference).await {
            Ok(digest) => {
                println!("Deleted: {reference} ({digest})");
            }
            Err(RegistryError::NotFound(_)) if args.force => continue,
            Err(e) => {
                errors.push(format!("{reference}: {e}"));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = errors.join("\n");
        Err(format!("Failed to remove image(s):\n{msg}").into())
    }
}
