//! `sealreg images` command.

use std::path::PathBuf;

use clap::Args;
use sealreg_core::RegistryConfig;
use sealreg_registry::{list_images, Filter};

use super::Target;

#[derive(Args)]
pub struct ImagesArgs {
    /// Registry directory to list
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Remote registry host to list
    #[arg(short, long)]
    pub registry: Option<String>,

    /// Filter as comma-separated key=pattern pairs, e.g. "name=library/*,tag=v1*"
    #[arg(short, long, default_value = "")]
    pub filter: String,
}

pub async fn execute(args: ImagesArgs, config: RegistryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = Filter::validate(&args.filter)?;
    let target = Target::from_args(args.dir, args.registry)?;
    let endpoint = target.open(&config).await?;

    for image in list_images(endpoint.as_ref(), &filter).await? {
        println!("{image}");
    }
    Ok(())
}
