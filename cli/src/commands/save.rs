//! `sealreg save` command - save images into a registry directory.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};
use sealreg_core::{ProgressEmitter, RegistryConfig, SaveStrategyKind};
use sealreg_registry::{DriverFactory, ImageSaver, Platform};
use tokio::sync::broadcast::error::RecvError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    PullThrough,
    Copy,
}

impl From<StrategyArg> for SaveStrategyKind {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::PullThrough => SaveStrategyKind::PullThrough,
            StrategyArg::Copy => SaveStrategyKind::Copy,
        }
    }
}

#[derive(Args)]
pub struct SaveArgs {
    /// Image references to save
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Target registry directory
    #[arg(short, long)]
    pub dir: PathBuf,

    /// Target platform (e.g., "linux/amd64", "linux/arm64/v8")
    #[arg(long)]
    pub platform: Option<String>,

    /// Maximum concurrent pulls
    #[arg(long)]
    pub max_procs: Option<usize>,

    /// How content is moved into the directory
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyArg>,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Apply command-line overrides on top of the file configuration.
fn apply_overrides(args: &SaveArgs, config: &mut RegistryConfig) {
    if let Some(max_procs) = args.max_procs {
        config.saver.max_pull_procs = max_procs;
    }
    if let Some(strategy) = args.strategy {
        config.saver.strategy = strategy.into();
    }
    if args.platform.is_some() {
        config.saver.platform = args.platform.clone();
    }
}

pub async fn execute(args: SaveArgs, mut config: RegistryConfig) -> Result<(), Box<dyn std::error::Error>> {
    apply_overrides(&args, &mut config);
    let platform = match &config.saver.platform {
        Some(p) => Platform::parse(p)?,
        None => Platform::host(),
    };

    let credentials = super::resolve_credentials(&config).await?;
    let progress = ProgressEmitter::default();
    let printer = if args.quiet {
        None
    } else {
        let mut events = progress.subscribe();
        Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => println!("{}: {}", event.id, event.status),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    };

    let mut saver = ImageSaver::new(
        config.saver.clone(),
        credentials,
        DriverFactory::with_defaults(),
        config.storage.clone(),
    )
    .with_progress(progress)
    .with_probe_timeout(Duration::from_secs(config.sync.probe_timeout_secs));

    let result = saver.save_images(&args.images, &args.dir, &platform).await;
    let stats = saver.stats().snapshot();
    drop(saver);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let saved = result?;
    if args.quiet {
        for image in &saved {
            println!("{image}");
        }
    } else {
        for image in &saved {
            println!("Saved: {image}");
        }
        println!(
            "{} blob(s) written, {} already present ({})",
            stats.blobs_committed,
            stats.blobs_skipped,
            args.dir.display()
        );
    }
    Ok(())
}
