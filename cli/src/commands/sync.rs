//! `sealreg sync` command - copy images or whole registries between hosts.

use std::path::PathBuf;

use clap::Args;
use sealreg_core::RegistryConfig;
use sealreg_registry::{DriverFactory, Platform, RegistrySync};
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct SyncArgs {
    /// Destination registry hosts (e.g., "10.0.0.2:5000")
    #[arg(required = true)]
    pub destinations: Vec<String>,

    /// Source registry host; every repository and tag is copied
    #[arg(long, conflicts_with_all = ["from_dir", "images"])]
    pub from: Option<String>,

    /// Serve this registry directory and copy its content
    #[arg(long, conflicts_with = "images")]
    pub from_dir: Option<PathBuf>,

    /// Copy only these images, keeping repository and tag
    #[arg(short, long)]
    pub images: Vec<String>,

    /// Platform used when a manifest list is copied
    #[arg(long)]
    pub platform: Option<String>,

    /// Maximum concurrent copies
    #[arg(long)]
    pub max_procs: Option<usize>,
}

pub async fn execute(args: SyncArgs, mut config: RegistryConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(max_procs) = args.max_procs {
        config.sync.max_procs = max_procs;
    }
    let platform = match args.platform.as_deref().or(config.saver.platform.as_deref()) {
        Some(p) => Platform::parse(p)?,
        None => Platform::host(),
    };

    let credentials = super::resolve_credentials(&config).await?;
    let sync = RegistrySync::new(config.sync.clone(), credentials).with_platform(platform);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling sync");
            on_signal.cancel();
        }
    });

    let mut synced = Vec::new();
    if let Some(dir) = &args.from_dir {
        let factory = DriverFactory::with_defaults();
        synced = sync
            .sync_local_dir(dir, &args.destinations, &factory, &config.storage, &cancel)
            .await?;
    } else if let Some(src) = &args.from {
        for dst in &args.destinations {
            for image in sync.sync_hosts(src, dst, &cancel).await? {
                synced.push(format!("{dst}/{image}"));
            }
        }
    } else if !args.images.is_empty() {
        let mut errors: Vec<String> = Vec::new();
        for dst in &args.destinations {
            for image in &args.images {
                match sync.copy_image(image, dst, &cancel).await {
                    Ok(name) => synced.push(name),
                    Err(e) => errors.push(format!("{image} -> {dst}: {e}")),
                }
            }
        }
        if !errors.is_empty() {
            for name in &synced {
                println!("Synced: {name}");
            }
            let msg = errors.join("\n");
            return Err(format!("Failed to sync image(s):\n{msg}").into());
        }
    } else {
        return Err("nothing to sync: pass --from, --from-dir or --images".into());
    }

    for name in &synced {
        println!("Synced: {name}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::commands::{Cli, Command};
    use clap::Parser;

    #[test]
    fn test_parse_sync_from_host() {
        let cli = Cli::try_parse_from([
            "sealreg",
            "sync",
            "--from",
            "registry.local:5000",
            "10.0.0.2:5000",
            "10.0.0.3",
        ])
        .unwrap();
        match cli.command {
            Command::Sync(args) => {
                assert_eq!(args.from.as_deref(), Some("registry.local:5000"));
                assert_eq!(args.destinations, vec!["10.0.0.2:5000", "10.0.0.3"]);
            }
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn test_parse_sync_rejects_two_sources() {
        let result = Cli::try_parse_from([
            "sealreg",
            "sync",
            "--from",
            "a:5000",
            "--from-dir",
            "/tmp/registry",
            "b:5000",
        ]);
        assert!(result.is_err());
    }
}
