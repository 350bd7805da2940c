//! CLI command definitions and dispatch.

mod images;
mod rmi;
mod save;
mod serve;
mod sync;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use sealreg_core::{LogLevel, RegistryConfig};
use sealreg_registry::{AuthResolver, CredentialMap, RegistryEndpoint};

/// Sealreg - pull, cache and replicate container images
#[derive(Parser)]
#[command(name = "sealreg", version, about)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (debug, info, warn, error). Overrides RUST_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Save images into a registry directory
    Save(save::SaveArgs),
    /// Copy images or whole registries between hosts
    Sync(sync::SyncArgs),
    /// Serve a registry directory over HTTP
    Serve(serve::ServeArgs),
    /// List images of a registry directory or a remote registry
    Images(images::ImagesArgs),
    /// Remove one or more images
    Rmi(rmi::RmiArgs),
}

/// Load the configuration file, or defaults when none is given.
pub(crate) fn load_config(path: Option<&Path>) -> Result<RegistryConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(RegistryConfig::from_path(path)?),
        None => Ok(RegistryConfig::default()),
    }
}

/// Resolve credentials from the default auth files, probing each domain.
pub(crate) async fn resolve_credentials(
    config: &RegistryConfig,
) -> Result<CredentialMap, Box<dyn std::error::Error>> {
    let resolver = AuthResolver::new().with_timeout(config.sync.probe_timeout());
    Ok(resolver.resolve_default().await?)
}

/// Where `images` and `rmi` read from.
pub(crate) enum Target {
    Dir(PathBuf),
    Registry(String),
}

impl Target {
    pub(crate) fn from_args(
        dir: Option<PathBuf>,
        registry: Option<String>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        match (dir, registry) {
            (Some(dir), None) => Ok(Target::Dir(dir)),
            (None, Some(registry)) => Ok(Target::Registry(registry)),
            (Some(_), Some(_)) => Err("--dir and --registry are mutually exclusive".into()),
            (None, None) => Err("one of --dir or --registry is required".into()),
        }
    }

    /// Open the target as a registry endpoint.
    pub(crate) async fn open(
        &self,
        config: &RegistryConfig,
    ) -> Result<Box<dyn RegistryEndpoint>, Box<dyn std::error::Error>> {
        match self {
            Target::Dir(dir) => {
                let factory = sealreg_registry::DriverFactory::with_defaults();
                let local = sealreg_registry::LocalRegistry::open(dir, &factory, &config.storage)?;
                Ok(Box::new(local))
            }
            Target::Registry(registry) => {
                let credentials = resolve_credentials(config).await?;
                let sync = sealreg_registry::RegistrySync::new(config.sync.clone(), credentials);
                let cancel = tokio_util::sync::CancellationToken::new();
                let client = sync.connect(registry, &cancel).await?;
                Ok(Box::new(client))
            }
        }
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Save(args) => save::execute(args, config).await,
        Command::Sync(args) => sync::execute(args, config).await,
        Command::Serve(args) => serve::execute(args, config).await,
        Command::Images(args) => images::execute(args, config).await,
        Command::Rmi(args) => rmi::execute(args, config).await,
    }
}
