//! `sealreg serve` command - serve a registry directory over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Args;
use sealreg_core::RegistryConfig;
use sealreg_registry::server::serve_router;
use sealreg_registry::{DriverFactory, LocalRegistry, ProxyRegistry, RegistryServer};

#[derive(Args)]
pub struct ServeArgs {
    /// Registry directory to serve
    pub dir: PathBuf,

    /// Listen address (e.g., "0.0.0.0:5000")
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Fill misses from this remote registry (pull-through cache)
    #[arg(long)]
    pub proxy: Option<String>,

    /// Log one line per request
    #[arg(long)]
    pub access_log: bool,
}

pub async fn execute(args: ServeArgs, mut config: RegistryConfig) -> Result<(), Box<dyn std::error::Error>> {
    if args.listen.is_some() {
        config.server.listen = args.listen;
    }
    if args.access_log {
        config.server.access_log = true;
    }

    let factory = DriverFactory::with_defaults();
    let router = match &args.proxy {
        Some(remote) => {
            let credentials = super::resolve_credentials(&config).await?;
            let credential = credentials.lookup(remote);
            let proxy = ProxyRegistry::new(&args.dir, &credential, &factory, &config.storage).await?;
            RegistryServer::pull_through(proxy).into_router()
        }
        None => {
            let local = LocalRegistry::open(&args.dir, &factory, &config.storage)?;
            RegistryServer::new(local).into_router()
        }
    };

    let server = serve_router(&config.server, router).await?;
    println!("Serving {} on {}", args.dir.display(), server.url());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    server.shutdown().await?;
    Ok(())
}
