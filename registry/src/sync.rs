//! Registry to registry synchronization.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sealreg_core::config::{ServerConfig, StorageConfig, SyncConfig};
use sealreg_core::error::{RegistryError, Result};
use sealreg_core::progress::ProgressEmitter;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::auth::CredentialMap;
use crate::copy::ImageCopier;
use crate::endpoint::RegistryEndpoint;
use crate::manifest::Platform;
use crate::proxy::ProxyConfig;
use crate::reference::ImageReference;
use crate::remote::RemoteClient;
use crate::server::RegistryServer;
use crate::storage::{DriverFactory, LocalRegistry};

/// Port assumed for sync targets given without one.
pub const DEFAULT_REGISTRY_PORT: u16 = 5000;

/// Split a sync target into host and port.
///
/// A `scheme://` prefix and any path are dropped; the port defaults
/// to 5000.
pub fn parse_registry_host(target: &str) -> Result<(String, u16)> {
    let target = target.trim();
    let without_scheme = target.split_once("://").map_or(target, |(_, rest)| rest);
    let authority = without_scheme.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(RegistryError::Config(format!("invalid registry host '{}'", target)));
    }

    // Bracketed IPv6 literals keep their colons.
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => {
            let port = port.parse::<u16>().map_err(|_| {
                RegistryError::Config(format!("invalid port '{}' in '{}'", port, target))
            })?;
            (host, port)
        }
        _ => (authority, DEFAULT_REGISTRY_PORT),
    };
    if host.is_empty() {
        return Err(RegistryError::Config(format!("invalid registry host '{}'", target)));
    }
    Ok((host.to_string(), port))
}

/// Liveness check of a registry, bounded by `timeout`.
pub async fn probe(client: &RemoteClient, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, client.ping()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RegistryError::ProbeFailure {
            domain: client.registry().to_string(),
            message: e.to_string(),
        }),
        Err(_) => Err(RegistryError::ProbeFailure {
            domain: client.registry().to_string(),
            message: format!("no answer within {:?}", timeout),
        }),
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    what: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RegistryError::Cancelled(what.to_string())),
        result = fut => result,
    }
}

/// Copies images and whole registries between hosts.
pub struct RegistrySync {
    config: SyncConfig,
    credentials: CredentialMap,
    platform: Platform,
    progress: Option<ProgressEmitter>,
}

impl RegistrySync {
    pub fn new(config: SyncConfig, credentials: CredentialMap) -> Self {
        Self {
            config,
            credentials,
            platform: Platform::host(),
            progress: None,
        }
    }

    /// Platform used for system-image selection.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_progress(mut self, progress: ProgressEmitter) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Connect to `remote` with its stored credential, probing within the
    /// configured timeout.
    pub async fn connect(&self, remote: &str, cancel: &CancellationToken) -> Result<RemoteClient> {
        let credential = self.credentials.lookup(remote);
        let url = ProxyConfig::from_credential(&credential)?.remote_url;
        let (username, password) = credential.client_credentials()?;
        let timeout = self.config.probe_timeout();
        cancellable(
            cancel,
            "probe",
            RemoteClient::connect(&url, username, password, Some(timeout)),
        )
        .await
    }

    /// Copy one image to `dst_host`, keeping its repository and tag.
    ///
    /// Returns the destination reference.
    pub async fn copy_image(
        &self,
        image: &str,
        dst_host: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let src = ImageReference::parse(image)?;
        let (host, port) = parse_registry_host(dst_host)?;
        let dst = src.with_domain(&format!("{}:{}", host, port));

        let src_client = self.connect(&src.domain, cancel).await?;
        let dst_client = self.connect(&dst.domain, cancel).await?;

        let copier = self.copier(&src_client, &dst_client);
        self.copy_with_retry(&copier, &src, &dst, cancel).await?;
        tracing::info!(src = %src, dst = %dst, "Copied image");
        Ok(dst.full_name())
    }

    /// Copy every tag of every repository from `src` to `dst`.
    ///
    /// Returns the copied `repository:tag` names.
    pub async fn sync_registry(
        &self,
        src: &RemoteClient,
        dst: &RemoteClient,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let timeout = self.config.probe_timeout();
        cancellable(cancel, "probe", probe(src, timeout)).await?;
        cancellable(cancel, "probe", probe(dst, timeout)).await?;

        let mut refs = Vec::new();
        for repo in cancellable(cancel, "catalog", src.catalog()).await? {
            for tag in cancellable(cancel, "tags", src.tags(&repo)).await? {
                refs.push((
                    ImageReference::tagged(src.registry(), &repo, &tag),
                    ImageReference::tagged(dst.registry(), &repo, &tag),
                ));
            }
        }
        tracing::info!(
            src = %src.registry(),
            dst = %dst.registry(),
            tags = refs.len(),
            "Syncing registry"
        );

        let copier = self.copier(src, dst);
        let mut copies = futures::stream::iter(refs)
            .map(|(s, d)| {
                let copier = &copier;
                async move {
                    self.copy_with_retry(copier, &s, &d, cancel).await?;
                    Ok::<_, RegistryError>(format!("{}:{}", d.repository, d.identifier()))
                }
            })
            .buffer_unordered(self.config.max_procs.max(1));

        let mut synced = Vec::new();
        let mut first_error = None;
        while let Some(result) = copies.next().await {
            match result {
                Ok(name) => synced.push(name),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        synced.sort();
        Ok(synced)
    }

    /// Connect to both hosts, then sync everything from `src_host`.
    pub async fn sync_hosts(
        &self,
        src_host: &str,
        dst_host: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let src = self.connect(src_host, cancel).await?;
        let (host, port) = parse_registry_host(dst_host)?;
        let dst = self.connect(&format!("{}:{}", host, port), cancel).await?;
        self.sync_registry(&src, &dst, cancel).await
    }

    /// Serve `dir` on an ephemeral port and sync it to every host.
    pub async fn sync_local_dir(
        &self,
        dir: &Path,
        hosts: &[String],
        factory: &DriverFactory,
        storage: &StorageConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let local = LocalRegistry::open(dir, factory, storage)?;
        let server = RegistryServer::start(&ServerConfig::default(), local).await?;
        let result = self.sync_from_server(&server.url(), hosts, cancel).await;
        server.shutdown().await?;
        result
    }

    async fn sync_from_server(
        &self,
        url: &str,
        hosts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let src = cancellable(
            cancel,
            "probe",
            RemoteClient::connect(url, None, None, Some(self.config.probe_timeout())),
        )
        .await?;

        let mut synced = Vec::new();
        for host in hosts {
            let (name, port) = parse_registry_host(host)?;
            let dst = self.connect(&format!("{}:{}", name, port), cancel).await?;
            for image in self.sync_registry(&src, &dst, cancel).await? {
                synced.push(format!("{}/{}", dst.registry(), image));
            }
        }
        Ok(synced)
    }

    /// A copier whose manifest and blob transfers share one gate of
    /// `max_procs` permits, across every tag copied through it.
    fn copier<'a>(&self, src: &'a dyn RegistryEndpoint, dst: &'a dyn RegistryEndpoint) -> ImageCopier<'a> {
        let max_procs = self.config.max_procs.max(1);
        let copier = ImageCopier::new(src, dst)
            .with_platform(self.platform.clone())
            .with_concurrency(max_procs)
            .with_gate(Arc::new(Semaphore::new(max_procs)));
        match &self.progress {
            Some(progress) => copier.with_progress(progress.clone()),
            None => copier,
        }
    }

    async fn copy_with_retry(
        &self,
        copier: &ImageCopier<'_>,
        src: &ImageReference,
        dst: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let attempts = self.config.retries.max(1);
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut attempt = 1;
        loop {
            match cancellable(cancel, "copy", copier.copy(src, dst, self.config.selection)).await {
                Ok(digest) => return Ok(digest),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::warn!(
                        image = %src,
                        attempt,
                        attempts,
                        error = %e,
                        "Copy failed, retrying"
                    );
                    attempt += 1;
                    cancellable(cancel, "copy", async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
