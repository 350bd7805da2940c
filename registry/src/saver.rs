//! Image saver.
//!
//! Pulls a set of images into a distribution layout on disk. Images are
//! grouped by domain and repository; groups run concurrently and fail
//! independently of each other.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sealreg_core::config::{CopySelection, SaveStrategyKind, SaverConfig, StorageConfig};
use sealreg_core::error::{RegistryError, Result};
use sealreg_core::progress::{ProgressEmitter, ProgressEvent, ProgressStatus};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::auth::{Credential, CredentialMap};
use crate::copy::{short_digest, ImageCopier};
use crate::manifest::{blob_descriptors, resolve_image_digest, BlobDescriptor, Platform};
use crate::proxy::{ProxyConfig, ProxyRegistry};
use crate::reference::ImageReference;
use crate::remote::RemoteClient;
use crate::storage::{DriverFactory, LocalRegistry, StorageStats};

/// How a group moves content into the target directory. Fixed at
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStrategy {
    /// Read every manifest and blob through a pull-through proxy
    PullThrough,
    /// Copy each image with [`ImageCopier`]
    Copy(CopySelection),
}

impl SaveStrategy {
    pub fn from_config(config: &SaverConfig) -> Self {
        match config.strategy {
            SaveStrategyKind::PullThrough => SaveStrategy::PullThrough,
            SaveStrategyKind::Copy => SaveStrategy::Copy(config.selection),
        }
    }
}

/// Images sharing one domain and repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageGroup {
    pub domain: String,
    pub repository: String,
    pub images: Vec<ImageReference>,
}

impl ImageGroup {
    fn name(&self) -> String {
        format!("{}/{}", self.domain, self.repository)
    }
}

/// Parse, dedupe by full name and group images, keeping first-seen order.
pub fn group_images(images: &[String]) -> Result<Vec<ImageGroup>> {
    let mut seen = HashSet::new();
    let mut groups: Vec<ImageGroup> = Vec::new();

    for image in images {
        let reference = ImageReference::parse(image)?;
        if !seen.insert(reference.full_name()) {
            continue;
        }
        match groups
            .iter_mut()
            .find(|g| g.domain == reference.domain && g.repository == reference.repository)
        {
            Some(group) => group.images.push(reference),
            None => groups.push(ImageGroup {
                domain: reference.domain.clone(),
                repository: reference.repository.clone(),
                images: vec![reference],
            }),
        }
    }
    Ok(groups)
}

/// State shared by every group of one save.
#[derive(Clone)]
struct GroupContext {
    local: LocalRegistry,
    platform: Platform,
    strategy: SaveStrategy,
    transfers: Arc<Semaphore>,
    max_procs: usize,
    probe_timeout: Option<Duration>,
    progress: ProgressEmitter,
}

/// Saves images into a local distribution layout.
///
/// `save_images` takes `&mut self`; a saver runs one save at a time.
pub struct ImageSaver {
    config: SaverConfig,
    credentials: CredentialMap,
    factory: DriverFactory,
    storage: StorageConfig,
    strategy: SaveStrategy,
    stats: Arc<StorageStats>,
    progress: ProgressEmitter,
    probe_timeout: Option<Duration>,
    groups: Vec<ImageGroup>,
}

impl ImageSaver {
    pub fn new(
        config: SaverConfig,
        credentials: CredentialMap,
        factory: DriverFactory,
        storage: StorageConfig,
    ) -> Self {
        let strategy = SaveStrategy::from_config(&config);
        Self {
            config,
            credentials,
            factory,
            storage,
            strategy,
            stats: Arc::new(StorageStats::new()),
            progress: ProgressEmitter::default(),
            probe_timeout: None,
            groups: Vec::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressEmitter) -> Self {
        self.progress = progress;
        self
    }

    /// Bound the HTTPS and HTTP connectivity probes of each group.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    pub fn strategy(&self) -> SaveStrategy {
        self.strategy
    }

    /// Counters accumulated over every save made by this saver.
    pub fn stats(&self) -> Arc<StorageStats> {
        self.stats.clone()
    }

    /// Groups of the last save.
    pub fn groups(&self) -> &[ImageGroup] {
        &self.groups
    }

    /// Save `images` under `target_dir`, resolving lists for `platform`.
    ///
    /// Returns the full names of the saved images in input order. When a
    /// group fails, the remaining groups still run to completion and the
    /// first failed group's error is returned.
    pub async fn save_images(
        &mut self,
        images: &[String],
        target_dir: &Path,
        platform: &Platform,
    ) -> Result<Vec<String>> {
        self.groups = group_images(images)?;
        if self.groups.is_empty() {
            return Ok(Vec::new());
        }

        let local = LocalRegistry::open(target_dir, &self.factory, &self.storage)?
            .with_stats(self.stats.clone());
        let max_procs = self.config.max_pull_procs.max(1);
        let ctx = GroupContext {
            local,
            platform: platform.clone(),
            strategy: self.strategy,
            transfers: Arc::new(Semaphore::new(max_procs)),
            max_procs,
            probe_timeout: self.probe_timeout,
            progress: self.progress.clone(),
        };
        let active = Arc::new(Semaphore::new(max_procs));

        tracing::info!(
            images = images.len(),
            groups = self.groups.len(),
            target = %target_dir.display(),
            platform = %platform,
            "Saving images"
        );

        let mut tasks = JoinSet::new();
        for (index, group) in self.groups.iter().cloned().enumerate() {
            let ctx = ctx.clone();
            let active = active.clone();
            let credential = self.credentials.lookup(&group.domain);
            tasks.spawn(async move {
                let result = match active.acquire_owned().await {
                    Ok(_permit) => save_group(&ctx, &group, &credential).await,
                    Err(_) => Err(RegistryError::Cancelled("group gate closed".to_string())),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<Vec<String>>>> = (0..self.groups.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (index, result) =
                joined.map_err(|e| RegistryError::Other(format!("save task failed: {}", e)))?;
            results[index] = Some(result);
        }

        let mut saved = Vec::new();
        let mut first_error = None;
        for (group, result) in self.groups.iter().zip(results) {
            match result {
                Some(Ok(names)) => saved.extend(names),
                Some(Err(e)) => {
                    tracing::warn!(group = %group.name(), error = %e, "Failed to save image group");
                    first_error.get_or_insert(e);
                }
                None => {}
            }
        }

        let snapshot = self.stats.snapshot();
        tracing::info!(
            saved = saved.len(),
            blobs_committed = snapshot.blobs_committed,
            blobs_skipped = snapshot.blobs_skipped,
            "Save finished"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }
}

async fn save_group(ctx: &GroupContext, group: &ImageGroup, credential: &Credential) -> Result<Vec<String>> {
    for image in &group.images {
        ctx.progress.status(image.full_name(), ProgressStatus::Pulling);
    }
    match ctx.strategy {
        SaveStrategy::PullThrough => pull_through_group(ctx, group, credential).await?,
        SaveStrategy::Copy(selection) => copy_group(ctx, group, credential, selection).await?,
    }

    let names: Vec<String> = group.images.iter().map(ImageReference::full_name).collect();
    for name in &names {
        ctx.progress.status(name.clone(), ProgressStatus::Done);
        tracing::info!(image = %name, "Saved image");
    }
    Ok(names)
}

/// Attach the failing image to an error without changing its kind where
/// the kind carries meaning for the caller.
fn with_image(image: &str, err: RegistryError) -> RegistryError {
    match err {
        RegistryError::BlobTransfer { message, .. } => RegistryError::BlobTransfer {
            image: image.to_string(),
            message,
        },
        e @ (RegistryError::Remote { .. }
        | RegistryError::Io(_)
        | RegistryError::Timeout(_)
        | RegistryError::NotFound(_)) => RegistryError::BlobTransfer {
            image: image.to_string(),
            message: e.to_string(),
        },
        RegistryError::PlatformNotMatched(p) => {
            RegistryError::PlatformNotMatched(format!("{} for {}", p, image))
        }
        RegistryError::UnrecognizedManifestType(t) => {
            RegistryError::UnrecognizedManifestType(format!("{} in {}", t, image))
        }
        e => e,
    }
}

async fn acquire(gate: &Semaphore) -> Result<tokio::sync::SemaphorePermit<'_>> {
    gate.acquire()
        .await
        .map_err(|_| RegistryError::Cancelled("transfer gate closed".to_string()))
}

async fn pull_through_group(ctx: &GroupContext, group: &ImageGroup, credential: &Credential) -> Result<()> {
    let name = group.name();
    let proxy = {
        let _permit = acquire(&ctx.transfers).await?;
        ProxyRegistry::with_local(ctx.local.clone(), credential, ctx.probe_timeout).await?
    };
    let repo = proxy.repository(&group.repository);

    let mut blobs: Vec<BlobDescriptor> = Vec::new();
    for image in &group.images {
        let full_name = image.full_name();
        let manifest = {
            let _permit = acquire(&ctx.transfers).await?;
            repo.manifest(image.identifier())
                .await
                .map_err(|e| with_image(&full_name, e))?
        };
        let target = resolve_image_digest(
            &manifest.bytes,
            &manifest.media_type,
            &ctx.platform,
            &manifest.digest,
        )
        .map_err(|e| with_image(&full_name, e))?;
        let manifest = if target == manifest.digest {
            manifest
        } else {
            let _permit = acquire(&ctx.transfers).await?;
            repo.manifest(&target)
                .await
                .map_err(|e| with_image(&full_name, e))?
        };

        tracing::debug!(image = %full_name, digest = %target, "Resolved image manifest");
        for blob in blob_descriptors(&manifest.bytes).map_err(|e| with_image(&full_name, e))? {
            if !blobs.iter().any(|b| b.digest == blob.digest) {
                blobs.push(blob);
            }
        }
    }

    let mut transfers = futures::stream::iter(blobs)
        .map(|blob| {
            let repo = &repo;
            async move {
                let _permit = acquire(&ctx.transfers).await?;
                let id = short_digest(&blob.digest);
                ctx.progress.emit(
                    ProgressEvent::new(id.clone(), ProgressStatus::Downloading).with_bytes(0, Some(blob.size)),
                );
                let status = if repo.fetch_blob(&blob.digest).await? {
                    ProgressStatus::DownloadComplete
                } else {
                    ProgressStatus::AlreadyExists
                };
                ctx.progress.status(id, status);
                Ok::<_, RegistryError>(())
            }
        })
        .buffer_unordered(ctx.max_procs);

    while let Some(result) = transfers.next().await {
        result.map_err(|e| with_image(&name, e))?;
    }
    Ok(())
}

async fn copy_group(
    ctx: &GroupContext,
    group: &ImageGroup,
    credential: &Credential,
    selection: CopySelection,
) -> Result<()> {
    let config = ProxyConfig::from_credential(credential)?;
    let (username, password) = credential.client_credentials()?;
    let remote = {
        let _permit = acquire(&ctx.transfers).await?;
        RemoteClient::connect(&config.remote_url, username, password, ctx.probe_timeout).await?
    };

    let copier = ImageCopier::new(&remote, &ctx.local)
        .with_platform(ctx.platform.clone())
        .with_concurrency(ctx.max_procs)
        .with_gate(ctx.transfers.clone())
        .with_progress(ctx.progress.clone());
    for image in &group.images {
        copier
            .copy(image, image, selection)
            .await
            .map_err(|e| with_image(&image.full_name(), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn images(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_group_images() {
        let groups = group_images(&images(&[
            "nginx",
            "docker.io/library/nginx:latest",
            "nginx:1.25",
            "quay.io/org/app:v1",
            "alpine",
        ]))
        .unwrap();

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].repository, "library/nginx");
        assert_eq!(groups[0].images.len(), 2);
        assert_eq!(groups[1].domain, "quay.io");
        assert_eq!(groups[2].repository, "library/alpine");
    }

    #[test]
    fn test_group_images_rejects_invalid() {
        assert!(matches!(
            group_images(&images(&["ok", "a@b@c"])),
            Err(RegistryError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_strategy_from_config() {
        let mut config = SaverConfig::default();
        assert_eq!(SaveStrategy::from_config(&config), SaveStrategy::PullThrough);
        config.strategy = SaveStrategyKind::Copy;
        config.selection = CopySelection::All;
        assert_eq!(SaveStrategy::from_config(&config), SaveStrategy::Copy(CopySelection::All));
    }

    #[test]
    fn test_with_image_context() {
        let err = with_image(
            "docker.io/library/nginx:latest",
            RegistryError::Timeout("slow".into()),
        );
        match err {
            RegistryError::BlobTransfer { image, .. } => {
                assert_eq!(image, "docker.io/library/nginx:latest")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            with_image("x", RegistryError::StorageIo("disk".into())),
            RegistryError::StorageIo(_)
        ));
    }

    #[tokio::test]
    async fn test_empty_save() {
        let dir = TempDir::new().unwrap();
        let mut saver = ImageSaver::new(
            SaverConfig::default(),
            CredentialMap::new(),
            DriverFactory::with_defaults(),
            StorageConfig::default(),
        );
        let saved = saver
            .save_images(&[], dir.path(), &Platform::new("linux", "amd64"))
            .await
            .unwrap();
        assert!(saved.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_group_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dir = TempDir::new().unwrap();
        let mut saver = ImageSaver::new(
            SaverConfig::default(),
            CredentialMap::new(),
            DriverFactory::with_defaults(),
            StorageConfig::default(),
        )
        .with_probe_timeout(Duration::from_secs(2));
        let result = saver
            .save_images(
                &images(&[&format!("{}/library/nginx:latest", addr)]),
                dir.path(),
                &Platform::new("linux", "amd64"),
            )
            .await;
        assert!(matches!(result, Err(RegistryError::ProbeFailure { .. })));
    }
}
