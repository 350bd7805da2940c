//! Storage-backed registry using the Distribution on-disk layout.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use sealreg_core::config::StorageConfig;
use sealreg_core::error::{RegistryError, Result};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use super::driver::{BoxedReader, FileInfo, FileWriter, StorageDriver, WalkControl};
use super::factory::{DriverFactory, DriverParameters};
use super::paths;
use crate::endpoint::{BlobStream, ByteStream, ManifestPayload, RegistryEndpoint};
use crate::manifest::{detect_media_type, sha256_digest};

/// Transfer counters shared by every registry writing into one store.
#[derive(Debug, Default)]
pub struct StorageStats {
    blobs_committed: AtomicU64,
    blobs_skipped: AtomicU64,
    bytes_written: AtomicU64,
    manifests_written: AtomicU64,
}

/// Point-in-time copy of [`StorageStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub blobs_committed: u64,
    pub blobs_skipped: u64,
    pub bytes_written: u64,
    pub manifests_written: u64,
}

impl StorageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_commit(&self, bytes: u64) {
        self.blobs_committed.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.blobs_skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_manifest(&self) {
        self.manifests_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            blobs_committed: self.blobs_committed.load(Ordering::Relaxed),
            blobs_skipped: self.blobs_skipped.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            manifests_written: self.manifests_written.load(Ordering::Relaxed),
        }
    }
}

fn absent<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(RegistryError::PathNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// A registry over a storage driver.
#[derive(Clone)]
pub struct LocalRegistry {
    driver: Arc<dyn StorageDriver>,
    stats: Arc<StorageStats>,
    verify_digests: bool,
}

impl LocalRegistry {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        Self {
            driver,
            stats: Arc::new(StorageStats::new()),
            verify_digests: false,
        }
    }

    /// Open the configured driver rooted at `root`.
    pub fn open(root: &Path, factory: &DriverFactory, config: &StorageConfig) -> Result<Self> {
        let params = DriverParameters::from_config(root, config);
        let driver = factory.create(&config.driver, &params)?;
        Ok(Self::new(driver).with_verify_digests(config.verify_digests))
    }

    pub fn with_stats(mut self, stats: Arc<StorageStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_verify_digests(mut self, verify: bool) -> Self {
        self.verify_digests = verify;
        self
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    pub fn stats(&self) -> Arc<StorageStats> {
        self.stats.clone()
    }

    /// Size of a stored blob, `None` when absent.
    pub async fn blob_size(&self, digest: &str) -> Result<Option<u64>> {
        let path = paths::blob_data(digest)?;
        Ok(absent(self.driver.stat(&path).await)?.map(|info| info.size))
    }

    /// Whether `repo` links the blob and its data is present.
    ///
    /// Existence is checked by path; content is not re-read.
    pub async fn has_blob(&self, repo: &str, digest: &str) -> Result<bool> {
        let link = paths::layer_link(repo, digest)?;
        if absent(self.driver.stat(&link).await)?.is_none() {
            return Ok(false);
        }
        Ok(self.blob_size(digest).await?.is_some())
    }

    pub async fn link_blob(&self, repo: &str, digest: &str) -> Result<()> {
        let link = paths::layer_link(repo, digest)?;
        self.driver.put_content(&link, digest.as_bytes()).await
    }

    pub async fn blob_reader(&self, digest: &str, offset: u64) -> Result<BoxedReader> {
        let path = paths::blob_data(digest)?;
        match self.driver.reader(&path, offset).await {
            Err(RegistryError::PathNotFound(_)) => {
                Err(RegistryError::NotFound(format!("blob {}", digest)))
            }
            other => other,
        }
    }

    pub async fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = paths::blob_data(digest)?;
        match self.driver.get_content(&path).await {
            Err(RegistryError::PathNotFound(_)) => {
                Err(RegistryError::NotFound(format!("blob {}", digest)))
            }
            other => other,
        }
    }

    /// Start a new upload session in `repo`.
    pub async fn begin_upload(&self, repo: &str) -> Result<BlobUpload> {
        let uuid = uuid::Uuid::new_v4().to_string();
        self.driver
            .put_content(
                &paths::upload_started_at(repo, &uuid),
                chrono::Utc::now().to_rfc3339().as_bytes(),
            )
            .await?;
        let writer = self
            .driver
            .writer(&paths::upload_data(repo, &uuid), false)
            .await?;
        Ok(BlobUpload {
            registry: self.clone(),
            repo: repo.to_string(),
            uuid,
            writer,
        })
    }

    /// Reopen an upload session for appending.
    pub async fn resume_upload(&self, repo: &str, uuid: &str) -> Result<BlobUpload> {
        let started = paths::upload_started_at(repo, uuid);
        if absent(self.driver.stat(&started).await)?.is_none() {
            return Err(RegistryError::NotFound(format!("upload {}", uuid)));
        }
        let writer = self
            .driver
            .writer(&paths::upload_data(repo, uuid), true)
            .await?;
        Ok(BlobUpload {
            registry: self.clone(),
            repo: repo.to_string(),
            uuid: uuid.to_string(),
            writer,
        })
    }

    pub async fn upload_size(&self, repo: &str, uuid: &str) -> Result<u64> {
        match absent(self.driver.stat(&paths::upload_data(repo, uuid)).await)? {
            Some(info) => Ok(info.size),
            None => Err(RegistryError::NotFound(format!("upload {}", uuid))),
        }
    }

    pub async fn cancel_upload(&self, repo: &str, uuid: &str) -> Result<()> {
        match self.driver.delete(&paths::upload_dir(repo, uuid)).await {
            Err(RegistryError::PathNotFound(_)) => {
                Err(RegistryError::NotFound(format!("upload {}", uuid)))
            }
            other => other,
        }
    }

    /// Store a blob held in memory and link it into `repo`.
    pub async fn put_blob(&self, repo: &str, content: &[u8]) -> Result<String> {
        let digest = sha256_digest(content);
        if self.blob_size(&digest).await?.is_none() {
            self.driver
                .put_content(&paths::blob_data(&digest)?, content)
                .await?;
            self.stats.record_commit(content.len() as u64);
        }
        self.link_blob(repo, &digest).await?;
        Ok(digest)
    }

    /// Store a manifest and point `reference` at it when it is a tag.
    pub async fn put_manifest(&self, repo: &str, reference: &str, payload: &[u8]) -> Result<String> {
        let digest = sha256_digest(payload);
        if paths::looks_like_digest(reference) && reference != digest {
            return Err(RegistryError::InvalidReference(format!(
                "manifest digest mismatch: expected {}, computed {}",
                reference, digest
            )));
        }

        let data = paths::blob_data(&digest)?;
        if absent(self.driver.stat(&data).await)?.is_none() {
            self.driver.put_content(&data, payload).await?;
        }
        self.driver
            .put_content(
                &paths::manifest_revision_link(repo, &digest)?,
                digest.as_bytes(),
            )
            .await?;
        if !paths::looks_like_digest(reference) {
            self.tag(repo, reference, &digest).await?;
        }
        self.stats.record_manifest();

        tracing::debug!(repository = repo, reference, digest = %digest, "Stored manifest");
        Ok(digest)
    }

    pub async fn tag(&self, repo: &str, tag: &str, digest: &str) -> Result<()> {
        self.driver
            .put_content(&paths::tag_current_link(repo, tag), digest.as_bytes())
            .await?;
        self.driver
            .put_content(&paths::tag_index_link(repo, tag, digest)?, digest.as_bytes())
            .await
    }

    pub async fn tag_digest(&self, repo: &str, tag: &str) -> Result<Option<String>> {
        let link = absent(self.driver.get_content(&paths::tag_current_link(repo, tag)).await)?;
        Ok(link.map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string()))
    }

    /// Resolve a tag or digest to a stored manifest digest.
    pub async fn resolve(&self, repo: &str, reference: &str) -> Result<Option<String>> {
        if paths::looks_like_digest(reference) {
            let link = paths::manifest_revision_link(repo, reference)?;
            Ok(absent(self.driver.stat(&link).await)?.map(|_| reference.to_string()))
        } else {
            self.tag_digest(repo, reference).await
        }
    }

    pub async fn get_manifest(&self, repo: &str, reference: &str) -> Result<Option<ManifestPayload>> {
        let Some(digest) = self.resolve(repo, reference).await? else {
            return Ok(None);
        };
        let bytes = absent(self.driver.get_content(&paths::blob_data(&digest)?).await)?;
        Ok(bytes.map(|bytes| ManifestPayload {
            media_type: detect_media_type(&bytes),
            digest,
            bytes,
        }))
    }

    /// Remove a manifest revision and every tag pointing at it.
    pub async fn remove_manifest(&self, repo: &str, digest: &str) -> Result<()> {
        let revision = paths::manifest_revision_dir(repo, digest)?;
        match self.driver.delete(&revision).await {
            Err(RegistryError::PathNotFound(_)) => {
                return Err(RegistryError::NotFound(format!("manifest {}@{}", repo, digest)))
            }
            other => other?,
        }

        for tag in self.list_tags(repo).await? {
            if self.tag_digest(repo, &tag).await?.as_deref() == Some(digest) {
                self.driver.delete(&paths::tag_dir(repo, &tag)).await?;
            }
        }
        tracing::debug!(repository = repo, digest, "Deleted manifest");
        Ok(())
    }

    pub async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        let dir = paths::tags(repo);
        let children = absent(self.driver.list(&dir).await)?.unwrap_or_default();
        let mut tags: Vec<String> = children
            .iter()
            .filter_map(|p| p.rsplit('/').next())
            .map(str::to_string)
            .collect();
        tags.sort();
        Ok(tags)
    }

    /// Names of every repository with a `_manifests` directory.
    pub async fn repositories(&self) -> Result<Vec<String>> {
        let root = paths::repositories();
        let prefix = format!("{}/", root);
        let mut names = Vec::new();

        let result = self
            .driver
            .walk(&root, &mut |info: &FileInfo| {
                if !info.is_dir {
                    return WalkControl::Continue;
                }
                let base = info.path.rsplit('/').next().unwrap_or_default();
                if base == "_manifests" {
                    if let Some(parent) = info.path.strip_suffix("/_manifests") {
                        if let Some(name) = parent.strip_prefix(&prefix) {
                            names.push(name.to_string());
                        }
                    }
                    WalkControl::SkipDir
                } else if base.starts_with('_') {
                    WalkControl::SkipDir
                } else {
                    WalkControl::Continue
                }
            })
            .await;
        match result {
            Ok(()) | Err(RegistryError::PathNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        names.sort();
        Ok(names)
    }
}

/// An in-progress blob upload into `_uploads/<uuid>`.
pub struct BlobUpload {
    registry: LocalRegistry,
    repo: String,
    uuid: String,
    writer: Box<dyn FileWriter>,
}

impl BlobUpload {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn size(&self) -> u64 {
        self.writer.size()
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        if let Err(e) = self.writer.write(buf).await {
            self.discard().await;
            return Err(e);
        }
        Ok(())
    }

    /// Copy a byte stream into the upload. Stream errors discard the upload.
    pub async fn write_stream(&mut self, mut stream: ByteStream) -> Result<u64> {
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.discard().await;
                    return Err(RegistryError::Io(e));
                }
            };
            self.write(&chunk).await?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }

    /// Persist what was written so far and keep the session open for later.
    pub async fn suspend(mut self) -> Result<u64> {
        self.writer.commit().await?;
        Ok(self.writer.size())
    }

    /// Finish the upload as blob `digest` and link it into the repository.
    ///
    /// Content is re-hashed when `verify` is set or the registry was opened
    /// with digest verification.
    pub async fn commit(mut self, digest: &str) -> Result<()> {
        self.commit_inner(digest, self.registry.verify_digests).await
    }

    /// Like [`commit`](Self::commit) but always re-hashes.
    pub async fn commit_verified(mut self, digest: &str) -> Result<()> {
        self.commit_inner(digest, true).await
    }

    async fn commit_inner(&mut self, digest: &str, verify: bool) -> Result<()> {
        let blob_path = paths::blob_data(digest)?;
        let upload_path = paths::upload_data(&self.repo, &self.uuid);
        let driver = self.registry.driver.clone();

        if let Err(e) = self.writer.commit().await {
            self.discard().await;
            return Err(e);
        }
        let size = self.writer.size();

        if verify {
            let computed = match hash_path(driver.as_ref(), &upload_path, digest).await {
                Ok(computed) => computed,
                Err(e) => {
                    self.discard().await;
                    return Err(e);
                }
            };
            if computed != digest {
                self.discard().await;
                return Err(RegistryError::BlobTransfer {
                    image: digest.to_string(),
                    message: format!("digest mismatch: computed {}", computed),
                });
            }
        }

        if let Err(e) = driver.move_path(&upload_path, &blob_path).await {
            self.discard().await;
            return Err(e);
        }
        match driver.delete(&paths::upload_dir(&self.repo, &self.uuid)).await {
            Ok(()) | Err(RegistryError::PathNotFound(_)) => {}
            Err(e) => tracing::warn!(upload = %self.uuid, error = %e, "Failed to remove upload directory"),
        }
        self.registry.link_blob(&self.repo, digest).await?;
        self.registry.stats.record_commit(size);

        tracing::debug!(repository = %self.repo, digest, size, "Committed blob");
        Ok(())
    }

    /// Drop the partial upload.
    pub async fn cancel(mut self) -> Result<()> {
        self.discard().await;
        Ok(())
    }

    async fn discard(&mut self) {
        match self.writer.cancel().await {
            Ok(())
            | Err(RegistryError::AlreadyCancelled)
            | Err(RegistryError::AlreadyCommitted)
            | Err(RegistryError::AlreadyClosed) => {}
            Err(e) => tracing::warn!(upload = %self.uuid, error = %e, "Failed to cancel upload writer"),
        }
        let dir = paths::upload_dir(&self.repo, &self.uuid);
        match self.registry.driver.delete(&dir).await {
            Ok(()) | Err(RegistryError::PathNotFound(_)) => {}
            Err(e) => tracing::warn!(upload = %self.uuid, error = %e, "Failed to remove upload directory"),
        }
    }
}

async fn hash_path(driver: &dyn StorageDriver, path: &str, digest: &str) -> Result<String> {
    let parts = paths::split_digest(digest)?;
    if parts.algorithm != "sha256" {
        return Err(RegistryError::BlobTransfer {
            image: digest.to_string(),
            message: format!("unsupported digest algorithm '{}'", parts.algorithm),
        });
    }

    let mut reader = driver.reader(path, 0).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

#[async_trait]
impl RegistryEndpoint for LocalRegistry {
    fn describe(&self) -> String {
        format!("local {} registry", self.driver.name())
    }

    async fn manifest(&self, repo: &str, reference: &str) -> Result<Option<ManifestPayload>> {
        self.get_manifest(repo, reference).await
    }

    async fn manifest_digest(&self, repo: &str, reference: &str) -> Result<Option<String>> {
        self.resolve(repo, reference).await
    }

    async fn blob_exists(&self, repo: &str, digest: &str) -> Result<bool> {
        self.has_blob(repo, digest).await
    }

    async fn open_blob(&self, _repo: &str, digest: &str) -> Result<BlobStream> {
        let size = self
            .blob_size(digest)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("blob {}", digest)))?;
        let reader = self.blob_reader(digest, 0).await?;
        Ok(BlobStream {
            size: Some(size),
            stream: ReaderStream::new(reader).boxed(),
        })
    }

    async fn push_blob(&self, repo: &str, digest: &str, blob: BlobStream) -> Result<()> {
        if self.blob_size(digest).await?.is_some() {
            self.link_blob(repo, digest).await?;
            self.stats.record_skip();
            return Ok(());
        }
        let mut upload = self.begin_upload(repo).await?;
        upload.write_stream(blob.stream).await?;
        upload.commit(digest).await
    }

    async fn push_manifest(
        &self,
        repo: &str,
        reference: &str,
        manifest: &ManifestPayload,
    ) -> Result<String> {
        self.put_manifest(repo, reference, &manifest.bytes).await
    }

    async fn catalog(&self) -> Result<Vec<String>> {
        self.repositories().await
    }

    async fn tags(&self, repo: &str) -> Result<Vec<String>> {
        self.list_tags(repo).await
    }

    async fn delete_manifest(&self, repo: &str, digest: &str) -> Result<()> {
        self.remove_manifest(repo, digest).await
    }
}
