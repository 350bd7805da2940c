//! Image copy between two registry endpoints.

use std::sync::Arc;

use futures::StreamExt;
use sealreg_core::config::CopySelection;
use sealreg_core::error::{RegistryError, Result};
use sealreg_core::progress::{ProgressEmitter, ProgressEvent, ProgressStatus};
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::endpoint::{ManifestPayload, RegistryEndpoint};
use crate::manifest::{blob_descriptors, is_manifest_list, list_children, resolve_image_digest, BlobDescriptor, Platform};
use crate::reference::ImageReference;

/// Default number of blobs copied at once.
pub const DEFAULT_COPY_CONCURRENCY: usize = 5;

/// Copies images from `src` to `dst`, blobs before the manifests that
/// reference them.
pub struct ImageCopier<'a> {
    src: &'a dyn RegistryEndpoint,
    dst: &'a dyn RegistryEndpoint,
    platform: Platform,
    concurrency: usize,
    gate: Option<Arc<Semaphore>>,
    progress: Option<ProgressEmitter>,
}

impl<'a> ImageCopier<'a> {
    pub fn new(src: &'a dyn RegistryEndpoint, dst: &'a dyn RegistryEndpoint) -> Self {
        Self {
            src,
            dst,
            platform: Platform::host(),
            concurrency: DEFAULT_COPY_CONCURRENCY,
            gate: None,
            progress: None,
        }
    }

    /// Platform used to pick a system image out of a list.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Share a transfer gate with other copiers. Every manifest fetch and
    /// blob transfer holds one permit.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_progress(mut self, progress: ProgressEmitter) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Copy `src` to `dst` and return the digest stored under `dst`.
    pub async fn copy(
        &self,
        src: &ImageReference,
        dst: &ImageReference,
        selection: CopySelection,
    ) -> Result<String> {
        let payload = {
            let _permit = self.permit().await?;
            self.src.manifest(&src.repository, src.identifier()).await?
        }
        .ok_or_else(|| {
            RegistryError::NotFound(format!("{} on {}", src.full_name(), self.src.describe()))
        })?;
        let is_list = is_manifest_list(&payload.media_type)
            || (payload.media_type.is_empty()
                && list_children(&payload.bytes).map_or(false, |c| !c.is_empty()));

        tracing::debug!(
            src = %src.full_name(),
            dst = %dst.full_name(),
            list = is_list,
            ?selection,
            "Copying image"
        );

        let digest = match (is_list, selection) {
            (true, CopySelection::All) => {
                for child in list_children(&payload.bytes)? {
                    let manifest = self.child_manifest(src, &child).await?;
                    self.copy_manifest(src, dst, &manifest, &child).await?;
                }
                self.dst
                    .push_manifest(&dst.repository, dst.identifier(), &payload)
                    .await?
            }
            _ => {
                let target = resolve_image_digest(
                    &payload.bytes,
                    &payload.media_type,
                    &self.platform,
                    &payload.digest,
                )?;
                let manifest = if target == payload.digest {
                    payload
                } else {
                    self.child_manifest(src, &target).await?
                };
                self.copy_manifest(src, dst, &manifest, dst.identifier()).await?
            }
        };

        self.emit(ProgressEvent::new(dst.full_name(), ProgressStatus::Done));
        Ok(digest)
    }

    async fn permit(&self) -> Result<Option<SemaphorePermit<'_>>> {
        match &self.gate {
            Some(gate) => gate
                .acquire()
                .await
                .map(Some)
                .map_err(|_| RegistryError::Cancelled("transfer gate closed".to_string())),
            None => Ok(None),
        }
    }

    async fn child_manifest(&self, src: &ImageReference, digest: &str) -> Result<ManifestPayload> {
        let _permit = self.permit().await?;
        self.src
            .manifest(&src.repository, digest)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("{}@{}", src.name(), digest)))
    }

    /// Copy the blobs of one image manifest, then the manifest itself.
    async fn copy_manifest(
        &self,
        src: &ImageReference,
        dst: &ImageReference,
        manifest: &ManifestPayload,
        reference: &str,
    ) -> Result<String> {
        let blobs = blob_descriptors(&manifest.bytes)?;
        let mut results = futures::stream::iter(blobs)
            .map(|blob| self.copy_blob(src, dst, blob))
            .buffer_unordered(self.concurrency);

        let mut first_error = None;
        while let Some(result) = results.next().await {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.dst
            .push_manifest(&dst.repository, reference, manifest)
            .await
    }

    async fn copy_blob(&self, src: &ImageReference, dst: &ImageReference, blob: BlobDescriptor) -> Result<()> {
        let id = short_digest(&blob.digest);
        if self.dst.blob_exists(&dst.repository, &blob.digest).await? {
            self.emit(ProgressEvent::new(id, ProgressStatus::AlreadyExists));
            return Ok(());
        }

        let _permit = self.permit().await?;
        self.emit(ProgressEvent::new(id.clone(), ProgressStatus::Copying).with_bytes(0, Some(blob.size)));
        let wrap = |e: RegistryError| match e {
            e @ RegistryError::BlobTransfer { .. } => e,
            e => RegistryError::BlobTransfer {
                image: src.full_name(),
                message: format!("{}: {}", blob.digest, e),
            },
        };
        let stream = self
            .src
            .open_blob(&src.repository, &blob.digest)
            .await
            .map_err(wrap)?;
        self.dst
            .push_blob(&dst.repository, &blob.digest, stream)
            .await
            .map_err(wrap)?;

        tracing::debug!(digest = %blob.digest, size = blob.size, "Copied blob");
        self.emit(ProgressEvent::new(id, ProgressStatus::DownloadComplete).with_bytes(blob.size, Some(blob.size)));
        Ok(())
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress.emit(event);
        }
    }
}

/// First 12 hex characters of a digest, as shown in progress output.
pub(crate) fn short_digest(digest: &str) -> String {
    let hex = digest.split_once(':').map_or(digest, |(_, h)| h);
    hex.chars().take(12).collect()
}
