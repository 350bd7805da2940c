//! A registry seen as a source or destination of images.
//!
//! Implemented by the remote Distribution client and by the local
//! storage-backed registry, so copy, sync and listing work the same way
//! against either.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use sealreg_core::error::Result;

use crate::manifest::sha256_digest;

/// Stream of blob bytes.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Blob content in flight between two endpoints.
pub struct BlobStream {
    /// Length when the source knows it
    pub size: Option<u64>,
    pub stream: ByteStream,
}

impl std::fmt::Debug for BlobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStream").field("size", &self.size).finish()
    }
}

/// Raw manifest bytes with their digest and media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPayload {
    pub digest: String,
    /// Empty when neither the payload nor the transport named one
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl ManifestPayload {
    pub fn new(bytes: Vec<u8>, media_type: impl Into<String>) -> Self {
        Self {
            digest: sha256_digest(&bytes),
            media_type: media_type.into(),
            bytes,
        }
    }
}

#[async_trait]
pub trait RegistryEndpoint: Send + Sync {
    /// Human-readable location, used in errors and logs.
    fn describe(&self) -> String;

    /// Fetch a manifest by tag or digest. `None` when it does not exist.
    async fn manifest(&self, repo: &str, reference: &str) -> Result<Option<ManifestPayload>>;

    /// Resolve a tag or digest to a manifest digest without the body.
    async fn manifest_digest(&self, repo: &str, reference: &str) -> Result<Option<String>>;

    async fn blob_exists(&self, repo: &str, digest: &str) -> Result<bool>;

    async fn open_blob(&self, repo: &str, digest: &str) -> Result<BlobStream>;

    async fn push_blob(&self, repo: &str, digest: &str, blob: BlobStream) -> Result<()>;

    /// Store a manifest under `reference` and return its digest.
    async fn push_manifest(
        &self,
        repo: &str,
        reference: &str,
        manifest: &ManifestPayload,
    ) -> Result<String>;

    async fn catalog(&self) -> Result<Vec<String>>;

    async fn tags(&self, repo: &str) -> Result<Vec<String>>;

    async fn delete_manifest(&self, repo: &str, digest: &str) -> Result<()>;
}
