//! Manifest and blob resolution.
//!
//! Resolves a manifest payload to the digest of a single image manifest
//! for a target platform, and decomposes image manifests into the blobs
//! they reference.

use oci_spec::image::{ImageIndex, ImageManifest};
use sealreg_core::error::{RegistryError, Result};
use serde::Deserialize;

pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Media types accepted when fetching manifests.
pub const MANIFEST_ACCEPT: &[&str] = &[
    MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_OCI_INDEX,
];

pub fn is_image_manifest(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_DOCKER_MANIFEST || media_type == MEDIA_TYPE_OCI_MANIFEST
}

pub fn is_manifest_list(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST || media_type == MEDIA_TYPE_OCI_INDEX
}

/// Target platform used to pick an entry out of a manifest list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: String,
    pub os_version: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            ..Default::default()
        }
    }

    /// Parse `os/arch[/variant]`, e.g. `linux/arm64/v8`.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self::new(*os, *arch)),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    variant: variant.to_string(),
                    ..Self::new(*os, *arch)
                })
            }
            _ => Err(RegistryError::Config(format!(
                "invalid platform '{}': expected os/arch[/variant]",
                s
            ))),
        }
    }

    /// Platform of the running host, in OCI naming.
    pub fn host() -> Self {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" => "ppc64le",
            other => other,
        };
        Self::new(std::env::consts::OS, arch)
    }

    /// Number of non-empty target fields equal to the candidate's.
    fn weight(&self, os: &str, architecture: &str, variant: &str, os_version: &str) -> usize {
        [
            (&self.os, os),
            (&self.architecture, architecture),
            (&self.variant, variant),
            (&self.os_version, os_version),
        ]
        .iter()
        .filter(|(want, got)| !want.is_empty() && want.as_str() == *got)
        .count()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if !self.variant.is_empty() {
            write!(f, "/{}", self.variant)?;
        }
        Ok(())
    }
}

/// A content-addressed blob referenced by an image manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    pub digest: String,
    pub size: u64,
    pub media_type: String,
}

#[derive(Deserialize)]
struct MediaTypeProbe {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
}

/// The payload's own `mediaType` field, or "" when absent.
pub fn detect_media_type(payload: &[u8]) -> String {
    serde_json::from_slice::<MediaTypeProbe>(payload)
        .ok()
        .and_then(|p| p.media_type)
        .unwrap_or_default()
}

/// Content type to serve for a stored payload without a `mediaType` field.
pub fn infer_content_type(payload: &[u8]) -> String {
    let media_type = detect_media_type(payload);
    if !media_type.is_empty() {
        return media_type;
    }
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(v) if v.get("manifests").is_some() => MEDIA_TYPE_OCI_INDEX.to_string(),
        _ => MEDIA_TYPE_OCI_MANIFEST.to_string(),
    }
}

/// Pick the digest of the best-matching manifest list entry.
///
/// Each of os, architecture, variant and os version scores one point when
/// the target field is set and equal. The highest non-zero score wins and
/// ties keep the first entry.
pub fn select_platform(index: &ImageIndex, platform: &Platform) -> Result<String> {
    let mut best: Option<(usize, String)> = None;
    for entry in index.manifests() {
        let Some(p) = entry.platform() else {
            continue;
        };
        let weight = platform.weight(
            &p.os().to_string(),
            &p.architecture().to_string(),
            p.variant().as_deref().unwrap_or(""),
            p.os_version().as_deref().unwrap_or(""),
        );
        if weight == 0 {
            continue;
        }
        if best.as_ref().map_or(true, |(w, _)| weight > *w) {
            best = Some((weight, entry.digest().to_string()));
        }
    }

    best.map(|(_, digest)| digest)
        .ok_or_else(|| RegistryError::PlatformNotMatched(platform.to_string()))
}

/// Parse a list payload and select the entry for `platform`.
pub fn image_digest_from_list(payload: &[u8], platform: &Platform) -> Result<String> {
    let index: ImageIndex = serde_json::from_slice(payload)?;
    select_platform(&index, platform)
}

/// Resolve a manifest payload to a single image manifest digest.
///
/// `digest` is the digest the payload was fetched by. Image manifests
/// resolve to it, lists to the platform-selected child. A payload with no
/// media type is tried as a list first and taken as an image otherwise.
pub fn resolve_image_digest(
    payload: &[u8],
    content_type: &str,
    platform: &Platform,
    digest: &str,
) -> Result<String> {
    match content_type {
        ct if is_image_manifest(ct) => Ok(digest.to_string()),
        ct if is_manifest_list(ct) => image_digest_from_list(payload, platform),
        "" => match image_digest_from_list(payload, platform) {
            Ok(child) => Ok(child),
            Err(_) => Ok(digest.to_string()),
        },
        other => Err(RegistryError::UnrecognizedManifestType(other.to_string())),
    }
}

/// Config and layer blobs of an image manifest, config first.
pub fn blob_descriptors(payload: &[u8]) -> Result<Vec<BlobDescriptor>> {
    let manifest: ImageManifest = serde_json::from_slice(payload)?;
    let descriptor = |d: &oci_spec::image::Descriptor| BlobDescriptor {
        digest: d.digest().to_string(),
        size: d.size() as u64,
        media_type: d.media_type().to_string(),
    };

    let mut blobs = Vec::with_capacity(manifest.layers().len() + 1);
    blobs.push(descriptor(manifest.config()));
    blobs.extend(manifest.layers().iter().map(descriptor));
    blobs.retain(|b| !b.digest.is_empty());
    Ok(blobs)
}

/// Digests of every child of a manifest list.
pub fn list_children(payload: &[u8]) -> Result<Vec<String>> {
    let index: ImageIndex = serde_json::from_slice(payload)?;
    Ok(index
        .manifests()
        .iter()
        .map(|m| m.digest().to_string())
        .collect())
}

/// `sha256:<hex>` of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}
