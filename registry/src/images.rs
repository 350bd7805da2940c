//! Image listing and removal over any registry endpoint.

use sealreg_core::error::{RegistryError, Result};

use crate::endpoint::RegistryEndpoint;
use crate::filter::{Filter, FilterStrategy, FilterType, NONE_MARKER};
use crate::reference::ImageReference;

/// `name:tag` of every image matching `filter`.
///
/// A repository without tags is reported once as `name:<none>` and only
/// when the tag filter is the `<none>` marker.
pub async fn list_images(endpoint: &dyn RegistryEndpoint, filter: &Filter) -> Result<Vec<String>> {
    let repositories = endpoint.catalog().await?;
    let mut images = Vec::new();

    for repo in filter.run(&repositories, FilterType::Name) {
        let tags = endpoint.tags(&repo).await?;
        if tags.is_empty() {
            if filter.tag == FilterStrategy::None {
                images.push(format!("{}:{}", repo, NONE_MARKER));
            }
            continue;
        }
        for tag in filter.run(&tags, FilterType::Tag) {
            images.push(format!("{}:{}", repo, tag));
        }
    }

    tracing::debug!(registry = %endpoint.describe(), count = images.len(), "Listed images");
    Ok(images)
}

/// Delete the manifest `image` points at. Returns the deleted digest.
///
/// Tags are resolved to a digest first; every tag sharing that manifest
/// goes with it.
pub async fn remove_image(endpoint: &dyn RegistryEndpoint, image: &str) -> Result<String> {
    let reference = ImageReference::parse(image)?;
    let digest = endpoint
        .manifest_digest(&reference.repository, reference.identifier())
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("image {}", reference.full_name())))?;

    endpoint.delete_manifest(&reference.repository, &digest).await?;
    tracing::info!(image = %reference, digest = %digest, "Removed image");
    Ok(digest)
}
