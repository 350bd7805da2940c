//! Distribution on-disk layout.
//!
//! ```text
//! /docker/registry/v2/blobs/<alg>/<hex[..2]>/<hex>/data
//! /docker/registry/v2/repositories/<name>/_layers/<alg>/<hex>/link
//! /docker/registry/v2/repositories/<name>/_manifests/revisions/<alg>/<hex>/link
//! /docker/registry/v2/repositories/<name>/_manifests/tags/<tag>/current/link
//! /docker/registry/v2/repositories/<name>/_manifests/tags/<tag>/index/<alg>/<hex>/link
//! /docker/registry/v2/repositories/<name>/_uploads/<uuid>/data
//! ```

use sealreg_core::error::{RegistryError, Result};

pub const ROOT: &str = "/docker/registry/v2";

/// A validated `algorithm:hex` digest split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestParts<'a> {
    pub algorithm: &'a str,
    pub hex: &'a str,
}

pub fn split_digest(digest: &str) -> Result<DigestParts<'_>> {
    let (algorithm, hex) = digest
        .split_once(':')
        .ok_or_else(|| RegistryError::InvalidReference(format!("invalid digest '{}'", digest)))?;
    let valid_alg = !algorithm.is_empty()
        && algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let valid_hex = hex.len() >= 2 && hex.chars().all(|c| c.is_ascii_hexdigit());
    if !valid_alg || !valid_hex {
        return Err(RegistryError::InvalidReference(format!(
            "invalid digest '{}'",
            digest
        )));
    }
    Ok(DigestParts { algorithm, hex })
}

pub fn looks_like_digest(reference: &str) -> bool {
    split_digest(reference).is_ok()
}

pub fn blob_dir(digest: &str) -> Result<String> {
    let d = split_digest(digest)?;
    Ok(format!("{}/blobs/{}/{}/{}", ROOT, d.algorithm, &d.hex[..2], d.hex))
}

pub fn blob_data(digest: &str) -> Result<String> {
    Ok(format!("{}/data", blob_dir(digest)?))
}

pub fn repositories() -> String {
    format!("{}/repositories", ROOT)
}

pub fn repository(name: &str) -> String {
    format!("{}/repositories/{}", ROOT, name)
}

pub fn layer_link(name: &str, digest: &str) -> Result<String> {
    let d = split_digest(digest)?;
    Ok(format!("{}/_layers/{}/{}/link", repository(name), d.algorithm, d.hex))
}

pub fn manifest_revision_dir(name: &str, digest: &str) -> Result<String> {
    let d = split_digest(digest)?;
    Ok(format!(
        "{}/_manifests/revisions/{}/{}",
        repository(name),
        d.algorithm,
        d.hex
    ))
}

pub fn manifest_revision_link(name: &str, digest: &str) -> Result<String> {
    Ok(format!("{}/link", manifest_revision_dir(name, digest)?))
}

pub fn tags(name: &str) -> String {
    format!("{}/_manifests/tags", repository(name))
}

pub fn tag_dir(name: &str, tag: &str) -> String {
    format!("{}/{}", tags(name), tag)
}

pub fn tag_current_link(name: &str, tag: &str) -> String {
    format!("{}/current/link", tag_dir(name, tag))
}

pub fn tag_index_link(name: &str, tag: &str, digest: &str) -> Result<String> {
    let d = split_digest(digest)?;
    Ok(format!(
        "{}/index/{}/{}/link",
        tag_dir(name, tag),
        d.algorithm,
        d.hex
    ))
}

pub fn upload_dir(name: &str, uuid: &str) -> String {
    format!("{}/_uploads/{}", repository(name), uuid)
}

pub fn upload_data(name: &str, uuid: &str) -> String {
    format!("{}/data", upload_dir(name, uuid))
}

pub fn upload_started_at(name: &str, uuid: &str) -> String {
    format!("{}/startedat", upload_dir(name, uuid))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_blob_data_path() {
        assert_eq!(
            blob_data(DIGEST).unwrap(),
            "/docker/registry/v2/blobs/sha256/e3/e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855/data"
        );
    }

    #[test]
    fn test_repository_links() {
        assert_eq!(
            tag_current_link("library/nginx", "latest"),
            "/docker/registry/v2/repositories/library/nginx/_manifests/tags/latest/current/link"
        );
        assert!(layer_link("library/nginx", DIGEST)
            .unwrap()
            .ends_with("/_layers/sha256/e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855/link"));
        assert!(manifest_revision_link("a/b", DIGEST)
            .unwrap()
            .starts_with("/docker/registry/v2/repositories/a/b/_manifests/revisions/sha256/"));
    }

    #[test]
    fn test_invalid_digests() {
        assert!(blob_data("latest").is_err());
        assert!(blob_data("sha256:").is_err());
        assert!(blob_data("sha256:../../etc").is_err());
        assert!(!looks_like_digest("v1.0"));
        assert!(looks_like_digest(DIGEST));
    }
}
