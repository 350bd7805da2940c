//! Image reference parsing.
//!
//! Normalizes user-supplied image strings such as `nginx`,
//! `quay.io/org/app:v2` or `docker.io/library/alpine@sha256:...` into
//! `{domain, repository, tag, digest}`.

use lazy_static::lazy_static;
use regex::Regex;
use sealreg_core::error::{RegistryError, Result};

/// Public hub domain used when none is given.
pub const DEFAULT_DOMAIN: &str = "docker.io";

/// Tag applied when neither tag nor digest is given.
pub const DEFAULT_TAG: &str = "latest";

/// Docker Hub host names that mean the same registry.
const DOCKER_HUB_ALIASES: &[&str] = &["index.docker.io", "registry-1.docker.io"];

lazy_static! {
    static ref COMPONENT_RE: Regex = Regex::new(r"^[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*$").unwrap();
    static ref TAG_RE: Regex = Regex::new(r"^[\w][\w.-]{0,127}$").unwrap();
    static ref DIGEST_RE: Regex =
        Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-zA-Z0-9=_-]{32,}$").unwrap();
}

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host, with port when given (e.g. "docker.io", "localhost:5000")
    pub domain: String,
    /// Repository path (e.g. "library/nginx", "labring/lvscare")
    pub repository: String,
    pub tag: Option<String>,
    /// Content digest, authoritative over the tag when present
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse and normalize an image reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(RegistryError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }
        if reference.matches('@').count() > 1 {
            return Err(RegistryError::InvalidReference(format!(
                "multiple '@' in reference '{}'",
                reference
            )));
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((name_tag, digest)) => {
                if !DIGEST_RE.is_match(digest) {
                    return Err(RegistryError::InvalidReference(format!(
                        "invalid digest '{}' in reference '{}'",
                        digest, reference
                    )));
                }
                (name_tag, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A colon after the last slash separates the tag; one before it is a port.
        let last_slash = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let colon = last_slash + colon;
                let tag = &name_tag[colon + 1..];
                if !TAG_RE.is_match(tag) {
                    return Err(RegistryError::InvalidReference(format!(
                        "invalid tag '{}' in reference '{}'",
                        tag, reference
                    )));
                }
                (&name_tag[..colon], Some(tag.to_string()))
            }
            None => (name_tag, None),
        };

        let (domain, repository) = split_domain(name)?;
        validate_repository(&repository, reference)?;

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(Self {
            domain,
            repository,
            tag,
            digest,
        })
    }

    /// Digest when present, otherwise the tag.
    pub fn identifier(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// `domain/repository`
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.repository)
    }

    /// `domain/repository@digest` or `domain/repository:tag`.
    pub fn full_name(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => format!("{}@{}", self.name(), digest),
            (None, Some(tag)) => format!("{}:{}", self.name(), tag),
            (None, None) => format!("{}:{}", self.name(), DEFAULT_TAG),
        }
    }

    /// Reference to `repository:tag` on `domain`, taken as-is.
    pub fn tagged(domain: &str, repository: &str, tag: &str) -> Self {
        Self {
            domain: domain.to_string(),
            repository: repository.to_string(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }

    /// Same repository, tag and digest on another registry host.
    pub fn with_domain(&self, domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            ..self.clone()
        }
    }

    pub fn is_docker_hub(&self) -> bool {
        self.domain == DEFAULT_DOMAIN
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Map Docker Hub aliases to the canonical hub domain.
pub fn normalize_domain(domain: &str) -> String {
    if DOCKER_HUB_ALIASES.contains(&domain) {
        DEFAULT_DOMAIN.to_string()
    } else {
        domain.to_string()
    }
}

fn split_domain(name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(RegistryError::InvalidReference(format!(
                    "empty repository in '{}'",
                    name
                )));
            }
            let domain = normalize_domain(first);
            let repository = if domain == DEFAULT_DOMAIN && !rest.contains('/') {
                format!("library/{}", rest)
            } else {
                rest.to_string()
            };
            return Ok((domain, repository));
        }
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_DOMAIN.to_string(), repository))
}

fn validate_repository(repository: &str, reference: &str) -> Result<()> {
    for component in repository.split('/') {
        if !COMPONENT_RE.is_match(component) {
            return Err(RegistryError::InvalidReference(format!(
                "invalid repository component '{}' in reference '{}'",
                component, reference
            )));
        }
    }
    Ok(())
}
