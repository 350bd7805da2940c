//! Pull-through cache over a local registry.
//!
//! Reads that miss the local store are fetched from the remote registry
//! and persisted; later reads are served locally.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sealreg_core::config::StorageConfig;
use sealreg_core::error::{RegistryError, Result};

use crate::auth::Credential;
use crate::endpoint::{BlobStream, ManifestPayload, RegistryEndpoint};
use crate::reference::DEFAULT_DOMAIN;
use crate::remote::RemoteClient;
use crate::storage::{DriverFactory, LocalRegistry};
use crate::storage::paths::looks_like_digest;

/// Remote used for Docker Hub and for credentials without a domain.
pub const DOCKER_HUB_PROXY_URL: &str = "https://registry-1.docker.io";

/// Where a proxy fetches from and how it authenticates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub remote_url: String,
    pub username: String,
    pub password: String,
}

impl ProxyConfig {
    pub fn from_credential(credential: &Credential) -> Result<Self> {
        let (username, password) = credential.user_password()?;
        let remote_url = if credential.domain.is_empty() || credential.domain == DEFAULT_DOMAIN {
            DOCKER_HUB_PROXY_URL.to_string()
        } else if credential.domain.contains("://") {
            credential.domain.clone()
        } else {
            let scheme = credential.scheme.map(|s| s.as_str()).unwrap_or("https");
            format!("{}://{}", scheme, credential.domain)
        };
        if !credential.identity_token.is_empty() && username.is_empty() {
            tracing::warn!(
                domain = %credential.domain,
                "Identity tokens are not supported by the proxy, pulling anonymously"
            );
        }
        Ok(Self {
            remote_url,
            username,
            password,
        })
    }
}

/// A local registry fronted by a remote one.
#[derive(Clone)]
pub struct ProxyRegistry {
    local: LocalRegistry,
    remote: Arc<RemoteClient>,
    config: ProxyConfig,
}

impl std::fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRegistry")
            .field("remote", &self.remote.base_url().as_str())
            .finish()
    }
}

impl ProxyRegistry {
    /// Open the configured driver at `root` and connect to the remote.
    pub async fn new(
        root: &Path,
        credential: &Credential,
        factory: &DriverFactory,
        storage: &StorageConfig,
    ) -> Result<Self> {
        let local = LocalRegistry::open(root, factory, storage)?;
        Self::with_local(local, credential, None).await
    }

    /// Front an existing local registry. HTTPS is tried first; a failed
    /// HTTPS probe is retried over HTTP.
    pub async fn with_local(
        local: LocalRegistry,
        credential: &Credential,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let config = ProxyConfig::from_credential(credential)?;
        let (username, password) = if config.username.is_empty() {
            (None, None)
        } else {
            (Some(config.username.clone()), Some(config.password.clone()))
        };
        let remote = RemoteClient::connect(&config.remote_url, username, password, timeout).await?;
        tracing::debug!(remote = %remote.base_url(), "Proxy registry ready");
        Ok(Self {
            local,
            remote: Arc::new(remote),
            config,
        })
    }

    pub fn local(&self) -> &LocalRegistry {
        &self.local
    }

    pub fn remote(&self) -> &RemoteClient {
        &self.remote
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn repository(&self, name: &str) -> ProxyRepository<'_> {
        ProxyRepository {
            proxy: self,
            name: name.to_string(),
        }
    }
}

/// One repository of a [`ProxyRegistry`].
pub struct ProxyRepository<'a> {
    proxy: &'a ProxyRegistry,
    name: String,
}

impl ProxyRepository<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local(&self) -> &LocalRegistry {
        &self.proxy.local
    }

    /// Resolve `tag` on the remote and record it locally.
    ///
    /// Falls back to the local tag when the remote cannot be reached.
    pub async fn tag_digest(&self, tag: &str) -> Result<String> {
        Ok(self.manifest(tag).await?.digest)
    }

    /// Fetch a manifest by tag or digest, persisting remote hits.
    pub async fn manifest(&self, reference: &str) -> Result<ManifestPayload> {
        let local = &self.proxy.local;
        if looks_like_digest(reference) {
            if let Some(cached) = local.get_manifest(&self.name, reference).await? {
                return Ok(cached);
            }
        }

        match self.proxy.remote.manifest(&self.name, reference).await {
            Ok(Some(payload)) => {
                local.put_manifest(&self.name, reference, &payload.bytes).await?;
                Ok(payload)
            }
            Ok(None) => Err(RegistryError::NotFound(format!(
                "manifest {}:{} on {}",
                self.name,
                reference,
                self.proxy.remote.registry()
            ))),
            Err(e) => {
                let cached = local.get_manifest(&self.name, reference).await?;
                match cached {
                    Some(payload) => {
                        tracing::warn!(
                            repository = %self.name,
                            reference,
                            error = %e,
                            "Remote unavailable, serving cached manifest"
                        );
                        Ok(payload)
                    }
                    None => Err(e),
                }
            }
        }
    }

    pub async fn blob_exists(&self, digest: &str) -> Result<bool> {
        self.proxy.local.has_blob(&self.name, digest).await
    }

    /// Make `digest` present locally. Returns whether bytes were transferred.
    ///
    /// A blob whose data already exists is only linked into the repository.
    pub async fn fetch_blob(&self, digest: &str) -> Result<bool> {
        let local = &self.proxy.local;
        if local.has_blob(&self.name, digest).await? {
            local.stats().record_skip();
            return Ok(false);
        }
        if local.blob_size(digest).await?.is_some() {
            local.link_blob(&self.name, digest).await?;
            local.stats().record_skip();
            return Ok(false);
        }

        let blob = self.proxy.remote.open_blob(&self.name, digest).await?;
        let mut upload = local.begin_upload(&self.name).await?;
        upload.write_stream(blob.stream).await?;
        upload.commit(digest).await?;
        Ok(true)
    }

    /// Stream a blob, fetching it into the cache first when absent.
    pub async fn open_blob(&self, digest: &str) -> Result<BlobStream> {
        self.fetch_blob(digest).await?;
        self.proxy.local.open_blob(&self.name, digest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Scheme;

    #[test]
    fn test_config_for_docker_hub() {
        let config = ProxyConfig::from_credential(&Credential::anonymous("docker.io")).unwrap();
        assert_eq!(config.remote_url, DOCKER_HUB_PROXY_URL);
        assert!(config.username.is_empty());

        let config = ProxyConfig::from_credential(&Credential::default()).unwrap();
        assert_eq!(config.remote_url, DOCKER_HUB_PROXY_URL);
    }

    #[test]
    fn test_config_for_private_registry() {
        let config =
            ProxyConfig::from_credential(&Credential::basic("registry.local:5000", "u", "p")).unwrap();
        assert_eq!(config.remote_url, "https://registry.local:5000");
        assert_eq!(config.username, "u");
        assert_eq!(config.password, "p");

        let mut credential = Credential::anonymous("10.0.0.2:5000");
        credential.scheme = Some(Scheme::Http);
        let config = ProxyConfig::from_credential(&credential).unwrap();
        assert_eq!(config.remote_url, "http://10.0.0.2:5000");
    }

    #[test]
    fn test_config_decodes_auth() {
        let credential = Credential {
            domain: "quay.io".into(),
            auth: "dTpw".into(),
            ..Default::default()
        };
        let config = ProxyConfig::from_credential(&credential).unwrap();
        assert_eq!(config.username, "u");
        assert_eq!(config.password, "p");
    }

    #[tokio::test]
    async fn test_unreachable_remote_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dir = tempfile::TempDir::new().unwrap();
        let factory = DriverFactory::with_defaults();
        let credential = Credential::anonymous(&addr.to_string());
        let result = ProxyRegistry::new(dir.path(), &credential, &factory, &StorageConfig::default()).await;
        assert!(matches!(result, Err(RegistryError::ProbeFailure { .. })));
    }
}
