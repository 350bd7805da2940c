//! Distribution API client.
//!
//! Speaks `/v2/` over `reqwest` with Bearer-challenge and Basic auth,
//! caching one `Authorization` value per scope.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LINK, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use sealreg_core::error::{RegistryError, Result};
use serde::Deserialize;

use crate::endpoint::{BlobStream, ManifestPayload, RegistryEndpoint};
use crate::manifest::{detect_media_type, infer_content_type, is_image_manifest, is_manifest_list, MANIFEST_ACCEPT};

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
const CATALOG_PAGE_SIZE: usize = 1000;

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

impl AuthChallenge {
    /// Parse `Bearer realm="...",service="...",scope="..."` or `Basic realm="..."`.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (kind, rest) = header.split_once(' ').unwrap_or((header, ""));
        match kind.to_ascii_lowercase().as_str() {
            "basic" => Some(AuthChallenge::Basic),
            "bearer" => {
                let params = parse_params(rest);
                Some(AuthChallenge::Bearer {
                    realm: params.get("realm")?.clone(),
                    service: params.get("service").cloned(),
                    scope: params.get("scope").cloned(),
                })
            }
            _ => None,
        }
    }
}

/// `key="value"` pairs separated by commas. Quoted values may contain commas.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_ascii_lowercase();
        rest = &rest[eq + 1..];
        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            let value = &quoted[..end];
            rest = quoted.get(end + 1..).unwrap_or("");
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = &rest[..end];
            rest = &rest[end..];
            value.trim()
        };
        params.insert(key, value.to_string());
        rest = rest.trim_start().trim_start_matches(',').trim_start();
    }
    params
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    repositories: Vec<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

fn pull_scope(repo: &str) -> String {
    format!("repository:{}:pull", repo)
}

fn push_scope(repo: &str) -> String {
    format!("repository:{}:pull,push", repo)
}

fn delete_scope(repo: &str) -> String {
    format!("repository:{}:delete", repo)
}

const CATALOG_SCOPE: &str = "registry:catalog:*";

/// Parse a registry address, defaulting to `https://`.
pub fn parse_registry_url(remote: &str) -> Result<Url> {
    let with_scheme = if remote.contains("://") {
        remote.to_string()
    } else {
        format!("https://{}", remote)
    };
    Url::parse(&with_scheme)
        .map_err(|e| RegistryError::Config(format!("invalid registry URL '{}': {}", remote, e)))
}

/// Client for one registry host.
pub struct RemoteClient {
    http: reqwest::Client,
    base: Url,
    registry: String,
    credential: Option<(String, String)>,
    auth_cache: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("base", &self.base.as_str())
            .field("authenticated", &self.credential.is_some())
            .finish()
    }
}

impl RemoteClient {
    /// Create a client for `base`. Empty usernames mean anonymous access.
    pub fn new(base: Url, username: Option<String>, password: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("sealreg/{}", sealreg_core::VERSION))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RegistryError::Config(format!("failed to build HTTP client: {}", e)))?;

        let registry = match base.port() {
            Some(port) => format!("{}:{}", base.host_str().unwrap_or_default(), port),
            None => base.host_str().unwrap_or_default().to_string(),
        };
        let credential = match (username, password) {
            (Some(u), Some(p)) if !u.is_empty() => Some((u, p)),
            _ => None,
        };

        Ok(Self {
            http,
            base,
            registry,
            credential,
            auth_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Connect to `remote`, falling back from HTTPS to HTTP when the
    /// HTTPS endpoint does not answer. Never the other way round.
    pub async fn connect(
        remote: &str,
        username: Option<String>,
        password: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let url = parse_registry_url(remote)?;
        let client = Self::new(url.clone(), username.clone(), password.clone())?;
        let first = match client.ping_within(timeout).await {
            Ok(()) => return Ok(client),
            Err(e) => e,
        };
        if url.scheme() != "https" {
            return Err(RegistryError::ProbeFailure {
                domain: client.registry,
                message: first.to_string(),
            });
        }

        let mut http_url = url;
        http_url
            .set_scheme("http")
            .map_err(|_| RegistryError::Config(format!("cannot downgrade {}", remote)))?;
        tracing::warn!(
            registry = %client.registry,
            error = %first,
            "HTTPS probe failed, falling back to HTTP"
        );

        let fallback = Self::new(http_url, username, password)?;
        match fallback.ping_within(timeout).await {
            Ok(()) => Ok(fallback),
            Err(second) => Err(RegistryError::ProbeFailure {
                domain: fallback.registry,
                message: format!("https: {}; http: {}", first, second),
            }),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `host[:port]` of the registry.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn scheme(&self) -> &str {
        self.base.scheme()
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| RegistryError::Config(format!("invalid path '{}': {}", path, e)))
    }

    fn transport_err(&self, e: reqwest::Error) -> RegistryError {
        if e.is_timeout() {
            RegistryError::Timeout(format!("{}: {}", self.registry, e))
        } else {
            RegistryError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{}: {}", self.registry, e),
            ))
        }
    }

    async fn status_err(&self, resp: Response) -> RegistryError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(env) if !env.errors.is_empty() => env
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect::<Vec<_>>()
                .join("; "),
            _ => body.chars().take(256).collect(),
        };
        RegistryError::Remote {
            registry: self.registry.clone(),
            status,
            message,
        }
    }

    fn cached_auth(&self, scope: &str) -> Option<String> {
        self.auth_cache.lock().get(scope).cloned()
    }

    fn basic_header(&self) -> Option<String> {
        self.credential.as_ref().map(|(u, p)| {
            let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", u, p));
            format!("Basic {}", encoded)
        })
    }

    /// Answer a challenge with an `Authorization` header value.
    async fn authorize(&self, challenge: &AuthChallenge, scope: &str) -> Result<String> {
        match challenge {
            AuthChallenge::Basic => self.basic_header().ok_or_else(|| RegistryError::Remote {
                registry: self.registry.clone(),
                status: 401,
                message: "basic authentication required".to_string(),
            }),
            AuthChallenge::Bearer {
                realm,
                service,
                scope: challenge_scope,
            } => {
                let mut url = Url::parse(realm).map_err(|e| RegistryError::Remote {
                    registry: self.registry.clone(),
                    status: 401,
                    message: format!("invalid token realm '{}': {}", realm, e),
                })?;
                {
                    let mut query = url.query_pairs_mut();
                    if let Some(service) = service {
                        query.append_pair("service", service);
                    }
                    let scope = if scope.is_empty() {
                        challenge_scope.as_deref().unwrap_or("")
                    } else {
                        scope
                    };
                    if !scope.is_empty() {
                        query.append_pair("scope", scope);
                    }
                }

                let mut req = self.http.get(url);
                if let Some((u, p)) = &self.credential {
                    req = req.basic_auth(u, Some(p));
                }
                let resp = req.send().await.map_err(|e| self.transport_err(e))?;
                if !resp.status().is_success() {
                    return Err(self.status_err(resp).await);
                }
                let token: TokenResponse = resp.json().await.map_err(|e| RegistryError::Remote {
                    registry: self.registry.clone(),
                    status: 200,
                    message: format!("invalid token response: {}", e),
                })?;
                let token = token
                    .token
                    .or(token.access_token)
                    .ok_or_else(|| RegistryError::Remote {
                        registry: self.registry.clone(),
                        status: 200,
                        message: "token response carried no token".to_string(),
                    })?;
                Ok(format!("Bearer {}", token))
            }
        }
    }

    /// Send a request, answering one auth challenge and retrying once.
    async fn send<F>(&self, scope: &str, build: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut req = build(&self.http);
        if let Some(auth) = self.cached_auth(scope) {
            req = req.header(AUTHORIZATION, auth);
        }
        let resp = req.send().await.map_err(|e| self.transport_err(e))?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(AuthChallenge::parse);
        let Some(challenge) = challenge else {
            return Ok(resp);
        };

        let auth = self.authorize(&challenge, scope).await?;
        self.auth_cache.lock().insert(scope.to_string(), auth.clone());
        tracing::debug!(registry = %self.registry, scope, "Authenticated");

        build(&self.http)
            .header(AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| self.transport_err(e))
    }

    async fn ping_within(&self, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            Some(t) => tokio::time::timeout(t, self.ping())
                .await
                .map_err(|_| RegistryError::Timeout(format!("{} did not answer within {:?}", self.registry, t)))?,
            None => self.ping().await,
        }
    }

    /// Reachability check: `GET /v2/` answered with 200 or 401.
    pub async fn ping(&self) -> Result<()> {
        let url = self.url("/v2/")?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        match resp.status() {
            s if s.is_success() || s == StatusCode::UNAUTHORIZED => Ok(()),
            _ => Err(self.status_err(resp).await),
        }
    }

    /// Authenticated check: `GET /v2/` must succeed with the credential.
    pub async fn login(&self) -> Result<()> {
        let url = self.url("/v2/")?;
        let resp = self.send("", |http| http.get(url.clone())).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(self.status_err(resp).await)
        }
    }

    /// Follow `Link: <...>; rel="next"` pagination.
    async fn paginate<T, F>(&self, scope: &str, first: Url, mut extract: F) -> Result<Vec<String>>
    where
        T: serde::de::DeserializeOwned,
        F: FnMut(T) -> Vec<String>,
    {
        let mut out = Vec::new();
        let mut next = Some(first);
        while let Some(url) = next.take() {
            let resp = self.send(scope, |http| http.get(url.clone())).await?;
            if !resp.status().is_success() {
                return Err(self.status_err(resp).await);
            }
            next = resp
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_link)
                .and_then(|link| self.base.join(&link).ok());
            let page: T = resp.json().await.map_err(|e| RegistryError::Serialization(e.to_string()))?;
            out.extend(extract(page));
        }
        Ok(out)
    }

    fn location(&self, resp: &Response) -> Result<Url> {
        let loc = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::Remote {
                registry: self.registry.clone(),
                status: resp.status().as_u16(),
                message: "missing Location header".to_string(),
            })?;
        self.url(loc)
    }
}

/// Extract the target of a `rel="next"` link.
fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") && !params.contains("rel=next") {
            return None;
        }
        Some(target.trim().trim_start_matches('<').trim_end_matches('>').to_string())
    })
}

fn header_str(resp: &Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[async_trait]
impl RegistryEndpoint for RemoteClient {
    fn describe(&self) -> String {
        self.base.to_string()
    }

    async fn manifest(&self, repo: &str, reference: &str) -> Result<Option<ManifestPayload>> {
        let url = self.url(&format!("/v2/{}/manifests/{}", repo, reference))?;
        let accept = MANIFEST_ACCEPT.join(", ");
        let resp = self
            .send(&pull_scope(repo), |http| {
                http.get(url.clone()).header(ACCEPT, accept.as_str())
            })
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(self.status_err(resp).await);
        }

        let header_type = header_str(&resp, CONTENT_TYPE.as_str())
            .map(|ct| ct.split(';').next().unwrap_or_default().trim().to_string())
            .unwrap_or_default();
        let bytes = resp.bytes().await.map_err(|e| self.transport_err(e))?.to_vec();

        let mut media_type = detect_media_type(&bytes);
        if media_type.is_empty() && (is_image_manifest(&header_type) || is_manifest_list(&header_type)) {
            media_type = header_type;
        }
        Ok(Some(ManifestPayload::new(bytes, media_type)))
    }

    async fn manifest_digest(&self, repo: &str, reference: &str) -> Result<Option<String>> {
        let url = self.url(&format!("/v2/{}/manifests/{}", repo, reference))?;
        let accept = MANIFEST_ACCEPT.join(", ");
        let resp = self
            .send(&pull_scope(repo), |http| {
                http.head(url.clone()).header(ACCEPT, accept.as_str())
            })
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => match header_str(&resp, DOCKER_CONTENT_DIGEST) {
                Some(digest) => Ok(Some(digest)),
                None => Ok(self.manifest(repo, reference).await?.map(|m| m.digest)),
            },
            _ => Err(self.status_err(resp).await),
        }
    }

    async fn blob_exists(&self, repo: &str, digest: &str) -> Result<bool> {
        let url = self.url(&format!("/v2/{}/blobs/{}", repo, digest))?;
        let resp = self
            .send(&pull_scope(repo), |http| http.head(url.clone()))
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Err(self.status_err(resp).await),
        }
    }

    async fn open_blob(&self, repo: &str, digest: &str) -> Result<BlobStream> {
        let url = self.url(&format!("/v2/{}/blobs/{}", repo, digest))?;
        let resp = self
            .send(&pull_scope(repo), |http| http.get(url.clone()))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(format!(
                "blob {} in {}/{}",
                digest, self.registry, repo
            )));
        }
        if !resp.status().is_success() {
            return Err(self.status_err(resp).await);
        }
        let size = resp.content_length();
        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)))
            .boxed();
        Ok(BlobStream { size, stream })
    }

    async fn push_blob(&self, repo: &str, digest: &str, blob: BlobStream) -> Result<()> {
        if self.blob_exists(repo, digest).await? {
            return Ok(());
        }

        let scope = push_scope(repo);
        let start = self.url(&format!("/v2/{}/blobs/uploads/", repo))?;
        let resp = self
            .send(&scope, |http| http.request(Method::POST, start.clone()).header(CONTENT_LENGTH, 0))
            .await?;
        if resp.status() != StatusCode::ACCEPTED {
            return Err(self.status_err(resp).await);
        }
        let mut upload = self.location(&resp)?;
        upload.query_pairs_mut().append_pair("digest", digest);

        // reqwest bodies must be Sync; forward the source through a channel
        let (mut tx, rx) = futures::channel::mpsc::channel::<std::io::Result<Bytes>>(4);
        let mut source = blob.stream;
        tokio::spawn(async move {
            while let Some(chunk) = source.next().await {
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        // the body cannot be replayed, so the scope must already be authorized
        let mut req = self
            .http
            .put(upload)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(rx));
        if let Some(size) = blob.size {
            req = req.header(CONTENT_LENGTH, size);
        }
        if let Some(auth) = self.cached_auth(&scope) {
            req = req.header(AUTHORIZATION, auth);
        }
        let resp = req.send().await.map_err(|e| self.transport_err(e))?;
        if resp.status() != StatusCode::CREATED {
            return Err(self.status_err(resp).await);
        }
        tracing::debug!(registry = %self.registry, repository = repo, digest, "Pushed blob");
        Ok(())
    }

    async fn push_manifest(
        &self,
        repo: &str,
        reference: &str,
        manifest: &ManifestPayload,
    ) -> Result<String> {
        let url = self.url(&format!("/v2/{}/manifests/{}", repo, reference))?;
        let content_type = if manifest.media_type.is_empty() {
            infer_content_type(&manifest.bytes)
        } else {
            manifest.media_type.clone()
        };
        let resp = self
            .send(&push_scope(repo), |http| {
                http.put(url.clone())
                    .header(CONTENT_TYPE, content_type.as_str())
                    .body(manifest.bytes.clone())
            })
            .await?;
        if !resp.status().is_success() {
            return Err(self.status_err(resp).await);
        }
        Ok(header_str(&resp, DOCKER_CONTENT_DIGEST).unwrap_or_else(|| manifest.digest.clone()))
    }

    async fn catalog(&self) -> Result<Vec<String>> {
        let first = self.url(&format!("/v2/_catalog?n={}", CATALOG_PAGE_SIZE))?;
        self.paginate(CATALOG_SCOPE, first, |page: CatalogResponse| page.repositories)
            .await
    }

    async fn tags(&self, repo: &str) -> Result<Vec<String>> {
        let first = self.url(&format!("/v2/{}/tags/list", repo))?;
        self.paginate(&pull_scope(repo), first, |page: TagsResponse| {
            page.tags.unwrap_or_default()
        })
        .await
    }

    async fn delete_manifest(&self, repo: &str, digest: &str) -> Result<()> {
        let url = self.url(&format!("/v2/{}/manifests/{}", repo, digest))?;
        let resp = self
            .send(&delete_scope(repo), |http| http.delete(url.clone()))
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(format!(
                "manifest {}@{}",
                repo, digest
            ))),
            s if s.is_success() => Ok(()),
            _ => Err(self.status_err(resp).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let c = AuthChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull,push""#,
        )
        .unwrap();
        assert_eq!(
            c,
            AuthChallenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: Some("repository:library/nginx:pull,push".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_bearer_without_scope() {
        let c = AuthChallenge::parse(r#"Bearer realm="https://ghcr.io/token",service="ghcr.io""#).unwrap();
        assert!(matches!(c, AuthChallenge::Bearer { scope: None, .. }));
    }

    #[test]
    fn test_parse_basic_and_unknown() {
        assert_eq!(
            AuthChallenge::parse(r#"Basic realm="Registry Realm""#),
            Some(AuthChallenge::Basic)
        );
        assert_eq!(AuthChallenge::parse("Negotiate abc"), None);
        assert_eq!(AuthChallenge::parse(r#"Bearer service="x""#), None);
    }

    #[test]
    fn test_next_link() {
        assert_eq!(
            next_link(r#"</v2/_catalog?last=b&n=2>; rel="next""#),
            Some("/v2/_catalog?last=b&n=2".to_string())
        );
        assert_eq!(next_link(r#"</x>; rel="prev""#), None);
    }

    #[test]
    fn test_parse_registry_url() {
        assert_eq!(
            parse_registry_url("quay.io").unwrap().as_str(),
            "https://quay.io/"
        );
        assert_eq!(
            parse_registry_url("http://127.0.0.1:5000").unwrap().port(),
            Some(5000)
        );
    }

    #[test]
    fn test_registry_host_with_port() {
        let client = RemoteClient::new(
            Url::parse("http://127.0.0.1:5000").unwrap(),
            Some(String::new()),
            Some("ignored".to_string()),
        )
        .unwrap();
        assert_eq!(client.registry(), "127.0.0.1:5000");
        assert_eq!(client.scheme(), "http");
        assert!(client.basic_header().is_none());
    }

    #[tokio::test]
    async fn test_connect_unreachable_fails_both_schemes() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = RemoteClient::connect(
            &addr.to_string(),
            None,
            None,
            Some(Duration::from_secs(2)),
        )
        .await;
        match result {
            Err(RegistryError::ProbeFailure { message, .. }) => {
                assert!(message.contains("https"));
                assert!(message.contains("http"));
            }
            other => panic!("expected probe failure, got {:?}", other),
        }
    }
}
