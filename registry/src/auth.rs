//! Registry credential resolution.
//!
//! Reads Docker-format credential files, probes every stored domain and
//! keeps only the credentials that a registry actually accepts.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use futures::StreamExt;
use reqwest::Url;
use sealreg_core::error::{RegistryError, Result};
use serde::Deserialize;

use crate::reference::{normalize_domain, DEFAULT_DOMAIN};
use crate::remote::RemoteClient;

/// Default number of domains probed at once.
pub const DEFAULT_PROBE_CONCURRENCY: usize = 5;

/// Default per-probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// URL scheme a registry answered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Https,
    Http,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Https => "https",
            Scheme::Http => "http",
        }
    }
}

/// Credential for one registry domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub domain: String,
    pub username: String,
    pub password: String,
    /// Raw base64 `user:password`, as stored
    pub auth: String,
    pub identity_token: String,
    pub server_address: String,
    /// Scheme that passed the probe, once resolved
    pub scheme: Option<Scheme>,
}

impl Credential {
    pub fn anonymous(domain: &str) -> Self {
        Self {
            domain: normalize_registry(domain),
            ..Default::default()
        }
    }

    pub fn basic(domain: &str, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            domain: normalize_registry(domain),
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty()
            && self.password.is_empty()
            && self.auth.is_empty()
            && self.identity_token.is_empty()
    }

    /// Username and password, decoding `auth` when both are empty.
    pub fn user_password(&self) -> Result<(String, String)> {
        if self.username.is_empty() && self.password.is_empty() && !self.auth.is_empty() {
            return decode_auth(&self.auth);
        }
        Ok((self.username.clone(), self.password.clone()))
    }

    /// Basic credentials for a client, `None` for anonymous access.
    pub fn client_credentials(&self) -> Result<(Option<String>, Option<String>)> {
        let (username, password) = self.user_password()?;
        if username.is_empty() {
            Ok((None, None))
        } else {
            Ok((Some(username), Some(password)))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuthFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default, alias = "identityToken")]
    identitytoken: String,
    #[serde(default, alias = "serverAddress")]
    serveraddress: String,
}

/// Decode a base64 `user:password` pair.
pub fn decode_auth(auth: &str) -> Result<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth.trim())
        .map_err(|e| RegistryError::AuthResolution(format!("invalid auth field: {}", e)))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| RegistryError::AuthResolution(format!("invalid auth field: {}", e)))?;
    let (user, pass) = decoded.split_once(':').ok_or_else(|| {
        RegistryError::AuthResolution("auth field is not user:password".to_string())
    })?;
    Ok((user.to_string(), pass.to_string()))
}

/// Reduce a credential-store key to a bare registry host.
///
/// `https://index.docker.io/v1/` and `registry-1.docker.io` both become
/// `docker.io`.
pub fn normalize_registry(server: &str) -> String {
    let s = server.trim().to_lowercase();
    let s = s.split_once("://").map(|(_, rest)| rest).unwrap_or(&s);
    let host = s.split('/').next().unwrap_or_default();
    normalize_domain(host)
}

/// Credential files in increasing order of precedence.
pub fn default_auth_files() -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Some(home) = dirs::home_dir() {
        files.push(home.join(".docker").join("config.json"));
    }
    if let Some(runtime) = std::env::var_os("XDG_RUNTIME_DIR") {
        files.push(PathBuf::from(runtime).join("containers").join("auth.json"));
    }
    if let Some(explicit) = std::env::var_os("REGISTRY_AUTH_FILE") {
        files.push(PathBuf::from(explicit));
    }
    files
}

/// Read-only view of stored registry credentials.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    entries: BTreeMap<String, Credential>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the default credential files. Missing files are skipped.
    pub fn load_default() -> Result<Self> {
        Self::from_paths(&default_auth_files())
    }

    /// Load one credential file, which must exist.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut store = Self::new();
        store.merge_file(path)?;
        Ok(store)
    }

    /// Load files in order; later files override earlier ones.
    pub fn from_paths(paths: &[PathBuf]) -> Result<Self> {
        let mut store = Self::new();
        for path in paths {
            if path.exists() {
                store.merge_file(path)?;
            }
        }
        Ok(store)
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            RegistryError::AuthResolution(format!(
                "failed to read credential store {}: {}",
                path.display(),
                e
            ))
        })?;
        let file: AuthFile = serde_json::from_str(&data).map_err(|e| {
            RegistryError::AuthResolution(format!(
                "failed to parse credential store {}: {}",
                path.display(),
                e
            ))
        })?;

        for (server, entry) in file.auths {
            let domain = normalize_registry(&server);
            let (mut username, mut password) = (entry.username, entry.password);
            if username.is_empty() && password.is_empty() && !entry.auth.is_empty() {
                match decode_auth(&entry.auth) {
                    Ok(pair) => (username, password) = pair,
                    Err(e) => {
                        tracing::warn!(domain = %domain, error = %e, "Skipping malformed auth entry");
                        continue;
                    }
                }
            }
            let server_address = if entry.serveraddress.is_empty() {
                server.clone()
            } else {
                entry.serveraddress
            };
            self.insert(Credential {
                domain,
                username,
                password,
                auth: entry.auth,
                identity_token: entry.identitytoken,
                server_address,
                scheme: None,
            });
        }
        tracing::debug!(path = %path.display(), "Loaded credential store");
        Ok(())
    }

    pub fn insert(&mut self, credential: Credential) {
        self.entries.insert(credential.domain.clone(), credential);
    }

    pub fn get(&self, domain: &str) -> Option<&Credential> {
        self.entries.get(&normalize_registry(domain))
    }

    pub fn domains(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn credentials(&self) -> impl Iterator<Item = &Credential> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Validated domain to credential map.
#[derive(Debug, Clone, Default)]
pub struct CredentialMap {
    entries: HashMap<String, Credential>,
}

impl CredentialMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every stored credential as-is, without probing.
    pub fn unverified(store: &CredentialStore) -> Self {
        let mut map = Self::new();
        for credential in store.credentials() {
            map.insert(credential.clone());
        }
        map
    }

    pub fn insert(&mut self, credential: Credential) {
        self.entries.insert(credential.domain.clone(), credential);
    }

    /// Exact domain, then the domain without its port, then anonymous.
    pub fn lookup(&self, domain: &str) -> Credential {
        let domain = normalize_registry(domain);
        if let Some(c) = self.entries.get(&domain) {
            return c.clone();
        }
        if let Some((bare, _port)) = domain.rsplit_once(':') {
            if let Some(c) = self.entries.get(bare) {
                return Credential {
                    domain: domain.clone(),
                    ..c.clone()
                };
            }
        }
        Credential::anonymous(&domain)
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.entries.contains_key(&normalize_registry(domain))
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.entries.keys().cloned().collect();
        domains.sort();
        domains
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Probe target for a credential: the hub API host for Docker Hub.
fn probe_host(credential: &Credential) -> String {
    if credential.domain == DEFAULT_DOMAIN {
        "registry-1.docker.io".to_string()
    } else {
        credential.domain.clone()
    }
}

/// Probes stored credentials and keeps the ones that work.
#[derive(Debug, Clone)]
pub struct AuthResolver {
    concurrency: usize,
    timeout: Duration,
}

impl Default for AuthResolver {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_PROBE_CONCURRENCY,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl AuthResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Load the default credential files and resolve them.
    pub async fn resolve_default(&self) -> Result<CredentialMap> {
        let store = CredentialStore::load_default()?;
        Ok(self.resolve(&store).await)
    }

    /// Probe every stored domain, HTTPS first then HTTP.
    ///
    /// A domain that fails both probes is logged and left out.
    pub async fn resolve(&self, store: &CredentialStore) -> CredentialMap {
        let results: Vec<(Credential, Result<Scheme>)> = futures::stream::iter(store.credentials().cloned())
            .map(|credential| async move {
                let result = self.probe(&credential).await;
                (credential, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut map = CredentialMap::new();
        for (mut credential, result) in results {
            match result {
                Ok(scheme) => {
                    tracing::debug!(domain = %credential.domain, scheme = scheme.as_str(), "Credential verified");
                    credential.scheme = Some(scheme);
                    map.insert(credential);
                }
                Err(e) => {
                    tracing::warn!(domain = %credential.domain, error = %e, "Dropping credential that failed its probe");
                }
            }
        }
        map
    }

    /// Authenticated `/v2/` check against one domain.
    pub async fn probe(&self, credential: &Credential) -> Result<Scheme> {
        let host = probe_host(credential);
        let (username, password) = credential.client_credentials()?;
        let mut last_error = None;

        for scheme in [Scheme::Https, Scheme::Http] {
            let url = Url::parse(&format!("{}://{}", scheme.as_str(), host)).map_err(|e| {
                RegistryError::ProbeFailure {
                    domain: credential.domain.clone(),
                    message: e.to_string(),
                }
            })?;
            let client = RemoteClient::new(url, username.clone(), password.clone())?;
            match tokio::time::timeout(self.timeout, client.login()).await {
                Ok(Ok(())) => return Ok(scheme),
                Ok(Err(e)) => last_error = Some(e.to_string()),
                Err(_) => last_error = Some(format!("timed out after {:?}", self.timeout)),
            }
        }

        Err(RegistryError::ProbeFailure {
            domain: credential.domain.clone(),
            message: last_error.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::RegistryServer;
    use crate::storage::{InMemoryDriver, LocalRegistry};
    use sealreg_core::config::ServerConfig;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_normalize_registry() {
        assert_eq!(normalize_registry("https://index.docker.io/v1/"), "docker.io");
        assert_eq!(normalize_registry("registry-1.docker.io"), "docker.io");
        assert_eq!(normalize_registry("Quay.IO"), "quay.io");
        assert_eq!(normalize_registry("http://10.0.0.1:5000/v2/"), "10.0.0.1:5000");
    }

    #[test]
    fn test_decode_auth() {
        // "user:pa:ss"
        let (u, p) = decode_auth("dXNlcjpwYTpzcw==").unwrap();
        assert_eq!(u, "user");
        assert_eq!(p, "pa:ss");
        assert!(decode_auth("!!!").is_err());
    }

    #[test]
    fn test_load_docker_config() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "config.json",
            r#"{"auths": {
                "https://index.docker.io/v1/": {"auth": "aHViOnNlY3JldA=="},
                "quay.io": {"username": "q", "password": "p", "auth": "aWdub3JlZDp4"},
                "ghcr.io": {"identitytoken": "tok"}
            }}"#,
        );
        let store = CredentialStore::from_path(&path).unwrap();

        assert_eq!(store.domains(), vec!["docker.io", "ghcr.io", "quay.io"]);
        let hub = store.get("docker.io").unwrap();
        assert_eq!(hub.username, "hub");
        assert_eq!(hub.password, "secret");
        assert_eq!(hub.server_address, "https://index.docker.io/v1/");

        let quay = store.get("quay.io").unwrap();
        assert_eq!(quay.username, "q");
        assert_eq!(store.get("ghcr.io").unwrap().identity_token, "tok");
    }

    #[test]
    fn test_user_password_decodes_auth() {
        let credential = Credential {
            domain: "quay.io".into(),
            auth: "aHViOnNlY3JldA==".into(),
            ..Default::default()
        };
        assert!(!credential.is_anonymous());
        assert_eq!(
            credential.user_password().unwrap(),
            ("hub".to_string(), "secret".to_string())
        );
        assert_eq!(
            Credential::anonymous("quay.io").client_credentials().unwrap(),
            (None, None)
        );
    }

    #[test]
    fn test_malformed_entry_does_not_void_store() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "config.json",
            r#"{"auths": {
                "broken.example.com": {"auth": "!!!not-base64"},
                "nocolon.example.com": {"auth": "bm9jb2xvbg=="},
                "quay.io": {"auth": "aHViOnNlY3JldA=="}
            }}"#,
        );
        let store = CredentialStore::from_path(&path).unwrap();

        assert_eq!(store.domains(), vec!["quay.io"]);
        let quay = store.get("quay.io").unwrap();
        assert_eq!(quay.username, "hub");
        assert_eq!(quay.password, "secret");
    }

    #[test]
    fn test_later_files_override() {
        let dir = TempDir::new().unwrap();
        let first = write(&dir, "a.json", r#"{"auths": {"quay.io": {"username": "old", "password": "1"}}}"#);
        let second = write(&dir, "b.json", r#"{"auths": {"quay.io": {"username": "new", "password": "2"}}}"#);
        let missing = dir.path().join("missing.json");

        let store = CredentialStore::from_paths(&[first, missing, second]).unwrap();
        assert_eq!(store.get("quay.io").unwrap().username, "new");
    }

    #[test]
    fn test_unparsable_store_is_auth_error() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "config.json", "{not json");
        assert!(matches!(
            CredentialStore::from_path(&path),
            Err(RegistryError::AuthResolution(_))
        ));
        assert!(matches!(
            CredentialStore::from_path(&dir.path().join("absent.json")),
            Err(RegistryError::AuthResolution(_))
        ));
    }

    #[test]
    fn test_lookup_order() {
        let mut map = CredentialMap::new();
        map.insert(Credential::basic("registry.local", "bare", "pw"));
        map.insert(Credential::basic("registry.local:5000", "exact", "pw"));

        assert_eq!(map.lookup("registry.local:5000").username, "exact");
        assert_eq!(map.lookup("registry.local:6000").username, "bare");
        assert_eq!(map.lookup("registry.local:6000").domain, "registry.local:6000");

        let anon = map.lookup("quay.io");
        assert!(anon.is_anonymous());
        assert_eq!(anon.domain, "quay.io");
    }

    #[test]
    fn test_lookup_docker_hub_alias() {
        let mut map = CredentialMap::new();
        map.insert(Credential::basic("index.docker.io", "hub", "pw"));
        assert_eq!(map.lookup("docker.io").username, "hub");
        assert!(map.contains("registry-1.docker.io"));
    }

    #[tokio::test]
    async fn test_resolve_drops_unreachable_domains() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut store = CredentialStore::new();
        store.insert(Credential::basic(&addr.to_string(), "u", "p"));

        let map = AuthResolver::new()
            .with_timeout(Duration::from_secs(2))
            .resolve(&store)
            .await;
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_keeps_reachable_domain_over_http() {
        let local = LocalRegistry::new(Arc::new(InMemoryDriver::new()));
        let server = RegistryServer::start(&ServerConfig::default(), local).await.unwrap();
        let host = server.host();

        let mut store = CredentialStore::new();
        store.insert(Credential::basic(&host, "alice", "wonderland"));

        let map = AuthResolver::new()
            .with_timeout(Duration::from_secs(2))
            .resolve(&store)
            .await;

        assert_eq!(map.len(), 1);
        let credential = map.lookup(&host);
        // no TLS on the listener, so only the HTTP probe answers
        assert_eq!(credential.scheme, Some(Scheme::Http));
        assert_eq!(credential.username, "alice");
        assert_eq!(credential.password, "wonderland");
        assert!(!credential.is_anonymous());

        server.shutdown().await.unwrap();
    }
}
