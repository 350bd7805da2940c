//! Shared fixtures: a seeded upstream registry behind a request counter.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::Method;
use axum::middleware::{self, Next};
use sealreg_core::config::ServerConfig;
use sealreg_registry::manifest::{
    sha256_digest, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST,
};
use sealreg_registry::server::{serve_router, RegistryServer, RunningServer};
use sealreg_registry::storage::{InMemoryDriver, LocalRegistry};

/// Requests seen by the upstream.
#[derive(Debug, Default)]
pub struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    blob_gets: AtomicUsize,
}

impl Counters {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn blob_gets(&self) -> usize {
        self.blob_gets.load(Ordering::SeqCst)
    }
}

/// Digests of one seeded platform image.
#[derive(Debug, Clone)]
pub struct SeededImage {
    pub manifest: String,
    pub blobs: Vec<String>,
}

/// A multi-platform image stored upstream.
#[derive(Debug, Clone)]
pub struct SeededList {
    pub list: String,
    pub amd64: SeededImage,
    pub arm64: SeededImage,
}

pub struct Upstream {
    pub server: RunningServer,
    pub local: LocalRegistry,
    pub counters: Arc<Counters>,
}

impl Upstream {
    pub fn host(&self) -> String {
        self.server.host()
    }
}

pub fn memory_registry() -> LocalRegistry {
    LocalRegistry::new(Arc::new(InMemoryDriver::new()))
}

/// Serve `local` with every request counted and slowed down by `delay`.
pub async fn start_upstream(local: LocalRegistry, delay: Duration) -> Upstream {
    let counters = Arc::new(Counters::default());
    let tracked = counters.clone();
    let router = RegistryServer::new(local.clone())
        .into_router()
        .layer(middleware::from_fn(move |req: Request, next: Next| {
            let counters = tracked.clone();
            async move {
                let blob_get =
                    req.method() == Method::GET && req.uri().path().contains("/blobs/sha256:");
                let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                counters.peak.fetch_max(now, Ordering::SeqCst);
                if blob_get {
                    counters.blob_gets.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(delay).await;
                let response = next.run(req).await;
                counters.in_flight.fetch_sub(1, Ordering::SeqCst);
                response
            }
        }));

    let server = serve_router(&ServerConfig::default(), router).await.unwrap();
    Upstream {
        server,
        local,
        counters,
    }
}

/// Store an image manifest with a config blob and `layers` layer blobs.
pub async fn seed_image(local: &LocalRegistry, repo: &str, seed: &str, layers: usize) -> SeededImage {
    let config_bytes = format!(r#"{{"architecture":"{}","os":"linux","repo":"{}"}}"#, seed, repo);
    let config = local.put_blob(repo, config_bytes.as_bytes()).await.unwrap();
    let mut blobs = vec![config.clone()];
    let mut layer_descriptors = Vec::new();
    for i in 0..layers {
        let content = format!("{}-{}-layer-{}", repo, seed, i);
        let digest = local.put_blob(repo, content.as_bytes()).await.unwrap();
        layer_descriptors.push(serde_json::json!({
            "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
            "digest": digest,
            "size": content.len()
        }));
        blobs.push(digest);
    }

    let manifest = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_DOCKER_MANIFEST,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": config,
            "size": config_bytes.len()
        },
        "layers": layer_descriptors
    }))
    .unwrap();
    let digest = sha256_digest(&manifest);
    local.put_manifest(repo, &digest, &manifest).await.unwrap();

    SeededImage {
        manifest: digest,
        blobs,
    }
}

/// Store a linux/amd64 + linux/arm64 list tagged `tag`.
pub async fn seed_list(local: &LocalRegistry, repo: &str, tag: &str, layers: usize) -> SeededList {
    let amd64 = seed_image(local, repo, &format!("{}-amd64", tag), layers).await;
    let arm64 = seed_image(local, repo, &format!("{}-arm64", tag), layers).await;
    let list = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_DOCKER_MANIFEST_LIST,
        "manifests": [
            {
                "mediaType": MEDIA_TYPE_DOCKER_MANIFEST,
                "digest": amd64.manifest,
                "size": 500,
                "platform": {"architecture": "amd64", "os": "linux"}
            },
            {
                "mediaType": MEDIA_TYPE_DOCKER_MANIFEST,
                "digest": arm64.manifest,
                "size": 500,
                "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"}
            }
        ]
    }))
    .unwrap();
    let list = local.put_manifest(repo, tag, &list).await.unwrap();

    SeededList { list, amd64, arm64 }
}
