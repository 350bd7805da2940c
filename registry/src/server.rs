//! Embedded Distribution API server.
//!
//! Serves a [`LocalRegistry`] over HTTP, optionally as a pull-through
//! cache in front of a remote registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures::StreamExt;
use sealreg_core::config::ServerConfig;
use sealreg_core::error::{RegistryError, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

use crate::endpoint::{ManifestPayload, RegistryEndpoint};
use crate::manifest::infer_content_type;
use crate::proxy::ProxyRegistry;
use crate::storage::paths::looks_like_digest;
use crate::storage::LocalRegistry;

const API_VERSION_HEADER: &str = "docker-distribution-api-version";
const DIGEST_HEADER: &str = "docker-content-digest";
const UPLOAD_UUID_HEADER: &str = "docker-upload-uuid";

/// Largest manifest accepted on push.
pub const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

/// Distribution error envelope.
#[derive(Debug, Serialize)]
struct ErrorBody {
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Serialize)]
struct ErrorEntry {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// Map a registry error, reporting missing content as `unknown_code`.
    fn from_registry(err: RegistryError, unknown_code: &'static str) -> Self {
        let message = err.to_string();
        match err {
            RegistryError::NotFound(_) | RegistryError::PathNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, unknown_code, message)
            }
            RegistryError::InvalidPath(_) => Self::new(StatusCode::BAD_REQUEST, "NAME_INVALID", message),
            RegistryError::InvalidReference(_) | RegistryError::BlobTransfer { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "DIGEST_INVALID", message)
            }
            RegistryError::UnrecognizedManifestType(_) | RegistryError::Serialization(_) => {
                Self::new(StatusCode::BAD_REQUEST, "MANIFEST_INVALID", message)
            }
            RegistryError::Remote { .. }
            | RegistryError::ProbeFailure { .. }
            | RegistryError::Timeout(_) => Self::new(StatusCode::BAD_GATEWAY, "UNKNOWN", message),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN", message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = self.code, error = %self.message, "Request failed");
        }
        let body = ErrorBody {
            errors: vec![ErrorEntry {
                code: self.code,
                message: self.message,
            }],
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

/// Routed request below `/v2/`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
    UploadStart { name: String },
    Upload { name: String, uuid: String },
    Tags { name: String },
}

fn parse_route(path: &str) -> Option<Route> {
    let path = path.trim_start_matches('/');
    let nonempty = |s: &str| (!s.is_empty()).then(|| s.to_string());

    if let Some(name) = path.strip_suffix("/tags/list") {
        return Some(Route::Tags { name: nonempty(name)? });
    }
    if let Some(name) = path.trim_end_matches('/').strip_suffix("/blobs/uploads") {
        return Some(Route::UploadStart { name: nonempty(name)? });
    }
    if let Some((name, uuid)) = path.rsplit_once("/blobs/uploads/") {
        return Some(Route::Upload {
            name: nonempty(name)?,
            uuid: nonempty(uuid)?,
        });
    }
    if let Some((name, reference)) = path.rsplit_once("/manifests/") {
        return Some(Route::Manifest {
            name: nonempty(name)?,
            reference: nonempty(reference)?,
        });
    }
    if let Some((name, digest)) = path.rsplit_once("/blobs/") {
        return Some(Route::Blob {
            name: nonempty(name)?,
            digest: nonempty(digest)?,
        });
    }
    None
}

struct ServerState {
    registry: LocalRegistry,
    proxy: Option<ProxyRegistry>,
}

/// Builder for the registry HTTP service.
pub struct RegistryServer {
    state: Arc<ServerState>,
}

impl RegistryServer {
    /// Serve `registry` as-is.
    pub fn new(registry: LocalRegistry) -> Self {
        Self {
            state: Arc::new(ServerState {
                registry,
                proxy: None,
            }),
        }
    }

    /// Serve the proxy's local store, filling misses from its remote.
    pub fn pull_through(proxy: ProxyRegistry) -> Self {
        Self {
            state: Arc::new(ServerState {
                registry: proxy.local().clone(),
                proxy: Some(proxy),
            }),
        }
    }

    pub fn into_router(self) -> Router {
        Router::new()
            .route("/v2/", get(api_base))
            .route("/v2/_catalog", get(catalog))
            .route("/v2/{*path}", any(dispatch))
            .with_state(self.state)
    }

    /// Bind and serve `registry` in the background.
    pub async fn start(config: &ServerConfig, registry: LocalRegistry) -> Result<RunningServer> {
        serve_router(config, Self::new(registry).into_router()).await
    }
}

/// Bind `router` to the configured address, or an ephemeral local port.
pub async fn serve_router(config: &ServerConfig, router: Router) -> Result<RunningServer> {
    let listen = config
        .listen
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));
    let router = if config.access_log {
        let level = tracing::Level::from(config.log_level);
        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(level))
                .on_response(DefaultOnResponse::new().level(level)),
        )
    } else {
        router
    };

    let listener = tokio::net::TcpListener::bind(listen).await?;
    let addr = listener.local_addr()?;
    let token = CancellationToken::new();
    let shutdown = token.clone();

    let handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });
    tracing::info!(%addr, "Registry listening");

    Ok(RunningServer {
        addr,
        token,
        handle: Some(handle),
    })
}

/// Handle to a background server. Dropping it stops the server.
pub struct RunningServer {
    addr: SocketAddr,
    token: CancellationToken,
    handle: Option<JoinHandle<std::io::Result<()>>>,
}

impl RunningServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` usable as a registry domain.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) -> Result<()> {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| RegistryError::Other(format!("server task failed: {}", e)))??;
        }
        tracing::debug!(addr = %self.addr, "Registry stopped");
        Ok(())
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn api_base() -> Response {
    (
        StatusCode::OK,
        [(API_VERSION_HEADER, "registry/2.0")],
        Json(serde_json::json!({})),
    )
        .into_response()
}

/// Apply `n` / `last` pagination. Returns the page and the next marker.
fn paginate(mut items: Vec<String>, params: &HashMap<String, String>) -> (Vec<String>, Option<String>) {
    items.sort();
    if let Some(last) = params.get("last") {
        items.retain(|item| item > last);
    }
    match params.get("n").and_then(|n| n.parse::<usize>().ok()) {
        Some(n) if items.len() > n => {
            items.truncate(n);
            let next = items.last().cloned();
            (items, next)
        }
        _ => (items, None),
    }
}

fn next_link(base: &str, last: &str, params: &HashMap<String, String>) -> String {
    let n = params.get("n").map(String::as_str).unwrap_or_default();
    format!("<{}?last={}&n={}>; rel=\"next\"", base, last, n)
}

async fn catalog(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let repos = state
        .registry
        .repositories()
        .await
        .map_err(|e| ApiError::from_registry(e, "NAME_UNKNOWN"))?;
    let (page, next) = paginate(repos, &params);
    let body = Json(serde_json::json!({ "repositories": page }));
    Ok(match next {
        Some(last) => (
            [("link", next_link("/v2/_catalog", &last, &params))],
            body,
        )
            .into_response(),
        None => body.into_response(),
    })
}

async fn dispatch(
    State(state): State<Arc<ServerState>>,
    method: Method,
    Path(path): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Body,
) -> ApiResult {
    let route = parse_route(&path)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "UNSUPPORTED", format!("no route for /v2/{}", path)))?;
    tracing::debug!(%method, ?route, "Registry request");

    let head = method == Method::HEAD;
    match (route, method.as_str()) {
        (Route::Manifest { name, reference }, "GET" | "HEAD") => {
            get_manifest(&state, &name, &reference, head).await
        }
        (Route::Manifest { name, reference }, "PUT") => put_manifest(&state, &name, &reference, body).await,
        (Route::Manifest { name, reference }, "DELETE") => delete_manifest(&state, &name, &reference).await,
        (Route::Blob { name, digest }, "GET" | "HEAD") => get_blob(&state, &name, &digest, head).await,
        (Route::Tags { name }, "GET") => list_tags(&state, &name, &params).await,
        (Route::UploadStart { name }, "POST") => start_upload(&state, &name, &params, body).await,
        (Route::Upload { name, uuid }, "PATCH") => patch_upload(&state, &name, &uuid, body).await,
        (Route::Upload { name, uuid }, "PUT") => finish_upload(&state, &name, &uuid, &params, body).await,
        (Route::Upload { name, uuid }, "GET") => upload_status(&state, &name, &uuid).await,
        (Route::Upload { name, uuid }, "DELETE") => {
            state
                .registry
                .cancel_upload(&name, &uuid)
                .await
                .map_err(|e| ApiError::from_registry(e, "BLOB_UPLOAD_UNKNOWN"))?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        (_, other) => Err(ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "UNSUPPORTED",
            format!("{} not supported on /v2/{}", other, path),
        )),
    }
}

async fn get_manifest(state: &ServerState, name: &str, reference: &str, head: bool) -> ApiResult {
    let payload: ManifestPayload = match &state.proxy {
        Some(proxy) => proxy
            .repository(name)
            .manifest(reference)
            .await
            .map_err(|e| ApiError::from_registry(e, "MANIFEST_UNKNOWN"))?,
        None => state
            .registry
            .get_manifest(name, reference)
            .await
            .map_err(|e| ApiError::from_registry(e, "MANIFEST_UNKNOWN"))?
            .ok_or_else(|| {
                ApiError::new(
                    StatusCode::NOT_FOUND,
                    "MANIFEST_UNKNOWN",
                    format!("manifest unknown: {}:{}", name, reference),
                )
            })?,
    };

    let content_type = if payload.media_type.is_empty() {
        infer_content_type(&payload.bytes)
    } else {
        payload.media_type.clone()
    };
    let headers = [
        ("content-type", content_type),
        (DIGEST_HEADER, payload.digest.clone()),
        ("content-length", payload.bytes.len().to_string()),
    ];
    let body = if head { Body::empty() } else { Body::from(payload.bytes) };
    Ok((StatusCode::OK, headers, body).into_response())
}

async fn put_manifest(state: &ServerState, name: &str, reference: &str, body: Body) -> ApiResult {
    let bytes = axum::body::to_bytes(body, MAX_MANIFEST_SIZE)
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "MANIFEST_INVALID", e.to_string()))?;
    let digest = state
        .registry
        .put_manifest(name, reference, &bytes)
        .await
        .map_err(|e| ApiError::from_registry(e, "NAME_UNKNOWN"))?;

    Ok((
        StatusCode::CREATED,
        [
            ("location", format!("/v2/{}/manifests/{}", name, digest)),
            (DIGEST_HEADER, digest),
        ],
    )
        .into_response())
}

async fn delete_manifest(state: &ServerState, name: &str, reference: &str) -> ApiResult {
    if !looks_like_digest(reference) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "UNSUPPORTED",
            "manifests can only be deleted by digest",
        ));
    }
    state
        .registry
        .remove_manifest(name, reference)
        .await
        .map_err(|e| ApiError::from_registry(e, "MANIFEST_UNKNOWN"))?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn get_blob(state: &ServerState, name: &str, digest: &str, head: bool) -> ApiResult {
    let blob = match &state.proxy {
        Some(proxy) => proxy
            .repository(name)
            .open_blob(digest)
            .await
            .map_err(|e| ApiError::from_registry(e, "BLOB_UNKNOWN"))?,
        None => {
            let present = state
                .registry
                .has_blob(name, digest)
                .await
                .map_err(|e| ApiError::from_registry(e, "BLOB_UNKNOWN"))?;
            if !present {
                return Err(ApiError::new(
                    StatusCode::NOT_FOUND,
                    "BLOB_UNKNOWN",
                    format!("blob unknown to registry: {}", digest),
                ));
            }
            state
                .registry
                .open_blob(name, digest)
                .await
                .map_err(|e| ApiError::from_registry(e, "BLOB_UNKNOWN"))?
        }
    };

    let headers = [
        ("content-type", "application/octet-stream".to_string()),
        (DIGEST_HEADER, digest.to_string()),
        (
            "content-length",
            blob.size.unwrap_or_default().to_string(),
        ),
    ];
    let body = if head {
        Body::empty()
    } else {
        Body::from_stream(blob.stream)
    };
    Ok((StatusCode::OK, headers, body).into_response())
}

async fn list_tags(state: &ServerState, name: &str, params: &HashMap<String, String>) -> ApiResult {
    let tags = match &state.proxy {
        Some(proxy) => match proxy.remote().tags(name).await {
            Ok(tags) => tags,
            Err(e) => {
                tracing::warn!(repository = name, error = %e, "Listing cached tags");
                local_tags(state, name).await?
            }
        },
        None => local_tags(state, name).await?,
    };
    if tags.is_empty() && !repository_exists(state, name).await? {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "NAME_UNKNOWN",
            format!("repository name not known to registry: {}", name),
        ));
    }

    let (page, next) = paginate(tags, params);
    let body = Json(serde_json::json!({ "name": name, "tags": page }));
    Ok(match next {
        Some(last) => (
            [(
                "link",
                next_link(&format!("/v2/{}/tags/list", name), &last, params),
            )],
            body,
        )
            .into_response(),
        None => body.into_response(),
    })
}

async fn local_tags(state: &ServerState, name: &str) -> std::result::Result<Vec<String>, ApiError> {
    state
        .registry
        .list_tags(name)
        .await
        .map_err(|e| ApiError::from_registry(e, "NAME_UNKNOWN"))
}

async fn repository_exists(state: &ServerState, name: &str) -> std::result::Result<bool, ApiError> {
    let repos = state
        .registry
        .repositories()
        .await
        .map_err(|e| ApiError::from_registry(e, "NAME_UNKNOWN"))?;
    Ok(repos.iter().any(|r| r == name))
}

fn body_stream(body: Body) -> crate::endpoint::ByteStream {
    body.into_data_stream()
        .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)))
        .boxed()
}

fn upload_accepted(name: &str, uuid: &str, size: u64) -> Response {
    let range = format!("0-{}", size.saturating_sub(1));
    (
        StatusCode::ACCEPTED,
        [
            ("location", format!("/v2/{}/blobs/uploads/{}", name, uuid)),
            ("range", range),
            (UPLOAD_UUID_HEADER, uuid.to_string()),
        ],
    )
        .into_response()
}

fn blob_created(name: &str, digest: &str) -> Response {
    (
        StatusCode::CREATED,
        [
            ("location", format!("/v2/{}/blobs/{}", name, digest)),
            (DIGEST_HEADER, digest.to_string()),
        ],
    )
        .into_response()
}

async fn start_upload(
    state: &ServerState,
    name: &str,
    params: &HashMap<String, String>,
    body: Body,
) -> ApiResult {
    let registry = &state.registry;
    let err = |e| ApiError::from_registry(e, "BLOB_UPLOAD_INVALID");

    if let Some(mount) = params.get("mount") {
        if registry.blob_size(mount).await.map_err(err)?.is_some() {
            registry.link_blob(name, mount).await.map_err(err)?;
            return Ok(blob_created(name, mount));
        }
    }

    let mut upload = registry.begin_upload(name).await.map_err(err)?;
    if let Some(digest) = params.get("digest") {
        upload.write_stream(body_stream(body)).await.map_err(err)?;
        upload.commit_verified(digest).await.map_err(err)?;
        return Ok(blob_created(name, digest));
    }

    let uuid = upload.uuid().to_string();
    let size = upload.suspend().await.map_err(err)?;
    Ok(upload_accepted(name, &uuid, size))
}

async fn patch_upload(state: &ServerState, name: &str, uuid: &str, body: Body) -> ApiResult {
    let err = |e| ApiError::from_registry(e, "BLOB_UPLOAD_UNKNOWN");
    let mut upload = state.registry.resume_upload(name, uuid).await.map_err(err)?;
    upload.write_stream(body_stream(body)).await.map_err(err)?;
    let size = upload.suspend().await.map_err(err)?;
    Ok(upload_accepted(name, uuid, size))
}

async fn finish_upload(
    state: &ServerState,
    name: &str,
    uuid: &str,
    params: &HashMap<String, String>,
    body: Body,
) -> ApiResult {
    let digest = params.get("digest").ok_or_else(|| {
        ApiError::new(StatusCode::BAD_REQUEST, "DIGEST_INVALID", "digest parameter is required")
    })?;
    let err = |e| ApiError::from_registry(e, "BLOB_UPLOAD_UNKNOWN");
    let mut upload = state.registry.resume_upload(name, uuid).await.map_err(err)?;
    upload.write_stream(body_stream(body)).await.map_err(err)?;
    upload.commit_verified(digest).await.map_err(err)?;
    Ok(blob_created(name, digest))
}

async fn upload_status(state: &ServerState, name: &str, uuid: &str) -> ApiResult {
    let size = state
        .registry
        .upload_size(name, uuid)
        .await
        .map_err(|e| ApiError::from_registry(e, "BLOB_UPLOAD_UNKNOWN"))?;
    let mut response = upload_accepted(name, uuid, size);
    *response.status_mut() = StatusCode::NO_CONTENT;
    Ok(response)
}
