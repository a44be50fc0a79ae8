//! Host artifact service
//!
//! A long-running HTTP server that distributes models and MNIST shards,
//! collects uploaded telemetry reports and exposes a health endpoint.
//!
//! ## Endpoints
//!
//! - `GET /healthz` — liveness, body `ok`
//! - `GET /whoami` — bind address, public dir, LAN URLs, start timestamp
//! - `POST /upload` — multipart report intake (`file` required, `name` optional)
//! - everything else — static serving of the public tree with directory
//!   listings and `index.html` default, covering `/models/*`, `/mnist/*`,
//!   `/reports/*` and `/compiled/*`
//!
//! The server is an owned value: constructing a [`HostService`] and calling
//! [`HostService::serve`] is the whole lifecycle, no global state involved.

use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Multipart, State},
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
    CompressionLevel,
};

use crate::error::{DerivaError, Result};
use crate::telemetry::unix_now;

/// Request deadline covering slow readers and writers
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for all handlers
#[derive(Clone)]
pub struct HostState {
    /// Bind address, e.g. `0.0.0.0:8080`
    pub addr: String,
    /// Port the server listens on
    pub port: u16,
    /// Directory served at `/`
    pub public_dir: PathBuf,
    /// When the service value was created
    pub started_at: DateTime<Utc>,
}

/// The artifact service: owns its configuration, serves until the process
/// ends.
pub struct HostService {
    state: HostState,
}

impl HostService {
    /// Create a service for `public_dir` on `port`.
    #[must_use]
    pub fn new(port: u16, public_dir: PathBuf) -> Self {
        Self {
            state: HostState {
                addr: format!("0.0.0.0:{port}"),
                port,
                public_dir,
                started_at: Utc::now(),
            },
        }
    }

    /// The service's router, also used directly by tests.
    #[must_use]
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Bind and serve until the process is interrupted.
    ///
    /// # Errors
    ///
    /// Returns `DerivaError::Config` when the public directory is missing
    /// and an I/O error when the bind fails.
    pub async fn serve(self) -> Result<()> {
        if !self.state.public_dir.is_dir() {
            return Err(DerivaError::Config(format!(
                "public dir {} not found",
                self.state.public_dir.display()
            )));
        }

        let addr: SocketAddr = ([0, 0, 0, 0], self.state.port).into();
        let listener = tokio::net::TcpListener::bind(addr).await?;

        println!("🌐 Web server started");
        for url in lan_urls(self.state.port) {
            println!("   → {url}");
        }
        println!("   Serving: {}", self.state.public_dir.display());

        let app = self.router();
        axum::serve(listener, app)
            .await
            .map_err(|e| DerivaError::Config(format!("server error: {e}")))?;
        Ok(())
    }
}

/// Build the router for a given state.
#[must_use]
pub fn router(state: HostState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/whoami", get(whoami_handler))
        .route("/upload", post(upload_handler))
        .fallback(static_handler)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new().quality(CompressionLevel::Fastest))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

/// Reachable base URLs for this host: the primary-route address plus
/// loopback.
#[must_use]
pub fn lan_urls(port: u16) -> Vec<String> {
    let mut urls = Vec::new();
    if let Some(ip) = primary_lan_ip() {
        urls.push(format!("http://{ip}:{port}"));
    }
    urls.push(format!("http://127.0.0.1:{port}"));
    urls
}

// The UDP-connect trick: no packet is sent, the kernel just picks the
// outbound interface for the destination.
fn primary_lan_ip() -> Option<std::net::IpAddr> {
    let sock = UdpSocket::bind("0.0.0.0:0").ok()?;
    sock.connect("8.8.8.8:80").ok()?;
    let ip = sock.local_addr().ok()?.ip();
    if ip.is_loopback() || ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

/// Identity response for `/whoami`
#[derive(Debug, Serialize, Deserialize)]
pub struct WhoamiResponse {
    /// Bind address
    pub addr: String,
    /// Served public directory
    pub public_dir: String,
    /// Reachable base URLs
    pub lan_urls: Vec<String>,
    /// Service start timestamp, UTC
    pub started_at: DateTime<Utc>,
}

async fn whoami_handler(State(state): State<HostState>) -> Json<WhoamiResponse> {
    Json(WhoamiResponse {
        addr: state.addr.clone(),
        public_dir: state.public_dir.display().to_string(),
        lan_urls: lan_urls(state.port),
        started_at: state.started_at,
    })
}

/// Success response for `/upload`
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Always true on success
    pub saved: bool,
    /// Filesystem path the report was saved to
    pub path: String,
    /// URL path the report is now served under
    pub public: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
}

fn json_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: msg.into(),
        }),
    )
        .into_response()
}

async fn upload_handler(State(state): State<HostState>, mut multipart: Multipart) -> Response {
    let reports_dir = state.public_dir.join("reports");
    // the directory may be wiped underneath a running server
    if let Err(e) = tokio::fs::create_dir_all(&reports_dir).await {
        return json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to create reports dir: {e}"),
        );
    }

    let mut file_bytes: Option<axum::body::Bytes> = None;
    let mut client_filename = String::new();
    let mut name = String::new();

    while let Ok(Some(field)) = multipart.next_field().await {
        match field.name() {
            Some("file") => {
                client_filename = field.file_name().unwrap_or_default().to_string();
                match field.bytes().await {
                    Ok(bytes) => file_bytes = Some(bytes),
                    Err(e) => {
                        return json_error(
                            StatusCode::BAD_REQUEST,
                            format!("reading file field: {e}"),
                        )
                    }
                }
            }
            Some("name") => {
                name = field.text().await.unwrap_or_default();
            }
            _ => {}
        }
    }

    let Some(bytes) = file_bytes else {
        return json_error(StatusCode::BAD_REQUEST, "missing file field");
    };

    let effective = if name.is_empty() {
        format!("{}_{client_filename}", unix_now())
    } else {
        name
    };
    let effective = sanitize_filename(&effective);
    if effective.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "unusable target filename");
    }

    let dst = reports_dir.join(&effective);
    match tokio::fs::write(&dst, &bytes).await {
        Ok(()) => {
            tracing::info!(path = %dst.display(), bytes = bytes.len(), "report stored");
            Json(UploadResponse {
                saved: true,
                path: dst.display().to_string(),
                public: format!("/reports/{effective}"),
            })
            .into_response()
        }
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// Uploaded names must stay inside the reports directory.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '/' | '\\'))
        .collect::<String>()
        .replace("..", "_")
}

async fn static_handler(State(state): State<HostState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response();
    }

    let rel = uri.path().trim_matches('/');
    let Some(components) = sanitize_path(rel) else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };

    let mut path = state.public_dir.clone();
    for c in &components {
        path.push(c);
    }

    if path.is_dir() {
        let index = path.join("index.html");
        if index.is_file() {
            return serve_file(&index).await;
        }
        return serve_listing(&path, rel).await;
    }
    if path.is_file() {
        return serve_file(&path).await;
    }
    (StatusCode::NOT_FOUND, "not found").into_response()
}

// Reject traversal and absolute components outright.
fn sanitize_path(rel: &str) -> Option<Vec<String>> {
    let mut out = Vec::new();
    for part in rel.split('/') {
        if part.is_empty() {
            continue;
        }
        if part == ".." || part == "." || part.contains('\\') {
            return None;
        }
        out.push(part.to_string());
    }
    Some(out)
}

async fn serve_file(path: &Path) -> Response {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let ct = content_type(path);
            (
                [
                    (header::CONTENT_TYPE, ct),
                    (header::CACHE_CONTROL, "max-age=3600"),
                ],
                Body::from(bytes),
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "static read failed");
            (StatusCode::NOT_FOUND, "not found").into_response()
        }
    }
}

// Plain HTML directory listing, directories first.
async fn serve_listing(path: &Path, rel: &str) -> Response {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().into_owned();
                let is_dir = entry
                    .file_type()
                    .await
                    .map(|t| t.is_dir())
                    .unwrap_or(false);
                if is_dir {
                    dirs.push(name);
                } else {
                    files.push(name);
                }
            }
        }
        Err(e) => {
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    }
    dirs.sort();
    files.sort();

    let title = if rel.is_empty() { "/" } else { rel };
    let prefix = if rel.is_empty() {
        String::new()
    } else {
        format!("/{rel}")
    };
    let mut html = format!("<!doctype html><html><head><title>Index of {title}</title></head><body><h1>Index of {title}</h1><ul>");
    for d in &dirs {
        html.push_str(&format!("<li><a href=\"{prefix}/{d}/\">{d}/</a></li>"));
    }
    for f in &files {
        html.push_str(&format!("<li><a href=\"{prefix}/{f}\">{f}</a></li>"));
    }
    html.push_str("</ul></body></html>");

    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response()
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("wasm") => "application/wasm",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path_rejects_traversal() {
        assert!(sanitize_path("../etc/passwd").is_none());
        assert!(sanitize_path("models/../../x").is_none());
        assert!(sanitize_path("a\\b").is_none());
        assert_eq!(
            sanitize_path("models/manifest.json").unwrap(),
            vec!["models".to_string(), "manifest.json".to_string()]
        );
        assert_eq!(sanitize_path("").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("t.json"), "t.json");
        assert_eq!(sanitize_filename("a/b.json"), "ab.json");
        assert_eq!(sanitize_filename("../../x"), "__x");
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type(Path::new("m.json")), "application/json");
        assert_eq!(
            content_type(Path::new("train-images-idx3-ubyte")),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_lan_urls_always_include_loopback() {
        let urls = lan_urls(8080);
        assert!(urls.iter().any(|u| u == "http://127.0.0.1:8080"));
    }
}
