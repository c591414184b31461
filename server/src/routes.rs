use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use camstream_common::assembler::FrameAssembler;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::stream::{multipart_stream, CONTENT_TYPE};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub assembler: Arc<FrameAssembler>,
    pub static_dir: PathBuf,
    /// Connected `/stream.mjpg` clients.
    pub clients: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(assembler: Arc<FrameAssembler>, static_dir: PathBuf) -> Self {
        Self {
            assembler,
            static_dir,
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_redirect).fallback(unsupported_method))
        .route("/index.html", get(index).fallback(unsupported_method))
        .route("/bootstrap.min.css", get(stylesheet).fallback(unsupported_method))
        .route(
            "/bootstrap.min.css.map",
            get(stylesheet_map).fallback(unsupported_method),
        )
        .route("/stream.mjpg", get(stream_mjpg).fallback(unsupported_method))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the listener fails. Each connection runs on its own task.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> io::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET / — 301 to the viewer page
async fn root_redirect() -> impl IntoResponse {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, "/index.html")],
    )
}

/// GET /index.html
async fn index(State(state): State<Arc<AppState>>) -> Response {
    serve_static(&state.static_dir, "index.html", "text/html").await
}

/// GET /bootstrap.min.css
async fn stylesheet(State(state): State<Arc<AppState>>) -> Response {
    serve_static(&state.static_dir, "bootstrap.min.css", "text/css").await
}

/// GET /bootstrap.min.css.map
async fn stylesheet_map(State(state): State<Arc<AppState>>) -> Response {
    serve_static(&state.static_dir, "bootstrap.min.css.map", "text/css").await
}

/// GET /stream.mjpg — endless multipart/x-mixed-replace JPEG stream
async fn stream_mjpg(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let subscriber = state.assembler.subscribe();
    let body = Body::from_stream(multipart_stream(
        subscriber,
        peer,
        Arc::clone(&state.clients),
    ));

    (
        StatusCode::OK,
        [
            (header::AGE, "0"),
            (header::CACHE_CONTROL, "no-cache, private"),
            (header::PRAGMA, "no-cache"),
            (header::CONTENT_TYPE, CONTENT_TYPE),
        ],
        body,
    )
}

/// Only GET is served, on any path.
async fn unsupported_method() -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}

async fn not_found(method: Method) -> StatusCode {
    if method == Method::GET || method == Method::HEAD {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::NOT_IMPLEMENTED
    }
}

/// Read a file from the static directory. Content-Length comes from the
/// fixed-size body.
async fn serve_static(dir: &Path, name: &str, content_type: &'static str) -> Response {
    let path = dir.join(name);
    match tokio::fs::read(&path).await {
        Ok(content) => ([(header::CONTENT_TYPE, content_type)], content).into_response(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read static file");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
