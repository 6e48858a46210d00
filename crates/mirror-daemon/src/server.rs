//! HTTP retrieval service.
//!
//! Serves the file index and streams decrypted blobs back to whoever holds
//! the key:
//! - `GET /` index page
//! - `GET /list` JSON listing with per-file keys
//! - `GET /file/{hash}?filename=&key=` decrypted download, or a key-entry
//!   page when no key is supplied

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use futures::StreamExt;
use mirror_core::{FileKey, FileSummary, Identity, MetadataStore};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::html;

/// Shared application state
pub struct AppState {
    pub store: Arc<MetadataStore>,
    pub destination: PathBuf,
}

impl AppState {
    pub fn new(store: Arc<MetadataStore>, destination: PathBuf) -> Arc<Self> {
        Arc::new(Self { store, destination })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/list", get(list))
        .route("/file/{hash}", get(get_file))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `cancel` fires, then allow in-flight requests `grace` to
/// finish before dropping them.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    cancel: CancellationToken,
    grace: Duration,
) -> Result<()> {
    let addr = listener.local_addr().context("read listener address")?;
    let shutdown = cancel.clone();
    let server = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    let mut task = tokio::spawn(async move { server.await });

    info!("HTTP server listening on {}", addr);

    tokio::select! {
        result = &mut task => {
            return result.context("HTTP server task failed")?.context("serve HTTP");
        }
        _ = cancel.cancelled() => {}
    }

    match tokio::time::timeout(grace, &mut task).await {
        Ok(result) => {
            result.context("HTTP server task failed")?.context("serve HTTP")?;
            info!("HTTP server stopped");
        }
        Err(_) => {
            warn!("Graceful shutdown exceeded {:?}, closing connections", grace);
            task.abort();
        }
    }

    Ok(())
}

async fn index() -> Html<String> {
    Html(html::index_page())
}

/// Body of `GET /list`
#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub files: Vec<FileSummary>,
}

async fn list(State(state): State<Arc<AppState>>) -> Json<ListResponse> {
    let mut files = Vec::with_capacity(state.store.len());
    state.store.for_each(|record| files.push(record.summary()));
    files.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.hash.cmp(&b.hash)));

    Json(ListResponse { files })
}

/// Query parameters of `GET /file/{hash}`
#[derive(Debug, Deserialize)]
pub struct FileQuery {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

async fn get_file(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    Query(params): Query<FileQuery>,
) -> Response {
    let encoded_key = match params.key.as_deref() {
        Some(k) if !k.is_empty() => k,
        _ => {
            let filename = params.filename.as_deref().filter(|f| !f.is_empty());
            return Html(html::key_page(&hash, filename)).into_response();
        }
    };

    // Validating the hash also keeps the blob path inside the destination
    let identity = match Identity::parse(&hash) {
        Ok(identity) => identity,
        Err(_) => {
            debug!("Rejected malformed hash {:?}", hash);
            return (StatusCode::NOT_FOUND, "File not found").into_response();
        }
    };

    let key = match FileKey::decode(encoded_key) {
        Ok(key) => key,
        Err(_) => {
            debug!("Rejected malformed key for {}", identity);
            return (StatusCode::FORBIDDEN, "Invalid key").into_response();
        }
    };

    let record = state.store.get(&identity);
    if let Some(record) = &record {
        if record.key != key {
            debug!("Rejected wrong key for {}", identity);
            return (StatusCode::FORBIDDEN, "Invalid key").into_response();
        }
    }

    let blob = match tokio::fs::File::open(state.destination.join(identity.as_str())).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return (StatusCode::NOT_FOUND, "File not found").into_response();
        }
        Err(e) => {
            error!("Failed to open blob {}: {}", identity, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to read file").into_response();
        }
    };

    let filename = params
        .filename
        .as_deref()
        .map(sanitize_filename)
        .filter(|f| !f.is_empty())
        .or_else(|| {
            record
                .as_ref()
                .map(|r| sanitize_filename(r.file_name()))
                .filter(|f| !f.is_empty())
        })
        .unwrap_or_else(|| identity.to_string());
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    let mut keystream = key.keystream();
    let body = ReaderStream::new(blob).map(move |chunk| {
        chunk.map(|bytes| {
            let mut plain = bytes.to_vec();
            keystream.apply(&mut plain);
            Bytes::from(plain)
        })
    });

    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            ),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

/// Strip characters that could break out of a quoted header parameter.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '"' && *c != '\\' && !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("a\"b.txt"), "ab.txt");
        assert_eq!(sanitize_filename("evil\r\nSet-Cookie: x"), "evilSet-Cookie: x");
        assert_eq!(sanitize_filename("\"\""), "");
        assert_eq!(sanitize_filename("résumé.txt"), "résumé.txt");
    }
}
