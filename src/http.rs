//! HTTP surface for the allocation filesystem endpoints.
//!
//! Routes under `/v1/client/fs/` serve directory listings, stats, one-shot
//! reads, and the live stream against a registry of allocation sandboxes.
//! Allocation-to-node resolution and authentication live outside this
//! crate; the registry is the seam they plug into.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::handler::{self, require_alloc_id, require_path, StreamConfig, StreamParams};
use crate::sandbox::AllocDir;

/// Buffer between the framer's sink and the response body.
const STREAM_BODY_BUFFER: usize = 64 * 1024;

/// Maps allocation ids to their sandbox roots.
#[derive(Debug, Default)]
pub struct AllocRegistry {
    allocs: RwLock<HashMap<String, AllocDir>>,
}

impl AllocRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the sandbox for an allocation id.
    pub fn register(&self, alloc_id: impl Into<String>, alloc: AllocDir) {
        self.allocs
            .write()
            .expect("alloc registry lock poisoned")
            .insert(alloc_id.into(), alloc);
    }

    /// Look up the sandbox for an allocation id.
    pub fn lookup(&self, alloc_id: &str) -> Result<AllocDir> {
        self.allocs
            .read()
            .expect("alloc registry lock poisoned")
            .get(alloc_id)
            .cloned()
            .ok_or_else(|| Error::UnknownAlloc(alloc_id.to_string()))
    }
}

/// Shared state behind the filesystem routes.
#[derive(Clone)]
pub struct FsState {
    registry: Arc<AllocRegistry>,
    config: StreamConfig,
}

impl FsState {
    pub fn new(registry: Arc<AllocRegistry>) -> Self {
        Self {
            registry,
            config: StreamConfig::new(),
        }
    }

    /// Override the stream tuning (tests use short windows).
    pub fn with_config(registry: Arc<AllocRegistry>, config: StreamConfig) -> Self {
        Self { registry, config }
    }
}

/// Build the filesystem router.
///
/// The trailing-slash variants answer requests that omit the allocation id
/// with the fixed parameter error rather than a bare 404.
pub fn router(state: FsState) -> Router {
    Router::new()
        .route("/v1/client/fs/ls/{alloc_id}", get(list_request))
        .route("/v1/client/fs/stat/{alloc_id}", get(stat_request))
        .route("/v1/client/fs/readat/{alloc_id}", get(read_at_request))
        .route("/v1/client/fs/cat/{alloc_id}", get(cat_request))
        .route("/v1/client/fs/stream/{alloc_id}", get(stream_request))
        .route("/v1/client/fs/ls/", get(missing_alloc_id))
        .route("/v1/client/fs/stat/", get(missing_alloc_id))
        .route("/v1/client/fs/readat/", get(missing_alloc_id))
        .route("/v1/client/fs/cat/", get(missing_alloc_id))
        .route("/v1/client/fs/stream/", get(missing_alloc_id))
        .with_state(state)
}

/// Bind and serve the filesystem routes until the listener fails.
pub async fn run_server(addr: &str, state: FsState) -> std::io::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "allocfs server listening");
    axum::serve(listener, app).await
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::AllocIdNotPresent
        | Error::FileNameNotPresent
        | Error::InvalidOrigin(_)
        | Error::InvalidOffset(_)
        | Error::InvalidLimit(_) => StatusCode::BAD_REQUEST,
        Error::Forbidden(_) => StatusCode::FORBIDDEN,
        Error::NotFound(_) | Error::UnknownAlloc(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    (status_for(&err), err.to_string()).into_response()
}

async fn missing_alloc_id() -> Response {
    error_response(Error::AllocIdNotPresent)
}

async fn list_request(
    State(state): State<FsState>,
    Path(alloc_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let result = async {
        require_alloc_id(&alloc_id)?;
        let alloc = state.registry.lookup(&alloc_id)?;
        // Listing defaults to the allocation root.
        let path = query.get("path").cloned().unwrap_or_else(|| "/".to_string());
        alloc.list(&path).await
    }
    .await;

    match result {
        Ok(infos) => Json(infos).into_response(),
        Err(e) => error_response(e),
    }
}

async fn stat_request(
    State(state): State<FsState>,
    Path(alloc_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let result = async {
        require_alloc_id(&alloc_id)?;
        let alloc = state.registry.lookup(&alloc_id)?;
        let path = require_path(&query)?;
        alloc.stat(&path).await
    }
    .await;

    match result {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(e),
    }
}

async fn read_at_request(
    State(state): State<FsState>,
    Path(alloc_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let result = async {
        require_alloc_id(&alloc_id)?;
        let alloc = state.registry.lookup(&alloc_id)?;
        let path = require_path(&query)?;

        let offset = match query.get("offset").map(String::as_str) {
            None | Some("") => 0,
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|o| *o >= 0)
                .ok_or_else(|| Error::InvalidOffset(raw.to_string()))? as u64,
        };
        let limit = match query.get("limit").map(String::as_str) {
            None | Some("") => 0,
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| Error::InvalidLimit(raw.to_string()))?,
        };

        alloc.read_at(&path, offset, limit).await
    }
    .await;

    match result {
        Ok(reader) => octet_stream(reader),
        Err(e) => error_response(e),
    }
}

async fn cat_request(
    State(state): State<FsState>,
    Path(alloc_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let result = async {
        require_alloc_id(&alloc_id)?;
        let alloc = state.registry.lookup(&alloc_id)?;
        let path = require_path(&query)?;
        alloc.read_at(&path, 0, 0).await
    }
    .await;

    match result {
        Ok(reader) => octet_stream(reader),
        Err(e) => error_response(e),
    }
}

async fn stream_request(
    State(state): State<FsState>,
    Path(alloc_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let params = match StreamParams::parse(&alloc_id, &query) {
        Ok(params) => params,
        Err(e) => return error_response(e),
    };
    let alloc = match state.registry.lookup(&alloc_id) {
        Ok(alloc) => alloc,
        Err(e) => return error_response(e),
    };
    // Resolve up front so sandbox violations and missing files surface as
    // status codes instead of an empty stream.
    if let Err(e) = alloc.resolve(&params.path).await {
        return error_response(e);
    }

    let (sink, body_src) = tokio::io::duplex(STREAM_BODY_BUFFER);
    let config = state.config.clone();
    let cancel = CancellationToken::new();
    tokio::spawn(async move {
        if let Err(e) = handler::stream(&alloc, &params, sink, &config, cancel).await {
            debug!(error = %e, "stream request ended with error");
        }
    });

    // When the client goes away the body (and with it the read half of
    // the duplex) is dropped; the framer's next write fails and the
    // stream task tears itself down.
    let body = Body::from_stream(ReaderStream::new(body_src));
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn octet_stream<R>(reader: R) -> Response
where
    R: tokio::io::AsyncRead + Send + 'static,
{
    let body = Body::from_stream(ReaderStream::new(reader));
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response()
}
