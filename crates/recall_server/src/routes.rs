//! HTTP routing: the closed operation enumerations and their dispatch.
//!
//! Operations are a fixed set per path prefix; anything else is a bad
//! request. Engine work is synchronous and runs between awaits, under the
//! per-user lock taken inside each engine function.

use crate::error::{ServerError, ServerResult};
use crate::state::ServerState;
use crate::{full_sync, media, sync, transport};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use recall_proto::{HostKeyRequest, HostKeyResponse, SyncHeader};
use std::sync::Arc;

/// The collection sync operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    /// Login and session minting.
    HostKey,
    /// Handshake.
    Meta,
    /// Open a sync context.
    Start,
    /// Small-object bundle exchange.
    ApplyChanges,
    /// Mid-stream tombstones.
    ApplyGraves,
    /// Next server chunk.
    Chunk,
    /// One client chunk.
    ApplyChunk,
    /// Post-merge count comparison.
    SanityCheck2,
    /// Commit.
    Finish,
    /// Discard.
    Abort,
    /// Full collection upload.
    Upload,
    /// Full collection download.
    Download,
}

impl SyncOp {
    /// Resolves the path segment after `/sync/`.
    pub fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "hostKey" => SyncOp::HostKey,
            "meta" => SyncOp::Meta,
            "start" => SyncOp::Start,
            "applyChanges" => SyncOp::ApplyChanges,
            "applyGraves" => SyncOp::ApplyGraves,
            "chunk" => SyncOp::Chunk,
            "applyChunk" => SyncOp::ApplyChunk,
            "sanityCheck2" => SyncOp::SanityCheck2,
            "finish" => SyncOp::Finish,
            "abort" => SyncOp::Abort,
            "upload" => SyncOp::Upload,
            "download" => SyncOp::Download,
            _ => return None,
        })
    }
}

/// The media sync operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaOp {
    /// Open a media session.
    Begin,
    /// List changes past a USN.
    MediaChanges,
    /// Upload a batch archive.
    UploadChanges,
    /// Download a batch archive.
    DownloadFiles,
    /// Consistency probe.
    MediaSanity,
}

impl MediaOp {
    /// Resolves the path segment after `/msync/`.
    pub fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "begin" => MediaOp::Begin,
            "mediaChanges" => MediaOp::MediaChanges,
            "uploadChanges" => MediaOp::UploadChanges,
            "downloadFiles" => MediaOp::DownloadFiles,
            "mediaSanity" => MediaOp::MediaSanity,
            _ => return None,
        })
    }
}

/// Builds the application router.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/sync/:op", post(sync_entry))
        .route("/msync/:op", post(media_entry))
        .with_state(state)
}

async fn sync_entry(
    State(state): State<Arc<ServerState>>,
    Path(op): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle_sync(&state, &op, &headers, &body) {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn media_entry(
    State(state): State<Arc<ServerState>>,
    Path(op): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle_media(&state, &op, &headers, &body) {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

fn handle_sync(
    state: &ServerState,
    op: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> ServerResult<Response> {
    let op = SyncOp::parse(op)
        .ok_or_else(|| ServerError::BadRequest(format!("unknown sync operation: {op}")))?;
    let header = transport::parse_header(headers);
    let body = transport::decode_body(&header, body)?;
    tracing::debug!(op = ?op, bytes = body.len(), "sync request");

    if op == SyncOp::HostKey {
        return host_key(state, &header, &body);
    }

    let session = state.resolve_session(&header)?;
    match op {
        SyncOp::Meta => {
            let req = transport::parse_json(&body)?;
            transport::json_response(&header, &sync::meta(state, &session, &req)?)
        }
        SyncOp::Start => {
            let req = transport::parse_json(&body)?;
            transport::json_response(&header, &sync::start(state, &session, &req)?)
        }
        SyncOp::ApplyChanges => {
            let req = transport::parse_json(&body)?;
            transport::json_response(&header, &sync::apply_changes(state, &session, &req)?)
        }
        SyncOp::ApplyGraves => {
            let req = transport::parse_json(&body)?;
            transport::json_response(&header, &sync::apply_graves(state, &session, &req)?)
        }
        SyncOp::Chunk => transport::json_response(&header, &sync::chunk(state, &session)?),
        SyncOp::ApplyChunk => {
            let req = transport::parse_json(&body)?;
            transport::json_response(&header, &sync::apply_chunk(state, &session, &req)?)
        }
        SyncOp::SanityCheck2 => {
            let req = transport::parse_json(&body)?;
            transport::json_response(&header, &sync::sanity_check(state, &session, &req)?)
        }
        SyncOp::Finish => transport::json_response(&header, &sync::finish(state, &session)?),
        SyncOp::Abort => transport::json_response(&header, &sync::abort(state, &session)?),
        SyncOp::Upload => {
            transport::json_response(&header, &full_sync::upload(state, &session, &body)?)
        }
        SyncOp::Download => {
            transport::raw_response(&header, full_sync::download(state, &session)?)
        }
        SyncOp::HostKey => unreachable!("handled above"),
    }
}

fn handle_media(
    state: &ServerState,
    op: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> ServerResult<Response> {
    let op = MediaOp::parse(op)
        .ok_or_else(|| ServerError::BadRequest(format!("unknown media operation: {op}")))?;
    let header = transport::parse_header(headers);
    let body = transport::decode_body(&header, body)?;
    tracing::debug!(op = ?op, bytes = body.len(), "media request");

    let session = state.resolve_session(&header)?;
    match op {
        MediaOp::Begin => transport::json_response(&header, &media::begin(state, &session)?),
        MediaOp::MediaChanges => {
            let req = transport::parse_json(&body)?;
            transport::json_response(&header, &media::media_changes(state, &session, &req)?)
        }
        MediaOp::UploadChanges => {
            transport::json_response(&header, &media::upload_changes(state, &session, &body)?)
        }
        MediaOp::DownloadFiles => {
            let req = transport::parse_json(&body)?;
            transport::raw_response(&header, media::download_files(state, &session, &req)?)
        }
        MediaOp::MediaSanity => {
            let req = transport::parse_json(&body)?;
            transport::json_response(&header, &media::media_sanity(state, &session, &req)?)
        }
    }
}

/// Handles `hostKey`: answers discovery probes with the canonical
/// expected-auth response and mints a session on valid credentials.
fn host_key(state: &ServerState, header: &SyncHeader, body: &[u8]) -> ServerResult<Response> {
    let req: HostKeyRequest = transport::parse_json(body)?;
    if req.u.is_empty() && req.p.is_empty() {
        // A probe from a client that has no credentials yet.
        return Err(ServerError::AuthExpected);
    }

    let user_key = match state.gateway.authenticate(&req.u, &req.p)? {
        Some(key) => key,
        None => {
            tracing::info!(user = %req.u, "authentication rejected");
            return Err(ServerError::Unauthorized);
        }
    };

    let session = state.sessions.create(&user_key, &req.u, &header.s)?;
    tracing::info!(user = %req.u, host = %header.s, "session minted");
    transport::json_response(
        header,
        &HostKeyResponse {
            key: session.skey,
            host: header.s.clone(),
        },
    )
}
