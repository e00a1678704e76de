//! The transport shim: header contract and body compression.
//!
//! Clients at protocol version ≥ 11 send and receive zstd-compressed
//! bodies; the advertised version travels in the `sync-header` request
//! header. Compressed responses carry the uncompressed byte count in the
//! `original-size` header. Chunked request bodies are already reassembled
//! by the HTTP stack before they reach this layer.

use crate::error::{ServerError, ServerResult};
use axum::http::{header::CONTENT_TYPE, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use recall_proto::{SyncHeader, ORIGINAL_SIZE_HEADER, SYNC_HEADER};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Compression level for response bodies.
const ZSTD_LEVEL: i32 = 0;

/// Extracts the sync header, tolerating its absence.
pub fn parse_header(headers: &HeaderMap) -> SyncHeader {
    headers
        .get(SYNC_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(SyncHeader::parse)
        .unwrap_or_default()
}

/// Decodes a request body according to the client's protocol version.
pub fn decode_body(header: &SyncHeader, body: &[u8]) -> ServerResult<Vec<u8>> {
    if body.is_empty() || !header.zstd_bodies() {
        return Ok(body.to_vec());
    }
    zstd::stream::decode_all(std::io::Cursor::new(body))
        .map_err(|err| ServerError::BadRequest(format!("bad zstd body: {err}")))
}

/// Parses a JSON request body; an empty body parses as the default.
pub fn parse_json<T: DeserializeOwned + Default>(body: &[u8]) -> ServerResult<T> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| ServerError::BadRequest(format!("malformed request body: {err}")))
}

/// Encodes a raw response body, compressing for modern clients.
pub fn raw_response(header: &SyncHeader, bytes: Vec<u8>) -> ServerResult<Response> {
    if !header.zstd_bodies() {
        return Ok((
            StatusCode::OK,
            [(CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response());
    }
    let original_size = bytes.len().to_string();
    let compressed = zstd::stream::encode_all(std::io::Cursor::new(bytes), ZSTD_LEVEL)
        .map_err(|err| {
            tracing::error!("zstd encode failed: {err}");
            ServerError::Internal
        })?;
    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE.as_str(), "application/octet-stream"),
            (ORIGINAL_SIZE_HEADER, original_size.as_str()),
        ],
        compressed,
    )
        .into_response())
}

/// Serializes a JSON response body and encodes it for the client.
pub fn json_response<T: Serialize>(header: &SyncHeader, value: &T) -> ServerResult<Response> {
    let bytes = serde_json::to_vec(value).map_err(|err| {
        tracing::error!("response serialization failed: {err}");
        ServerError::Internal
    })?;
    raw_response(header, bytes)
}
