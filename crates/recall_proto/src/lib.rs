//! # Recall Sync Protocol
//!
//! Wire types for the recall sync server.
//!
//! This crate provides:
//! - The sync request header carried on every HTTP call
//! - Per-operation request/response types for `/sync/` endpoints
//! - Per-operation request/response types for `/msync/` endpoints
//! - The chunk, grave and sanity-vector types exchanged while streaming
//!
//! Everything here is plain JSON over the wire. The field-type rules are
//! strict: object identifiers in grave lists and note checksum columns are
//! strings, every other integer column stays an integer. Clients reject
//! responses that get this wrong, so the row types enforce it at
//! serialization time.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod chunk;
mod header;
mod media;
mod messages;

pub use chunk::{Changes, Chunk, GraveKind, Graves, Row, SanityVec, TableKind};
pub use header::{SyncHeader, ORIGINAL_SIZE_HEADER, SYNC_HEADER};
pub use media::{
    BeginData, MediaChange, MediaChangesRequest, MediaEnvelope, MediaSanityRequest,
    UploadChangesData,
};
pub use messages::{
    ApplyChangesRequest, ApplyChangesResponse, ApplyChunkRequest, ApplyChunkResponse,
    ApplyGravesRequest, ChunkResponse, DownloadFilesRequest, FinishResponse, HostKeyRequest,
    HostKeyResponse, MetaRequest, MetaResponse, SanityCheckRequest, SanityCheckResponse,
    StartRequest, StartResponse, UploadResponse,
};

/// Lowest sync protocol version this server speaks.
///
/// Older clients used multipart request framing and gzip compression; that
/// path is gone. Clients below this version are told to upgrade.
pub const SYNC_VERSION_MIN: u32 = 11;

/// Highest sync protocol version this server speaks.
pub const SYNC_VERSION_MAX: u32 = 11;

/// Returns true if `version` is a protocol version this server can serve.
pub fn version_supported(version: u32) -> bool {
    (SYNC_VERSION_MIN..=SYNC_VERSION_MAX).contains(&version)
}
