//! Request and response types for the `/sync/` endpoints.

use crate::chunk::{Changes, Chunk, Graves, SanityVec};
use serde::{Deserialize, Serialize};

/// `hostKey` request: credentials, or empty for a discovery probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostKeyRequest {
    /// Username.
    #[serde(default)]
    pub u: String,
    /// Password.
    #[serde(default)]
    pub p: String,
}

/// `hostKey` response: the minted session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostKeyResponse {
    /// The session key to present on subsequent requests.
    pub key: String,
    /// Echo of the client's host identifier.
    pub host: String,
}

/// `meta` request: the client's view of its own collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaRequest {
    /// Sync protocol version.
    #[serde(default)]
    pub v: u32,
    /// Client identifier string.
    #[serde(default)]
    pub cv: String,
    /// Client collection modification time (ms). Zero when not reported.
    #[serde(default, rename = "mod")]
    pub mod_: i64,
    /// Client collection USN.
    #[serde(default)]
    pub usn: i64,
    /// Client schema-change timestamp (ms). Zero when not reported.
    #[serde(default)]
    pub scm: i64,
    /// Client wall clock (s). Zero when not reported.
    #[serde(default)]
    pub ts: i64,
}

/// `meta` response: the server's view plus the continue decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaResponse {
    /// Server collection modification time (ms).
    #[serde(rename = "mod")]
    pub mod_: i64,
    /// Server schema-change timestamp (ms).
    pub scm: i64,
    /// Server collection USN.
    pub usn: i64,
    /// Server wall clock (s).
    pub ts: i64,
    /// Server media USN.
    pub musn: i64,
    /// Username the session is bound to.
    pub uname: String,
    /// Human-readable refusal reason when `cont` is false.
    pub msg: String,
    /// False when the server refuses incremental sync.
    pub cont: bool,
    /// True when the server collection has no cards.
    pub empty: bool,
    /// Historical sharding hint; always zero here.
    #[serde(rename = "hostNum")]
    pub host_num: i64,
}

/// `start` request: opens a sync context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    /// The lowest server USN the client has not seen.
    #[serde(default, rename = "minUsn")]
    pub min_usn: i64,
    /// The client's own highest USN.
    #[serde(default, rename = "maxUsn")]
    pub max_usn: i64,
    /// True when the client collection `mod` is newer than the server's.
    #[serde(default)]
    pub lnewer: bool,
    /// Tombstones collected on the client since its last sync.
    #[serde(default)]
    pub graves: Option<Graves>,
}

/// `start` response: the server's unseen tombstones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    /// Server-side graves with `usn >= minUsn`.
    pub graves: Graves,
}

/// `applyGraves` request: tombstones sent mid-stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyGravesRequest {
    /// The tombstone bundle.
    #[serde(default)]
    pub chunk: Graves,
}

/// `applyChanges` request: the client's small-object bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyChangesRequest {
    /// Client-side changed decks, deck-configs, note-types and tags.
    #[serde(default)]
    pub changes: Changes,
}

/// `applyChanges` response: the server's counterpart bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyChangesResponse {
    /// Server-side changed decks, deck-configs, note-types and tags.
    pub changes: Changes,
}

/// `chunk` response: the next streamed batch of server rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResponse {
    /// The batch; `done` is set on the last one.
    pub chunk: Chunk,
}

/// `applyChunk` request: one streamed batch of client rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyChunkRequest {
    /// The batch; `done` is set on the client's last one.
    #[serde(default)]
    pub chunk: Chunk,
}

/// `applyChunk` response: acknowledges the applied batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyChunkResponse {
    /// Empty ack mirroring the request envelope; `done` echoes the request.
    pub chunk: Chunk,
}

/// `sanityCheck2` request: the client's count vector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SanityCheckRequest {
    /// Client-side sanity vector.
    #[serde(default)]
    pub client: SanityVec,
}

/// `sanityCheck2` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanityCheckResponse {
    /// `"ok"` or `"bad"`.
    pub status: String,
    /// The client vector, echoed back on mismatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<SanityVec>,
    /// The server vector, included on mismatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<SanityVec>,
}

impl SanityCheckResponse {
    /// A passing check.
    pub fn ok() -> Self {
        SanityCheckResponse {
            status: "ok".into(),
            c: None,
            s: None,
        }
    }

    /// A failing check carrying both vectors for diagnosis.
    pub fn bad(client: SanityVec, server: SanityVec) -> Self {
        SanityCheckResponse {
            status: "bad".into(),
            c: Some(client),
            s: Some(server),
        }
    }
}

/// `finish` response: the server-chosen commit timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishResponse {
    /// New collection modification time (ms).
    #[serde(rename = "mod")]
    pub mod_: i64,
}

/// `upload` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    /// `"OK"` on success.
    pub status: String,
}

/// `downloadFiles` request (media): the filenames to package.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadFilesRequest {
    /// Requested filenames.
    #[serde(default)]
    pub files: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn meta_request_tolerates_minimal_body() {
        let req: MetaRequest = serde_json::from_str(r#"{"v":11,"cv":"desktop,2.1.60,linux"}"#)
            .unwrap();
        assert_eq!(req.v, 11);
        assert_eq!(req.ts, 0);
        assert_eq!(req.scm, 0);
    }

    #[test]
    fn meta_response_field_names() {
        let resp = MetaResponse {
            mod_: 5,
            scm: 6,
            usn: 7,
            ts: 8,
            musn: 9,
            uname: "u".into(),
            msg: String::new(),
            cont: true,
            empty: false,
            host_num: 0,
        };
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["mod"], json!(5));
        assert_eq!(v["hostNum"], json!(0));
        assert!(v.get("mod_").is_none());
    }

    #[test]
    fn start_request_wire_names() {
        let req: StartRequest =
            serde_json::from_str(r#"{"minUsn":3,"maxUsn":9,"lnewer":true}"#).unwrap();
        assert_eq!(req.min_usn, 3);
        assert_eq!(req.max_usn, 9);
        assert!(req.lnewer);
        assert!(req.graves.is_none());
    }

    #[test]
    fn sanity_bad_carries_both_vectors() {
        let resp = SanityCheckResponse::bad(SanityVec([1; 9]), SanityVec([2; 9]));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["status"], json!("bad"));
        assert_eq!(v["c"][0], json!(1));
        assert_eq!(v["s"][0], json!(2));
    }

    #[test]
    fn sanity_ok_omits_vectors() {
        let s = serde_json::to_string(&SanityCheckResponse::ok()).unwrap();
        assert!(!s.contains("\"c\""));
    }
}
