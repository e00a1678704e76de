//! The sync request header.

use serde::{Deserialize, Serialize};

/// Name of the request header carrying the sync envelope.
pub const SYNC_HEADER: &str = "sync-header";

/// Name of the response header carrying the uncompressed byte count of a
/// zstd-compressed body.
pub const ORIGINAL_SIZE_HEADER: &str = "original-size";

/// The envelope every sync request carries as a JSON-valued header.
///
/// All fields are optional on the wire; a missing header parses as the
/// default, which has protocol version `0` and therefore never triggers
/// zstd handling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHeader {
    /// Sync protocol version advertised by the client.
    #[serde(default)]
    pub v: u32,
    /// Session key, empty for `hostKey` and discovery probes.
    #[serde(default)]
    pub k: String,
    /// Client identifier string, e.g. `"desktop,2.1.60 (abcdef),linux"`.
    #[serde(default)]
    pub c: String,
    /// Host identifier chosen by the client to distinguish its devices.
    #[serde(default)]
    pub s: String,
}

impl SyncHeader {
    /// Parses the header value, tolerating absent fields.
    ///
    /// Returns `None` when the value is not a JSON object at all.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// Whether request and response bodies for this client are
    /// zstd-compressed.
    pub fn zstd_bodies(&self) -> bool {
        self.v >= crate::SYNC_VERSION_MIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_header() {
        let h = SyncHeader::parse(r#"{"v":11,"k":"abc","c":"desktop,2.1.60,linux","s":"h1"}"#)
            .unwrap();
        assert_eq!(h.v, 11);
        assert_eq!(h.k, "abc");
        assert_eq!(h.s, "h1");
        assert!(h.zstd_bodies());
    }

    #[test]
    fn parse_partial_header() {
        let h = SyncHeader::parse(r#"{"k":"abc"}"#).unwrap();
        assert_eq!(h.v, 0);
        assert!(!h.zstd_bodies());
    }

    #[test]
    fn parse_garbage() {
        assert!(SyncHeader::parse("not json").is_none());
    }
}
