//! Request and response types for the `/msync/` endpoints.
//!
//! Media responses use a `{data, err}` envelope — except `mediaChanges`,
//! whose reply is a bare array of `[fname, usn, sha1]` triples. That shape
//! is mandated by the clients; wrapping it in an object sends them into an
//! infinite retry loop.

use serde::{Deserialize, Serialize};

/// The `{data, err}` envelope wrapping most media responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaEnvelope<T> {
    /// The payload, absent on failure.
    pub data: Option<T>,
    /// Error message, empty on success.
    pub err: String,
}

impl<T> MediaEnvelope<T> {
    /// A successful envelope.
    pub fn ok(data: T) -> Self {
        MediaEnvelope {
            data: Some(data),
            err: String::new(),
        }
    }

    /// A failed envelope.
    pub fn fail(err: impl Into<String>) -> Self {
        MediaEnvelope {
            data: None,
            err: err.into(),
        }
    }
}

/// `begin` payload: the current media USN and the echoed session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginData {
    /// Current media USN.
    pub usn: i64,
    /// Session key echoed back to the client.
    pub sk: String,
}

/// `mediaChanges` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaChangesRequest {
    /// The highest media USN the client has already seen.
    #[serde(default, rename = "lastUsn")]
    pub last_usn: i64,
}

/// One media log entry on the wire: `[fname, usn, sha1-or-empty]`.
///
/// An empty hash marks a deletion tombstone.
pub type MediaChange = (String, i64, String);

/// `uploadChanges` payload: how much was applied and where the log ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChangesData {
    /// Number of archive entries processed.
    pub processed: i64,
    /// The USN of the last applied change.
    pub current_usn: i64,
}

/// `mediaSanity` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaSanityRequest {
    /// The client's count of non-deleted media files.
    #[serde(default)]
    pub local: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn media_changes_are_a_direct_array() {
        let changes: Vec<MediaChange> = vec![
            ("a.jpg".into(), 1, "aabb".into()),
            ("b.mp3".into(), 2, String::new()),
        ];
        let v = serde_json::to_value(&changes).unwrap();
        assert_eq!(v, json!([["a.jpg", 1, "aabb"], ["b.mp3", 2, ""]]));
    }

    #[test]
    fn empty_changes_are_an_empty_array() {
        let changes: Vec<MediaChange> = Vec::new();
        assert_eq!(serde_json::to_string(&changes).unwrap(), "[]");
    }

    #[test]
    fn envelope_shapes() {
        let ok = MediaEnvelope::ok(BeginData {
            usn: 4,
            sk: "k".into(),
        });
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["data"]["usn"], json!(4));
        assert_eq!(v["err"], json!(""));

        let fail: MediaEnvelope<BeginData> = MediaEnvelope::fail("boom");
        let v = serde_json::to_value(&fail).unwrap();
        assert_eq!(v["data"], json!(null));
        assert_eq!(v["err"], json!("boom"));
    }
}
