//! Batch archive codec for media transfer.
//!
//! Archives are ZIP files with one `_meta` member holding UTF-8 JSON: a
//! list of `[member-name, real-filename]` pairs (an optional third element
//! carries the sender's SHA-1). Member names are short opaque strings —
//! decimal indexes here — so archive metadata never contains
//! filesystem-unsafe characters. A deletion entry has an empty
//! real-filename and carries the doomed name in its first field; no
//! archive member backs it.

use crate::error::{CoreError, CoreResult};
use crate::media::{MAX_ARCHIVE_BYTES, MAX_FILE_BYTES};
use serde_json::Value;
use std::io::{Cursor, Read, Write};
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

/// The metadata member name.
const META_MEMBER: &str = "_meta";

/// One decoded archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// The real filename (not yet normalized).
    pub fname: String,
    /// File contents; `None` marks a deletion.
    pub data: Option<Vec<u8>>,
    /// SHA-1 declared by the sender, when present in `_meta`.
    pub declared_sha1: Option<String>,
}

/// Decodes an uploaded batch archive into its entries, in `_meta` order.
///
/// Members over the per-file size cap are skipped with a warning; the
/// archive as a whole is rejected only when its accepted payload exceeds
/// the total cap.
pub fn unpack(bytes: &[u8]) -> CoreResult<Vec<ArchiveEntry>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| CoreError::InvalidArchive(e.to_string()))?;

    let meta: Value = {
        let mut member = archive
            .by_name(META_MEMBER)
            .map_err(|_| CoreError::InvalidArchive("missing _meta member".into()))?;
        let mut raw = String::new();
        member
            .read_to_string(&mut raw)
            .map_err(|e| CoreError::InvalidArchive(format!("unreadable _meta: {e}")))?;
        serde_json::from_str(&raw)
            .map_err(|e| CoreError::InvalidArchive(format!("bad _meta json: {e}")))?
    };
    let Value::Array(items) = meta else {
        return Err(CoreError::InvalidArchive("_meta is not a list".into()));
    };

    let mut entries = Vec::with_capacity(items.len());
    let mut total: u64 = 0;
    for item in items {
        let Value::Array(fields) = item else {
            return Err(CoreError::InvalidArchive("_meta entry is not a pair".into()));
        };
        let member = fields
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::InvalidArchive("missing member name".into()))?;
        let fname = fields
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::InvalidArchive("missing real filename".into()))?;
        let declared_sha1 = fields
            .get(2)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        if fname.is_empty() {
            // Deletion: the first field carries the doomed filename.
            entries.push(ArchiveEntry {
                fname: member.to_string(),
                data: None,
                declared_sha1: None,
            });
            continue;
        }

        let mut file = archive.by_name(member).map_err(|_| {
            CoreError::InvalidArchive(format!("member {member} listed but absent"))
        })?;
        if file.size() > MAX_FILE_BYTES {
            // One oversized file does not doom the rest of the batch.
            tracing::warn!(file = %fname, "file exceeds the size cap, skipping");
            continue;
        }
        total += file.size();
        if total > MAX_ARCHIVE_BYTES {
            return Err(CoreError::InvalidArchive(
                "archive exceeds the payload cap".into(),
            ));
        }
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)
            .map_err(|e| CoreError::InvalidArchive(format!("unreadable member: {e}")))?;
        entries.push(ArchiveEntry {
            fname: fname.to_string(),
            data: Some(data),
            declared_sha1,
        });
    }
    Ok(entries)
}

/// Packages files into a download archive.
///
/// Member names are regenerated as decimal indexes; the caller bounds the
/// file count and payload size.
pub fn pack(files: &[(String, Vec<u8>)]) -> CoreResult<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options: FileOptions = FileOptions::default();

    let mut meta: Vec<Value> = Vec::with_capacity(files.len());
    for (idx, (fname, data)) in files.iter().enumerate() {
        let member = idx.to_string();
        writer
            .start_file(member.as_str(), options)
            .map_err(|e| CoreError::InvalidArchive(e.to_string()))?;
        writer.write_all(data)?;
        meta.push(Value::Array(vec![
            Value::from(member),
            Value::from(fname.as_str()),
        ]));
    }
    writer
        .start_file(META_MEMBER, options)
        .map_err(|e| CoreError::InvalidArchive(e.to_string()))?;
    writer.write_all(serde_json::to_string(&Value::Array(meta))?.as_bytes())?;

    let cursor = writer
        .finish()
        .map_err(|e| CoreError::InvalidArchive(e.to_string()))?;
    Ok(cursor.into_inner())
}
