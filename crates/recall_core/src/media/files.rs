//! The on-disk media file bag.
//!
//! Filenames are NFC-normalized before hashing or touching the file
//! system, path separators are stripped, and names reserved on
//! case-insensitive file systems are refused.

use crate::error::{CoreError, CoreResult};
use crate::media::MAX_FILENAME_BYTES;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

// Device names Windows claims regardless of extension.
const RESERVED_STEMS: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Normalizes a client-supplied media filename.
///
/// Applies NFC, drops any path components, and rejects names that are
/// empty, over-long, contain control characters or collide with reserved
/// device names on case-insensitive file systems.
pub fn normalize_filename(raw: &str) -> CoreResult<String> {
    let normalized: String = raw.nfc().collect();
    let name = normalized
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .to_string();

    if name.is_empty() {
        return Err(CoreError::InvalidFilename("empty filename".into()));
    }
    if name.len() > MAX_FILENAME_BYTES {
        return Err(CoreError::InvalidFilename(format!(
            "filename longer than {MAX_FILENAME_BYTES} bytes"
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(CoreError::InvalidFilename(
            "control characters in filename".into(),
        ));
    }
    let stem = name.split('.').next().unwrap_or_default().to_uppercase();
    if RESERVED_STEMS.contains(&stem.as_str()) {
        return Err(CoreError::InvalidFilename(format!(
            "reserved filename: {name}"
        )));
    }
    Ok(name)
}

/// Lowercase hex SHA-1 of `data`.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// One user's media directory.
pub struct MediaStore {
    dir: PathBuf,
}

impl MediaStore {
    /// Opens the media directory, creating it if missing.
    pub fn open(dir: &Path) -> CoreResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(MediaStore {
            dir: dir.to_path_buf(),
        })
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Writes (or replaces) a file.
    pub fn write(&self, name: &str, data: &[u8]) -> CoreResult<()> {
        std::fs::write(self.file_path(name), data)?;
        Ok(())
    }

    /// Reads a file, `None` when absent.
    pub fn read(&self, name: &str) -> CoreResult<Option<Vec<u8>>> {
        match std::fs::read(self.file_path(name)) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes a file, returning whether it existed.
    pub fn delete(&self, name: &str) -> CoreResult<bool> {
        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// True when the file exists.
    pub fn contains(&self, name: &str) -> bool {
        self.file_path(name).is_file()
    }
}
