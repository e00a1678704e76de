//! Media storage: change log, file bag and batch archive codec.

mod archive;
mod db;
mod files;

pub use archive::{pack, unpack, ArchiveEntry};
pub use db::MediaDb;
pub use files::{normalize_filename, sha1_hex, MediaStore};

/// Maximum accepted filename length in bytes, after normalization.
pub const MAX_FILENAME_BYTES: usize = 255;

/// Maximum size of one media file.
pub const MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;

/// Maximum uncompressed payload of one batch archive.
pub const MAX_ARCHIVE_BYTES: u64 = 100 * 1024 * 1024;

/// Soft target for outgoing archive payloads; packing stops past this.
pub const ARCHIVE_TARGET_BYTES: u64 = 2 * 1024 * 1024 + 512 * 1024;

/// Maximum number of files in one outgoing archive.
pub const MAX_FILES_PER_ARCHIVE: usize = 25;
