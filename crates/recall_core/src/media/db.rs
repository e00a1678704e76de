//! The media change log.
//!
//! An append-only log of `(fname, csum, size, mtime)` entries keyed by a
//! monotonically increasing media USN. A new entry for an existing name
//! supersedes the older one but the older row stays in the log; deletions
//! append a tombstone entry with an empty checksum. The log is only ever
//! rebuilt from scratch by an external full media reset.

use crate::error::CoreResult;
use crate::now_secs;
use recall_proto::MediaChange;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const MEDIA_DDL: &str = "
CREATE TABLE media_log (
    usn   INTEGER PRIMARY KEY,
    fname TEXT NOT NULL,
    csum  TEXT NOT NULL,
    size  INTEGER NOT NULL,
    mtime INTEGER NOT NULL
);
CREATE INDEX ix_media_log_fname ON media_log (fname);
CREATE TABLE meta (
    last_usn INTEGER NOT NULL
);
INSERT INTO meta (last_usn) VALUES (0);
PRAGMA user_version = 1;
";

/// One user's media change log.
pub struct MediaDb {
    conn: Connection,
}

impl MediaDb {
    /// Opens the log at `path`, creating the schema on first use.
    pub fn open(path: &Path) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "normal")?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if version == 0 {
            conn.execute_batch(MEDIA_DDL)?;
        }
        Ok(MediaDb { conn })
    }

    /// The USN of the last applied change.
    pub fn last_usn(&self) -> CoreResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT last_usn FROM meta", [], |r| r.get(0))?)
    }

    /// All log entries with `usn > after`, in ascending USN order.
    pub fn changes_since(&self, after: i64) -> CoreResult<Vec<MediaChange>> {
        let mut stmt = self
            .conn
            .prepare("SELECT fname, usn, csum FROM media_log WHERE usn > ?1 ORDER BY usn")?;
        let rows = stmt.query_map(params![after], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// The newest log entry for `fname`: `(csum, usn)`.
    pub fn latest_entry(&self, fname: &str) -> CoreResult<Option<(String, i64)>> {
        Ok(self
            .conn
            .query_row(
                "SELECT csum, usn FROM media_log WHERE fname = ?1 ORDER BY usn DESC LIMIT 1",
                params![fname],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?)
    }

    /// Appends one change, incrementing the media USN.
    ///
    /// `csum` is the lowercase hex SHA-1 for additions and the empty
    /// string for deletion tombstones. Returns the assigned USN.
    pub fn append(&self, fname: &str, csum: &str, size: i64) -> CoreResult<i64> {
        let usn = self.last_usn()? + 1;
        self.conn.execute(
            "INSERT INTO media_log (usn, fname, csum, size, mtime)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![usn, fname, csum, size, now_secs()],
        )?;
        self.conn
            .execute("UPDATE meta SET last_usn = ?1", params![usn])?;
        Ok(usn)
    }

    /// Number of names whose newest entry is not a tombstone.
    pub fn nonempty_count(&self) -> CoreResult<i64> {
        Ok(self.conn.query_row(
            "SELECT count(*) FROM media_log m
             WHERE usn = (SELECT max(usn) FROM media_log WHERE fname = m.fname)
               AND csum != ''",
            [],
            |r| r.get(0),
        )?)
    }

    /// Recorded size of the newest non-tombstone entry for `fname`.
    pub fn latest_size(&self, fname: &str) -> CoreResult<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT size FROM media_log WHERE fname = ?1 AND csum != ''
                 ORDER BY usn DESC LIMIT 1",
                params![fname],
                |r| r.get(0),
            )
            .optional()?)
    }

    /// Starts the transaction covering one upload batch.
    pub fn begin(&self) -> CoreResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    /// Commits the upload batch.
    pub fn commit(&self) -> CoreResult<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Discards the upload batch.
    pub fn rollback(&self) {
        if let Err(err) = self.conn.execute_batch("ROLLBACK") {
            tracing::warn!("media rollback failed: {err}");
        }
    }
}
