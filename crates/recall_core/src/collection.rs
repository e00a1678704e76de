//! A handle over one user's collection database.
//!
//! The collection is a single SQLite file in WAL mode. One `Collection`
//! owns one connection; callers serialize access through the per-user lock
//! upstream. An incremental sync runs inside one explicit transaction
//! spanning several HTTP requests: `begin_sync` at `start`, `commit_sync`
//! at `finish`, `rollback_sync` on abort or any failure in between.
//!
//! Closing always checkpoints the write-ahead log first. Deleting or
//! copying the database file while the WAL still holds committed pages
//! silently drops data, so every close and every full-sync file operation
//! goes through [`Collection::checkpoint`].

use crate::error::{CoreError, CoreResult};
use crate::schema::{self, SchemaVersion, TableSchema};
use crate::{now_millis, now_secs};
use recall_proto::{GraveKind, Graves, Row, SanityVec, TableKind};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const SCHEMA_DDL: &str = r#"
CREATE TABLE col (
    id   INTEGER PRIMARY KEY,
    crt  INTEGER NOT NULL,
    mod  INTEGER NOT NULL,
    scm  INTEGER NOT NULL,
    ver  INTEGER NOT NULL,
    dty  INTEGER NOT NULL,
    usn  INTEGER NOT NULL,
    ls   INTEGER NOT NULL,
    conf TEXT NOT NULL
);
CREATE TABLE notes (
    id    INTEGER PRIMARY KEY,
    guid  TEXT NOT NULL,
    mid   INTEGER NOT NULL,
    mod   INTEGER NOT NULL,
    usn   INTEGER NOT NULL,
    tags  TEXT NOT NULL,
    flds  TEXT NOT NULL,
    sfld  TEXT NOT NULL,
    csum  INTEGER NOT NULL,
    flags INTEGER NOT NULL,
    data  TEXT NOT NULL
);
CREATE TABLE cards (
    id     INTEGER PRIMARY KEY,
    nid    INTEGER NOT NULL,
    did    INTEGER NOT NULL,
    ord    INTEGER NOT NULL,
    mod    INTEGER NOT NULL,
    usn    INTEGER NOT NULL,
    type   INTEGER NOT NULL,
    queue  INTEGER NOT NULL,
    due    INTEGER NOT NULL,
    ivl    INTEGER NOT NULL,
    factor INTEGER NOT NULL,
    reps   INTEGER NOT NULL,
    lapses INTEGER NOT NULL,
    left   INTEGER NOT NULL,
    odue   INTEGER NOT NULL,
    odid   INTEGER NOT NULL,
    flags  INTEGER NOT NULL,
    data   TEXT NOT NULL
);
CREATE TABLE revlog (
    id      INTEGER PRIMARY KEY,
    cid     INTEGER NOT NULL,
    usn     INTEGER NOT NULL,
    ease    INTEGER NOT NULL,
    ivl     INTEGER NOT NULL,
    lastIvl INTEGER NOT NULL,
    factor  INTEGER NOT NULL,
    time    INTEGER NOT NULL,
    type    INTEGER NOT NULL
);
CREATE TABLE decks (
    id         INTEGER PRIMARY KEY,
    name       TEXT NOT NULL,
    mtime_secs INTEGER NOT NULL,
    usn        INTEGER NOT NULL,
    common     TEXT NOT NULL,
    kind       TEXT NOT NULL
);
CREATE TABLE deck_config (
    id         INTEGER PRIMARY KEY,
    name       TEXT NOT NULL,
    mtime_secs INTEGER NOT NULL,
    usn        INTEGER NOT NULL,
    config     TEXT NOT NULL
);
CREATE TABLE notetypes (
    id         INTEGER PRIMARY KEY,
    name       TEXT NOT NULL,
    mtime_secs INTEGER NOT NULL,
    usn        INTEGER NOT NULL,
    config     TEXT NOT NULL
);
CREATE TABLE tags (
    tag       TEXT NOT NULL PRIMARY KEY,
    usn       INTEGER NOT NULL,
    collapsed INTEGER NOT NULL DEFAULT 0,
    config    TEXT NOT NULL DEFAULT ''
) WITHOUT ROWID;
CREATE TABLE config (
    key        TEXT NOT NULL PRIMARY KEY,
    usn        INTEGER NOT NULL,
    mtime_secs INTEGER NOT NULL,
    val        TEXT NOT NULL
) WITHOUT ROWID;
CREATE TABLE graves (
    oid  INTEGER NOT NULL,
    type INTEGER NOT NULL,
    usn  INTEGER NOT NULL,
    PRIMARY KEY (oid, type)
) WITHOUT ROWID;
CREATE INDEX ix_notes_usn ON notes (usn);
CREATE INDEX ix_cards_usn ON cards (usn);
CREATE INDEX ix_revlog_usn ON revlog (usn);
CREATE INDEX ix_cards_nid ON cards (nid);
CREATE INDEX ix_graves_usn ON graves (usn);
"#;

/// One user's opened collection.
pub struct Collection {
    conn: Connection,
    path: PathBuf,
    version: SchemaVersion,
    in_txn: bool,
}

impl Collection {
    /// Opens the collection at `path`, creating an empty one if absent.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let fresh = !path.exists();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "normal")?;
        if fresh {
            let now_ms = now_millis();
            conn.execute_batch(SCHEMA_DDL)?;
            conn.execute(
                "INSERT INTO col (id, crt, mod, scm, ver, dty, usn, ls, conf)
                 VALUES (1, ?1, ?2, ?2, ?3, 0, 0, 0, '{}')",
                params![now_secs(), now_ms, SchemaVersion::CURRENT_MARKER],
            )?;
        }
        let marker: i64 = conn.query_row("SELECT ver FROM col", [], |r| r.get(0))?;
        let version = SchemaVersion::from_marker(marker)?;
        Ok(Collection {
            conn,
            path: path.to_path_buf(),
            version,
            in_txn: false,
        })
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The detected schema generation.
    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    // Collection metadata -------------------------------------------------

    fn col_i64(&self, column: &str) -> CoreResult<i64> {
        Ok(self
            .conn
            .query_row(&format!("SELECT {column} FROM col"), [], |r| r.get(0))?)
    }

    /// Collection modification time in milliseconds.
    pub fn mod_millis(&self) -> CoreResult<i64> {
        self.col_i64("mod")
    }

    /// Schema-change timestamp in milliseconds.
    pub fn scm_millis(&self) -> CoreResult<i64> {
        self.col_i64("scm")
    }

    /// The current collection USN.
    pub fn usn(&self) -> CoreResult<i64> {
        self.col_i64("usn")
    }

    /// Last sync timestamp in milliseconds.
    pub fn last_sync_millis(&self) -> CoreResult<i64> {
        self.col_i64("ls")
    }

    /// Collection creation time in seconds.
    pub fn crt_secs(&self) -> CoreResult<i64> {
        self.col_i64("crt")
    }

    /// Sets the collection creation time.
    pub fn set_crt_secs(&self, crt: i64) -> CoreResult<()> {
        self.conn.execute("UPDATE col SET crt = ?1", params![crt])?;
        Ok(())
    }

    /// True when the collection holds no cards.
    pub fn is_empty(&self) -> CoreResult<bool> {
        let row: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM cards LIMIT 1", [], |r| r.get(0))
            .optional()?;
        Ok(row.is_none())
    }

    /// Bumps the last-sync timestamp, used after a full sync.
    pub fn set_last_sync_millis(&self, ls: i64) -> CoreResult<()> {
        self.conn.execute("UPDATE col SET ls = ?1", params![ls])?;
        Ok(())
    }

    // Sync transaction ----------------------------------------------------

    /// Opens the transaction spanning one incremental sync.
    pub fn begin_sync(&mut self) -> CoreResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_txn = true;
        Ok(())
    }

    /// Commits the sync transaction, stamping the new collection state.
    pub fn commit_sync(&mut self, now_ms: i64, new_usn: i64) -> CoreResult<()> {
        self.conn.execute(
            "UPDATE col SET mod = ?1, usn = ?2, ls = ?1",
            params![now_ms, new_usn],
        )?;
        self.conn.execute_batch("COMMIT")?;
        self.in_txn = false;
        Ok(())
    }

    /// Discards the sync transaction if one is open.
    pub fn rollback_sync(&mut self) {
        if self.in_txn {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!("rollback failed: {err}");
            }
            self.in_txn = false;
        }
    }

    /// True while a sync transaction is open.
    pub fn in_sync_txn(&self) -> bool {
        self.in_txn
    }

    // Graves ---------------------------------------------------------------

    /// Tombstones recorded at or after `min_usn`.
    pub fn graves_since(&self, min_usn: i64) -> CoreResult<Graves> {
        let mut stmt = self
            .conn
            .prepare("SELECT oid, type FROM graves WHERE usn >= ?1")?;
        let mut graves = Graves::default();
        let rows = stmt.query_map(params![min_usn], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (oid, kind) = row?;
            if let Some(kind) = GraveKind::from_code(kind) {
                graves.push(kind, oid);
            }
        }
        Ok(graves)
    }

    /// Applies a tombstone bundle: removes the objects and records the
    /// graves at `usn`.
    pub fn apply_graves(&self, graves: &Graves, usn: i64) -> CoreResult<()> {
        for (kind, oid) in graves.entries() {
            match kind {
                GraveKind::Card => {
                    self.conn
                        .execute("DELETE FROM cards WHERE id = ?1", params![oid])?;
                }
                GraveKind::Note => {
                    self.conn
                        .execute("DELETE FROM cards WHERE nid = ?1", params![oid])?;
                    self.conn
                        .execute("DELETE FROM notes WHERE id = ?1", params![oid])?;
                }
                GraveKind::Deck => {
                    if schema::descriptor(self.version, TableKind::Decks).is_some() {
                        self.conn
                            .execute("DELETE FROM decks WHERE id = ?1", params![oid])?;
                    }
                }
            }
            self.conn.execute(
                "INSERT OR IGNORE INTO graves (oid, type, usn) VALUES (?1, ?2, ?3)",
                params![oid, kind.code(), usn],
            )?;
        }
        Ok(())
    }

    // Row streaming --------------------------------------------------------

    /// Rows of `kind` with `usn >= min_usn`, in primary-key order.
    ///
    /// Returns an empty list for tables absent at this schema version.
    pub fn pending_rows(&self, kind: TableKind, min_usn: i64) -> CoreResult<Vec<Row>> {
        let Some(schema) = schema::descriptor(self.version, kind) else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT {} FROM {} WHERE usn >= ?1 ORDER BY {}",
            schema.column_list(),
            schema.name,
            schema.pk_column(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = Vec::new();
        let mut fetched = stmt.query(params![min_usn])?;
        while let Some(row) = fetched.next()? {
            rows.push(schema::row_from_sql(schema, row)?);
        }
        Ok(rows)
    }

    /// Applies incoming rows of `kind` with the merge rule.
    ///
    /// Rows arriving with `usn = -1` are stamped with `max_usn`. A row
    /// whose primary key sits in `graved` is dropped: tombstoned objects
    /// must not resurface inside the same sync transaction. For tables
    /// carrying a `mod` column the stored row wins ties and anything
    /// newer; the revision log is insert-only.
    ///
    /// Returns the number of rows written.
    pub fn apply_rows(
        &self,
        kind: TableKind,
        rows: &[Row],
        max_usn: i64,
        graved: &HashSet<(i64, i64)>,
    ) -> CoreResult<usize> {
        let Some(schema) = schema::descriptor(self.version, kind) else {
            return Ok(0);
        };
        let grave_kind = match kind {
            TableKind::Notes => Some(GraveKind::Note.code()),
            TableKind::Cards => Some(GraveKind::Card.code()),
            TableKind::Decks => Some(GraveKind::Deck.code()),
            _ => None,
        };
        let insert_sql = format!(
            "INSERT OR {} INTO {} ({}) VALUES ({})",
            if kind == TableKind::Revlog {
                "IGNORE"
            } else {
                "REPLACE"
            },
            schema.name,
            schema.column_list(),
            schema.placeholders(),
        );
        let mut written = 0;
        for row in rows {
            if row.len() != schema.columns.len() {
                return Err(CoreError::InvalidData(format!(
                    "{} row has {} fields, expected {}",
                    schema.name,
                    row.len(),
                    schema.columns.len()
                )));
            }
            let mut row = row.clone();
            if schema::row_usn(schema, &row) == Some(-1) {
                row[schema.usn_idx] = Value::from(max_usn);
            }
            let pk = schema::row_pk(schema, &row)?;
            if let (Some(code), SqlValue::Integer(oid)) = (grave_kind, &pk) {
                if graved.contains(&(code, *oid)) {
                    continue;
                }
            }
            if !self.incoming_row_newer(schema, &row, &pk)? {
                continue;
            }
            let values = schema::row_to_sql(schema, &row)?;
            self.conn
                .execute(&insert_sql, params_from_iter(values.iter()))?;
            written += 1;
        }
        Ok(written)
    }

    /// Merge test: true when no stored row exists or the incoming row's
    /// `mod` is strictly newer. Tables without a `mod` column always merge.
    fn incoming_row_newer(
        &self,
        schema: &TableSchema,
        row: &Row,
        pk: &SqlValue,
    ) -> CoreResult<bool> {
        let Some(mod_idx) = schema.mod_idx else {
            return Ok(true);
        };
        let mod_col = schema.columns[mod_idx].0;
        let sql = format!(
            "SELECT {mod_col} FROM {} WHERE {} = ?1",
            schema.name,
            schema.pk_column()
        );
        let existing: Option<i64> = self
            .conn
            .query_row(&sql, params![pk], |r| r.get(0))
            .optional()?;
        match (existing, schema::row_mod(schema, row)) {
            (Some(stored), Some(incoming)) => Ok(incoming > stored),
            (Some(_), None) => Ok(false),
            (None, _) => Ok(true),
        }
    }

    // Config blob ----------------------------------------------------------

    /// Reads the collection config as a key/value map.
    pub fn read_config(&self) -> CoreResult<Map<String, Value>> {
        if schema::descriptor(self.version, TableKind::Config).is_some() {
            let mut stmt = self.conn.prepare("SELECT key, val FROM config")?;
            let mut map = Map::new();
            let rows = stmt.query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (key, raw) = row?;
                let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                map.insert(key, value);
            }
            Ok(map)
        } else {
            let raw: String = self.conn.query_row("SELECT conf FROM col", [], |r| r.get(0))?;
            Ok(serde_json::from_str(&raw).unwrap_or_default())
        }
    }

    /// Merges incoming config keys, stamping them with `max_usn`.
    pub fn merge_config(
        &self,
        incoming: &Map<String, Value>,
        max_usn: i64,
        now_ms: i64,
    ) -> CoreResult<()> {
        if schema::descriptor(self.version, TableKind::Config).is_some() {
            for (key, value) in incoming {
                self.conn.execute(
                    "INSERT OR REPLACE INTO config (key, usn, mtime_secs, val)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![key, max_usn, now_ms / 1000, serde_json::to_string(value)?],
                )?;
            }
        } else {
            let mut conf = self.read_config()?;
            for (key, value) in incoming {
                conf.insert(key.clone(), value.clone());
            }
            self.conn.execute(
                "UPDATE col SET conf = ?1",
                params![serde_json::to_string(&conf)?],
            )?;
        }
        Ok(())
    }

    // Sanity ---------------------------------------------------------------

    /// Computes the fixed-order count vector used by the sanity check.
    pub fn sanity_counts(&self) -> CoreResult<SanityVec> {
        let count = |table: &str| -> CoreResult<i64> {
            Ok(self
                .conn
                .query_row(&format!("SELECT count(*) FROM {table}"), [], |r| r.get(0))?)
        };
        let table_count = |kind: TableKind| -> CoreResult<i64> {
            match schema::descriptor(self.version, kind) {
                Some(schema) => count(schema.name),
                None => Ok(0),
            }
        };
        let config = if schema::descriptor(self.version, TableKind::Config).is_some() {
            count("config")?
        } else {
            self.read_config()?.len() as i64
        };
        Ok(SanityVec([
            count("notes")?,
            count("cards")?,
            count("revlog")?,
            count("graves")?,
            table_count(TableKind::Decks)?,
            table_count(TableKind::DeckConfigs)?,
            table_count(TableKind::Notetypes)?,
            table_count(TableKind::Tags)?,
            config,
        ]))
    }

    // File-level operations ------------------------------------------------

    /// Forces a full write-ahead-log checkpoint.
    ///
    /// Must run before the database file is copied, replaced or deleted.
    pub fn checkpoint(&self) -> CoreResult<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    /// Runs SQLite's integrity check.
    pub fn integrity_ok(&self) -> CoreResult<bool> {
        let verdict: String = self
            .conn
            .query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
        Ok(verdict == "ok")
    }

    /// Structural check: no cards without notes, no notes without cards.
    pub fn basic_check(&self) -> CoreResult<bool> {
        let orphan_cards: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM cards WHERE nid NOT IN (SELECT id FROM notes) LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        if orphan_cards.is_some() {
            return Ok(false);
        }
        let orphan_notes: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM notes WHERE id NOT IN (SELECT DISTINCT nid FROM cards) LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(orphan_notes.is_none())
    }

    /// Checkpoints and closes the collection.
    pub fn close(mut self) -> CoreResult<()> {
        self.rollback_sync();
        self.checkpoint()?;
        Ok(())
    }

    /// Validates a collection file received through full upload without
    /// touching the live collection: opens it read-only, checks the schema
    /// marker, integrity and basic structure.
    pub fn validate_file(path: &Path) -> CoreResult<()> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let marker: i64 = conn
            .query_row("SELECT ver FROM col", [], |r| r.get(0))
            .map_err(|_| CoreError::Corrupt("missing col row".into()))?;
        SchemaVersion::from_marker(marker)?;
        let verdict: String = conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
        if verdict != "ok" {
            return Err(CoreError::Corrupt(format!("integrity check: {verdict}")));
        }
        let orphans: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM cards WHERE nid NOT IN (SELECT id FROM notes) LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        if orphans.is_some() {
            return Err(CoreError::Corrupt("cards without notes".into()));
        }
        Ok(())
    }
}

impl Drop for Collection {
    fn drop(&mut self) {
        self.rollback_sync();
    }
}
