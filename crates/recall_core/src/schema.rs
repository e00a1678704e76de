//! Schema compatibility layer.
//!
//! Collection files in the wild span several on-disk schema generations.
//! This module detects the version marker of an opened collection and maps
//! each sync-relevant table to a descriptor: the column list, each column's
//! serialization kind, and where the `mod` and `usn` columns sit. The sync
//! engine only ever sees opaque row tuples shaped by these descriptors.
//!
//! Version map:
//! - V11 — legacy schema; decks, note types and tags live as JSON blobs in
//!   the `col` row, so only notes/cards/revlog/graves (plus the config
//!   blob) take part in incremental sync.
//! - V14 — adds the `deck_config`, `config` and two-column `tags` tables.
//! - V15 — adds `notetypes` and the row-per-deck `decks` table.
//! - V17 — restructures `tags` (collapsed + config columns).
//! - V18 — restructures the graves primary key; column layout as V17.
//!
//! Unknown future versions degrade to the V18 descriptor set instead of
//! refusing to serve.

use crate::error::{CoreError, CoreResult};
use recall_proto::{Row, TableKind};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::Value;

/// A supported on-disk schema generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchemaVersion {
    /// Legacy JSON-blob schema.
    V11,
    /// Split config/deck-config/tags tables.
    V14,
    /// Row-per-deck and row-per-notetype tables.
    V15,
    /// Restructured tags.
    V17,
    /// Current schema.
    V18,
}

impl SchemaVersion {
    /// Resolves the `col.ver` marker of an opened collection.
    ///
    /// Versions below 11 predate the sync protocol this server speaks and
    /// surface a schema-lock error; unknown future versions fall back to
    /// the newest descriptor set.
    pub fn from_marker(ver: i64) -> CoreResult<Self> {
        match ver {
            i64::MIN..=10 => Err(CoreError::SchemaLock(format!(
                "collection schema {ver} is too old to sync"
            ))),
            11..=13 => Ok(SchemaVersion::V11),
            14 => Ok(SchemaVersion::V14),
            15 | 16 => Ok(SchemaVersion::V15),
            17 => Ok(SchemaVersion::V17),
            _ => Ok(SchemaVersion::V18),
        }
    }

    /// The marker written into freshly created collections.
    pub const CURRENT_MARKER: i64 = 18;

    /// Tables participating in incremental sync at this version, in the
    /// stable enumeration order.
    pub fn sync_tables(self) -> Vec<TableKind> {
        TableKind::ALL
            .into_iter()
            .filter(|kind| descriptor(self, *kind).is_some())
            .collect()
    }
}

/// How a column's values appear in wire JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// A plain integer column.
    Integer,
    /// A text column.
    Text,
    /// An integer checksum that must travel as a string: it can exceed
    /// 53-bit precision on receiving platforms.
    Checksum,
}

use ColumnKind::{Checksum, Integer, Text};

/// Descriptor for one sync-relevant table.
#[derive(Debug)]
pub struct TableSchema {
    /// Which logical table this describes.
    pub kind: TableKind,
    /// SQL table name.
    pub name: &'static str,
    /// Columns in storage order with their serialization kinds.
    pub columns: &'static [(&'static str, ColumnKind)],
    /// Index of the row modification-time column, if the table has one.
    pub mod_idx: Option<usize>,
    /// Index of the USN column.
    pub usn_idx: usize,
}

impl TableSchema {
    /// The primary-key column (always stored first).
    pub fn pk_column(&self) -> &'static str {
        self.columns[0].0
    }

    /// Comma-joined column list for SELECT/INSERT statements.
    pub fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Placeholder list matching [`column_list`](Self::column_list).
    pub fn placeholders(&self) -> String {
        vec!["?"; self.columns.len()].join(", ")
    }
}

static NOTES: TableSchema = TableSchema {
    kind: TableKind::Notes,
    name: "notes",
    columns: &[
        ("id", Integer),
        ("guid", Text),
        ("mid", Integer),
        ("mod", Integer),
        ("usn", Integer),
        ("tags", Text),
        ("flds", Text),
        ("sfld", Text),
        ("csum", Checksum),
        ("flags", Integer),
        ("data", Text),
    ],
    mod_idx: Some(3),
    usn_idx: 4,
};

static CARDS: TableSchema = TableSchema {
    kind: TableKind::Cards,
    name: "cards",
    columns: &[
        ("id", Integer),
        ("nid", Integer),
        ("did", Integer),
        ("ord", Integer),
        ("mod", Integer),
        ("usn", Integer),
        ("type", Integer),
        ("queue", Integer),
        ("due", Integer),
        ("ivl", Integer),
        ("factor", Integer),
        ("reps", Integer),
        ("lapses", Integer),
        ("left", Integer),
        ("odue", Integer),
        ("odid", Integer),
        ("flags", Integer),
        ("data", Text),
    ],
    mod_idx: Some(4),
    usn_idx: 5,
};

static REVLOG: TableSchema = TableSchema {
    kind: TableKind::Revlog,
    name: "revlog",
    columns: &[
        ("id", Integer),
        ("cid", Integer),
        ("usn", Integer),
        ("ease", Integer),
        ("ivl", Integer),
        ("lastIvl", Integer),
        ("factor", Integer),
        ("time", Integer),
        ("type", Integer),
    ],
    mod_idx: None,
    usn_idx: 2,
};

static DECKS: TableSchema = TableSchema {
    kind: TableKind::Decks,
    name: "decks",
    columns: &[
        ("id", Integer),
        ("name", Text),
        ("mtime_secs", Integer),
        ("usn", Integer),
        ("common", Text),
        ("kind", Text),
    ],
    mod_idx: Some(2),
    usn_idx: 3,
};

static DECK_CONFIGS: TableSchema = TableSchema {
    kind: TableKind::DeckConfigs,
    name: "deck_config",
    columns: &[
        ("id", Integer),
        ("name", Text),
        ("mtime_secs", Integer),
        ("usn", Integer),
        ("config", Text),
    ],
    mod_idx: Some(2),
    usn_idx: 3,
};

static NOTETYPES: TableSchema = TableSchema {
    kind: TableKind::Notetypes,
    name: "notetypes",
    columns: &[
        ("id", Integer),
        ("name", Text),
        ("mtime_secs", Integer),
        ("usn", Integer),
        ("config", Text),
    ],
    mod_idx: Some(2),
    usn_idx: 3,
};

static TAGS: TableSchema = TableSchema {
    kind: TableKind::Tags,
    name: "tags",
    columns: &[
        ("tag", Text),
        ("usn", Integer),
        ("collapsed", Integer),
        ("config", Text),
    ],
    mod_idx: None,
    usn_idx: 1,
};

// V14-V16 tags carry only the name and usn.
static TAGS_LEGACY: TableSchema = TableSchema {
    kind: TableKind::Tags,
    name: "tags",
    columns: &[("tag", Text), ("usn", Integer)],
    mod_idx: None,
    usn_idx: 1,
};

static CONFIG: TableSchema = TableSchema {
    kind: TableKind::Config,
    name: "config",
    columns: &[
        ("key", Text),
        ("usn", Integer),
        ("mtime_secs", Integer),
        ("val", Text),
    ],
    mod_idx: Some(2),
    usn_idx: 1,
};

/// Looks up the descriptor for `kind` at `version`.
///
/// Returns `None` when the table does not exist at that version.
pub fn descriptor(version: SchemaVersion, kind: TableKind) -> Option<&'static TableSchema> {
    use SchemaVersion as V;
    match kind {
        TableKind::Notes => Some(&NOTES),
        TableKind::Cards => Some(&CARDS),
        TableKind::Revlog => Some(&REVLOG),
        TableKind::Decks => (version >= V::V15).then_some(&DECKS),
        TableKind::DeckConfigs => (version >= V::V14).then_some(&DECK_CONFIGS),
        TableKind::Notetypes => (version >= V::V15).then_some(&NOTETYPES),
        TableKind::Tags => match version {
            V::V11 => None,
            V::V14 | V::V15 => Some(&TAGS_LEGACY),
            V::V17 | V::V18 => Some(&TAGS),
        },
        TableKind::Config => (version >= V::V14).then_some(&CONFIG),
    }
}

/// Converts a fetched SQL row into its wire tuple, applying the
/// field-type rules.
pub fn row_from_sql(schema: &TableSchema, row: &rusqlite::Row<'_>) -> CoreResult<Row> {
    let mut out = Vec::with_capacity(schema.columns.len());
    for (idx, (_, kind)) in schema.columns.iter().enumerate() {
        let value = match (*kind, row.get_ref(idx)?) {
            (Integer, ValueRef::Integer(i)) => Value::from(i),
            (Integer, ValueRef::Real(f)) => Value::from(f as i64),
            (Integer, ValueRef::Text(t)) => {
                // mod columns have historically been stored as strings by
                // some clients.
                Value::from(
                    std::str::from_utf8(t)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .unwrap_or(0),
                )
            }
            (Integer, _) => Value::from(0),
            (Checksum, ValueRef::Integer(i)) => Value::from(i.to_string()),
            (Checksum, ValueRef::Text(t)) => {
                Value::from(String::from_utf8_lossy(t).into_owned())
            }
            (Checksum, _) => Value::from(""),
            (Text, ValueRef::Text(t)) => Value::from(String::from_utf8_lossy(t).into_owned()),
            (Text, ValueRef::Integer(i)) => Value::from(i.to_string()),
            (Text, ValueRef::Blob(b)) => Value::from(String::from_utf8_lossy(b).into_owned()),
            (Text, _) => Value::from(""),
        };
        out.push(value);
    }
    Ok(out)
}

/// Converts a wire tuple into SQL parameter values for `schema`.
///
/// Lenient on the inbound side: numbers arriving as strings are parsed,
/// nulls collapse to the column's zero value. A wrong tuple length is a
/// hard error.
pub fn row_to_sql(schema: &TableSchema, row: &Row) -> CoreResult<Vec<SqlValue>> {
    if row.len() != schema.columns.len() {
        return Err(CoreError::InvalidData(format!(
            "{} row has {} fields, expected {}",
            schema.name,
            row.len(),
            schema.columns.len()
        )));
    }
    let mut out = Vec::with_capacity(row.len());
    for ((_, kind), value) in schema.columns.iter().zip(row) {
        let sql = match *kind {
            Integer => SqlValue::Integer(json_to_i64(value).unwrap_or(0)),
            Checksum => match json_to_i64(value) {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Text(json_to_string(value)),
            },
            Text => SqlValue::Text(json_to_string(value)),
        };
        out.push(sql);
    }
    Ok(out)
}

/// Reads the USN field of a wire tuple.
pub fn row_usn(schema: &TableSchema, row: &Row) -> Option<i64> {
    row.get(schema.usn_idx).and_then(json_to_i64)
}

/// Reads the `mod` field of a wire tuple, when the table has one.
pub fn row_mod(schema: &TableSchema, row: &Row) -> Option<i64> {
    schema
        .mod_idx
        .and_then(|idx| row.get(idx))
        .and_then(json_to_i64)
}

/// Reads the primary-key field of a wire tuple as a SQL value.
pub fn row_pk(schema: &TableSchema, row: &Row) -> CoreResult<SqlValue> {
    let value = row
        .first()
        .ok_or_else(|| CoreError::InvalidData(format!("empty {} row", schema.name)))?;
    Ok(match schema.columns[0].1 {
        Integer | Checksum => SqlValue::Integer(json_to_i64(value).ok_or_else(|| {
            CoreError::InvalidData(format!("non-integer {} primary key", schema.name))
        })?),
        Text => SqlValue::Text(json_to_string(value)),
    })
}

fn json_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn version_markers() {
        assert!(SchemaVersion::from_marker(9).is_err());
        assert_eq!(SchemaVersion::from_marker(11).unwrap(), SchemaVersion::V11);
        assert_eq!(SchemaVersion::from_marker(16).unwrap(), SchemaVersion::V15);
        assert_eq!(SchemaVersion::from_marker(18).unwrap(), SchemaVersion::V18);
        // Unknown future versions degrade instead of refusing.
        assert_eq!(SchemaVersion::from_marker(23).unwrap(), SchemaVersion::V18);
    }

    #[test]
    fn v11_exposes_conservative_subset() {
        let tables = SchemaVersion::V11.sync_tables();
        assert_eq!(
            tables,
            vec![TableKind::Notes, TableKind::Cards, TableKind::Revlog]
        );
    }

    #[test]
    fn v18_exposes_all_tables() {
        assert_eq!(SchemaVersion::V18.sync_tables().len(), 8);
    }

    #[test]
    fn tags_columns_differ_by_version() {
        let legacy = descriptor(SchemaVersion::V14, TableKind::Tags).unwrap();
        let modern = descriptor(SchemaVersion::V18, TableKind::Tags).unwrap();
        assert_eq!(legacy.columns.len(), 2);
        assert_eq!(modern.columns.len(), 4);
    }

    #[test]
    fn checksum_round_trips_as_string() {
        let row = vec![
            json!(1),
            json!("guid"),
            json!(2),
            json!(3),
            json!(-1),
            json!(""),
            json!("front\u{1f}back"),
            json!("front"),
            json!("123456789012345678"),
            json!(0),
            json!(""),
        ];
        let sql = row_to_sql(&NOTES, &row).unwrap();
        // Too large for an exact f64, but fits i64 and must stay intact.
        assert_eq!(sql[8], SqlValue::Integer(123456789012345678));
    }

    #[test]
    fn row_length_mismatch_rejected() {
        let row = vec![json!(1), json!(2)];
        assert!(row_to_sql(&CARDS, &row).is_err());
    }

    #[test]
    fn usn_and_mod_extraction() {
        let mut row: Row = (0..18).map(|i| json!(i)).collect();
        row[5] = json!(-1);
        assert_eq!(row_usn(&CARDS, &row), Some(-1));
        assert_eq!(row_mod(&CARDS, &row), Some(4));
        assert_eq!(row_mod(&REVLOG, &row[..9].to_vec()), None);
    }
}
