//! Streaming units: chunks, grave bundles and the sanity vector.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A serialized table row: an opaque tuple of JSON values.
///
/// The column layout is owned by the schema compatibility layer; the
/// protocol only guarantees the field-type rules (checksums and grave ids
/// as strings, all other integers as integers).
pub type Row = Vec<serde_json::Value>;

/// The tables the sync engine exchanges, in the stable enumeration order.
///
/// Notes, cards and the revision log stream through `chunk`/`applyChunk`;
/// the small-object tables travel in the `applyChanges` bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableKind {
    /// The notes table.
    Notes,
    /// The cards table.
    Cards,
    /// The review log.
    Revlog,
    /// Decks.
    Decks,
    /// Deck configurations.
    DeckConfigs,
    /// Note types.
    Notetypes,
    /// Tags.
    Tags,
    /// The key/value config table.
    Config,
}

impl TableKind {
    /// All tables in the stable enumeration order.
    pub const ALL: [TableKind; 8] = [
        TableKind::Notes,
        TableKind::Cards,
        TableKind::Revlog,
        TableKind::Decks,
        TableKind::DeckConfigs,
        TableKind::Notetypes,
        TableKind::Tags,
        TableKind::Config,
    ];

    /// The tables streamed through `chunk`/`applyChunk`.
    pub const STREAMED: [TableKind; 3] = [TableKind::Notes, TableKind::Cards, TableKind::Revlog];

    /// The tables bundled into `applyChanges`.
    pub const BUNDLED: [TableKind; 4] = [
        TableKind::Decks,
        TableKind::DeckConfigs,
        TableKind::Notetypes,
        TableKind::Tags,
    ];

    /// The wire name of this table.
    pub fn wire_name(self) -> &'static str {
        match self {
            TableKind::Notes => "notes",
            TableKind::Cards => "cards",
            TableKind::Revlog => "revlog",
            TableKind::Decks => "decks",
            TableKind::DeckConfigs => "deck_configs",
            TableKind::Notetypes => "notetypes",
            TableKind::Tags => "tags",
            TableKind::Config => "config",
        }
    }

    /// Resolves a wire name back to a table.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.wire_name() == name)
    }
}

/// One streamed batch of rows.
///
/// The sender sets `done` on its final chunk; the exchange in one direction
/// ends there. Table names absent from `tables` simply had nothing left.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chunk {
    /// True on the sender's last chunk.
    pub done: bool,
    /// Rows grouped by wire table name, in the stable enumeration order.
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<Row>>,
}

impl Chunk {
    /// A terminal chunk carrying no rows.
    pub fn finished() -> Self {
        Chunk {
            done: true,
            tables: BTreeMap::new(),
        }
    }

    /// Total number of rows across all tables.
    pub fn row_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

/// The kind of object a grave tombstones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraveKind {
    /// A card.
    Card,
    /// A note.
    Note,
    /// A deck.
    Deck,
}

impl GraveKind {
    /// Numeric code stored in the graves table.
    pub fn code(self) -> i64 {
        match self {
            GraveKind::Card => 0,
            GraveKind::Note => 1,
            GraveKind::Deck => 2,
        }
    }

    /// Resolves a stored numeric code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(GraveKind::Card),
            1 => Some(GraveKind::Note),
            2 => Some(GraveKind::Deck),
            _ => None,
        }
    }
}

/// Deletion tombstones grouped by object kind.
///
/// Object ids travel as strings: they are 64-bit values that would lose
/// precision in JSON implementations capped at 53-bit integers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graves {
    /// Deleted card ids.
    #[serde(default)]
    pub cards: Vec<String>,
    /// Deleted note ids.
    #[serde(default)]
    pub notes: Vec<String>,
    /// Deleted deck ids.
    #[serde(default)]
    pub decks: Vec<String>,
}

impl Graves {
    /// True when no tombstones are present.
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty() && self.notes.is_empty() && self.decks.is_empty()
    }

    /// Total number of tombstones.
    pub fn len(&self) -> usize {
        self.cards.len() + self.notes.len() + self.decks.len()
    }

    /// Iterates `(kind, id)` pairs, skipping ids that fail to parse.
    pub fn entries(&self) -> impl Iterator<Item = (GraveKind, i64)> + '_ {
        let parse = |ids: &[String], kind: GraveKind| {
            ids.iter()
                .filter_map(|s| s.parse::<i64>().ok())
                .map(move |id| (kind, id))
                .collect::<Vec<_>>()
        };
        parse(&self.cards, GraveKind::Card)
            .into_iter()
            .chain(parse(&self.notes, GraveKind::Note))
            .chain(parse(&self.decks, GraveKind::Deck))
    }

    /// Appends one tombstone.
    pub fn push(&mut self, kind: GraveKind, id: i64) {
        let bucket = match kind {
            GraveKind::Card => &mut self.cards,
            GraveKind::Note => &mut self.notes,
            GraveKind::Deck => &mut self.decks,
        };
        bucket.push(id.to_string());
    }
}

/// The small-object bundle exchanged through `applyChanges`.
///
/// The config blob and collection creation time only travel in the
/// direction of the side with the newer collection `mod`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Changes {
    /// Deck rows.
    #[serde(default)]
    pub decks: Vec<Row>,
    /// Deck-config rows.
    #[serde(default, rename = "deckConfigs")]
    pub deck_configs: Vec<Row>,
    /// Note-type rows.
    #[serde(default)]
    pub notetypes: Vec<Row>,
    /// Tag rows.
    #[serde(default)]
    pub tags: Vec<Row>,
    /// The collection config blob, present only from the newer side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Map<String, serde_json::Value>>,
    /// Collection creation timestamp, present only from the newer side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crt: Option<i64>,
}

/// The post-merge sanity digest: a fixed-order vector of table counts.
///
/// Order: notes, cards, revlog, graves, decks, deck-configs, note-types,
/// tags, config entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanityVec(pub [i64; 9]);
