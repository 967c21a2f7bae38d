use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde_json::Map;
use serde_json::Value;
use std::fmt::Display;

/// Name of the column holding the unique identity of a row. Rows sharing a value in it are duplicates.
pub const KEY_COLUMN: &str = "key";

/// Wire value of [`NextCursor::Done`].
pub const DONE_CURSOR: &str = "done";

/// One rendered list row: column name to rendered value.
pub type Row = Map<String, Value>;

/// Persistent snapshot of one list+query combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub data_id:          String,
    /// Replaced wholesale on rebuild, never appended to.
    pub items:            Vec<Row>,
    pub valid_through:    Option<DateTime<Utc>>,
    pub is_processing:    bool,
    /// When the entry entered its current processing state.
    #[serde(default)]
    pub processing_since: Option<DateTime<Utc>>,
}

impl CachedEntry {
    /// A new entry with no items which is waiting for its first rebuild.
    pub fn seeded(data_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            data_id:          data_id.into(),
            items:            Vec::new(),
            valid_through:    None,
            is_processing:    true,
            processing_since: Some(now),
        }
    }

    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_through.is_some_and(|vt| vt > now)
    }
}

/// A record of the authoritative store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable, serializable key. Doubles as the resumption cursor of a range scan.
    pub key:         String,
    pub entity_type: String,
    #[serde(default)]
    pub fields:      Map<String, Value>,
}

impl Record {
    pub fn new(entity_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key:         key.into(),
            entity_type: entity_type.into(),
            fields:      Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Where the next page starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NextCursor {
    More(String),
    /// The "final batch" sentinel.
    Done,
}

impl NextCursor {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn as_start(&self) -> Option<&str> {
        match self {
            Self::More(cursor) => Some(cursor),
            Self::Done => None,
        }
    }
}

impl Display for NextCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::More(cursor) => write!(f, "{cursor}"),
            Self::Done => write!(f, "{DONE_CURSOR}"),
        }
    }
}

impl Serialize for NextCursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::More(cursor) => serializer.serialize_str(cursor),
            Self::Done => serializer.serialize_str(DONE_CURSOR),
        }
    }
}

impl<'de> Deserialize<'de> for NextCursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let cursor = String::deserialize(deserializer)?;
        Ok(if cursor == DONE_CURSOR {
            Self::Done
        }
        else {
            Self::More(cursor)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<Row>,
    pub next:  NextCursor,
}

impl Page {
    /// An empty final page.
    pub fn done() -> Self {
        Self {
            items: Vec::new(),
            next:  NextCursor::Done,
        }
    }
}

/// Which side answered a page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    Cache,
    Store,
}

/// Classification of a `data_id` at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Absent,
    Fresh,
    Stale,
    /// A rebuild is believed to be in flight. `abandoned` is set when it has been running for longer than the
    /// processing timeout allows.
    Processing { abandoned: bool },
}

/// How valid cached snapshots are paged out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePagination {
    /// `items[start..start + limit]` followed by the final batch sentinel, whatever remains in the snapshot.
    #[default]
    WholeSnapshot,
    /// Real pagination over the snapshot, continued by row key.
    Sliced,
}
