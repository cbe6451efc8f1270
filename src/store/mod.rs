//! Per-address record persistence: the [`RecordStore`] trait and its
//! directory-backed and SQLite implementations.
use async_trait::async_trait;
use serde_json::{Map, Value};

/// A persisted per-address record: sub-key → amount.
///
/// Written whole on every write; never merged.
pub type Record = Map<String, Value>;

/// What came back from a read.
///
/// Reads are best-effort: content that is not valid JSON is returned raw
/// instead of failing.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordContent {
    /// Content parsed as structured JSON.
    Parsed(Value),
    /// Content that failed to parse.
    Raw(String),
}

impl RecordContent {
    /// Parse `text`, falling back to [`RecordContent::Raw`].
    pub fn from_text(text: String) -> Self {
        match serde_json::from_str(&text) {
            Ok(v) => Self::Parsed(v),
            Err(_) => Self::Raw(text),
        }
    }

    /// Sum every integer-like sub-value. Non-numeric entries and raw
    /// content contribute nothing.
    pub fn numeric_sum(&self) -> i64 {
        let values: Box<dyn Iterator<Item = &Value> + '_> = match self {
            Self::Parsed(Value::Object(map)) => Box::new(map.values()),
            Self::Parsed(Value::Array(items)) => Box::new(items.iter()),
            _ => return 0,
        };
        values
            .filter_map(integer_value)
            .fold(0i64, |acc, v| acc.saturating_add(v))
    }
}

/// Integer reading of a record sub-value: JSON numbers are truncated,
/// strings are read up to the first non-digit (`"12abc"` → 12).
fn integer_value(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite())
                    .map(|f| f.trunc() as i64)
            }),
        Value::String(s) => leading_integer(s),
        _ => None,
    }
}

fn leading_integer(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (neg, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let magnitude: i64 = digits[..end].parse().ok()?;
    Some(if neg { -magnitude } else { magnitude })
}

/// Named-record persistence used by fixture bootstrap.
///
/// Names are address strings. No ordering guarantees hold across keys;
/// every I/O failure is returned to the caller.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Names of all visible records (hidden names excluded), sorted.
    async fn list(&self) -> anyhow::Result<Vec<String>>;

    /// Read a record; unparsable content degrades to [`RecordContent::Raw`].
    async fn read(&self, name: &str) -> anyhow::Result<RecordContent>;

    /// Create or fully overwrite a record.
    async fn write(&self, name: &str, record: &Record) -> anyhow::Result<()>;

    /// Remove a record.
    async fn delete(&self, name: &str) -> anyhow::Result<()>;
}

// submodules / concrete stores live here
pub mod file_store;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;

pub use file_store::FileStore;
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;
