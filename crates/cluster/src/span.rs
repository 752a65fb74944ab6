use serde::{Deserialize, Serialize};
use std::fmt;

/// A raw key in the global keyspace.
pub type Key = Vec<u8>;

/// A half-open key interval `[key, end_key)` over the global keyspace.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    /// Inclusive start key.
    pub key: Key,
    /// Exclusive end key.
    pub end_key: Key,
}

impl Span {
    /// Builds a span from start/end byte keys.
    pub fn new(key: impl Into<Key>, end_key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            end_key: end_key.into(),
        }
    }

    /// Whether `key` falls inside this span.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.key.as_slice() <= key && key < self.end_key.as_slice()
    }

    /// Whether `other` is fully contained in this span.
    pub fn contains(&self, other: &Span) -> bool {
        self.key <= other.key && other.end_key <= self.end_key
    }

    /// Whether the two spans share at least one key.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.key < other.end_key && other.key < self.end_key
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", fmt_key(&self.key), fmt_key(&self.end_key))
    }
}

fn fmt_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => format!("\"{s}\""),
        _ => key.iter().map(|b| format!("{b:02x}")).collect(),
    }
}
