use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use serde_json::{ser::PrettyFormatter, Serializer, Value};

/// One extracted table row, keyed by column header in document order.
pub type Record = serde_json::Map<String, Value>;

/// Canonical serialization used for deduplication: keys sorted, so two
/// records with the same content always produce the same key regardless
/// of column order. Non-ASCII stays literal.
pub fn canonical_key(record: &Record) -> String {
    let sorted: BTreeMap<&String, &Value> = record.iter().collect();
    serde_json::to_string(&sorted).expect("a string-to-string map serializes")
}

/// Deduplicated, ordered accumulation of records across all visited pages.
#[derive(Default)]
pub struct ResultSet {
    records: Vec<Record>,
    seen: HashSet<String>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the record unless an identical one was seen before.
    /// Returns whether the record was new.
    pub fn insert(&mut self, record: Record) -> bool {
        match self.seen.insert(canonical_key(&record)) {
            true => {
                self.records.push(record);
                true
            }
            false => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Renders the accumulated records as a JSON array with 4-space
    /// indentation and non-ASCII characters preserved literally.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        let mut buf = Vec::new();
        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut serializer = Serializer::with_formatter(&mut buf, formatter);
        self.records.serialize(&mut serializer)?;

        Ok(String::from_utf8(buf).expect("serde_json emits utf-8"))
    }
}
