use std::collections::BTreeMap;

/// A view row: attribute name to its string value.
///
/// Attributes are kept sorted by name so that two rows with the same content always compare
/// and render the same way.
pub type Row = BTreeMap<String, String>;

/// A change to a single row of a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub key: String,
    /// New value of the row, [`None`] when the row was removed.
    pub value: Option<Row>,
}

impl RowChange {
    pub fn upsert(key: impl Into<String>, row: Row) -> Self {
        Self {
            key: key.into(),
            value: Some(row),
        }
    }

    pub fn tombstone(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

/// An immutable copy of a view at one point in time.
///
/// Rows are ordered by first insertion into the view, which makes snapshots of the same view
/// state identical.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewSnapshot {
    rows: Vec<(String, Row)>,
}

impl ViewSnapshot {
    pub fn new(rows: Vec<(String, Row)>) -> Self {
        Self { rows }
    }

    /// Returns the rows with their keys, in view order.
    pub fn rows(&self) -> &[(String, Row)] {
        &self.rows
    }

    /// Returns the row stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Row> {
        self.rows
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, row)| row)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|(key, _)| key.as_str())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
