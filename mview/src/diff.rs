//! Row-level deltas between consecutive views.
//!
//! Stateful subscribers do not want a full copy of the view on every change. A
//! [`DiffPublisher`] remembers the last view it saw and turns every new one into row commands,
//! matching rows by a business key attribute rather than by their table key.

use std::collections::HashMap;
use std::fmt;

use tracing::warn;

use crate::types::{Row, ViewSnapshot};

/// Field carrying the business key in rendered row commands.
pub const KEY_FIELD: &str = "key";

/// Field carrying the command name in rendered row commands.
pub const COMMAND_FIELD: &str = "command";

/// Kind of change applied to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowCommand {
    Add,
    Update,
    Delete,
}

impl RowCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowCommand::Add => "ADD",
            RowCommand::Update => "UPDATE",
            RowCommand::Delete => "DELETE",
        }
    }
}

impl fmt::Display for RowCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One update produced by a [`DiffPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffUpdate {
    /// A row was added, changed or removed.
    Row {
        command: RowCommand,
        key: String,
        /// The new content of the row, [`None`] for deletions.
        row: Option<Row>,
        /// Set for the rows of the first view, which form the initial snapshot.
        is_snapshot: bool,
    },
    /// Every previously known row is gone.
    ClearSnapshot,
    /// The initial snapshot has been fully sent.
    EndOfSnapshot,
}

impl DiffUpdate {
    /// Renders a row update as a flat field map, the row's attributes plus the business key
    /// and the command.
    ///
    /// Returns [`None`] for snapshot markers.
    pub fn fields(&self) -> Option<Row> {
        let DiffUpdate::Row {
            command, key, row, ..
        } = self
        else {
            return None;
        };

        let mut fields = row.clone().unwrap_or_default();
        fields.insert(KEY_FIELD.to_owned(), key.clone());
        fields.insert(COMMAND_FIELD.to_owned(), command.as_str().to_owned());

        Some(fields)
    }
}

/// Computes the row commands turning one view into the next.
#[derive(Debug, Clone)]
pub struct DiffPublisher {
    business_key: String,
    previous: Option<ViewSnapshot>,
}

impl DiffPublisher {
    /// Creates a publisher matching rows on their `business_key` attribute.
    pub fn new(business_key: impl Into<String>) -> Self {
        Self {
            business_key: business_key.into(),
            previous: None,
        }
    }

    /// Returns the updates leading from the previously seen view to `next`, and remembers
    /// `next`.
    ///
    /// The first view is sent in full as a snapshot, followed by
    /// [`DiffUpdate::EndOfSnapshot`]. When none of the previously known rows survive, a single
    /// [`DiffUpdate::ClearSnapshot`] replaces their deletions. Rows without the business key
    /// are ignored.
    pub fn diff(&mut self, next: &ViewSnapshot) -> Vec<DiffUpdate> {
        let is_snapshot = self.previous.is_none();
        let old = self
            .previous
            .as_ref()
            .map(|previous| self.index(previous))
            .unwrap_or_default();
        let new = self.index(next);

        let mut updates = Vec::new();

        let removed: Vec<&str> = old
            .order
            .iter()
            .copied()
            .filter(|key| !new.rows.contains_key(key))
            .collect();
        if !old.order.is_empty() && removed.len() == old.order.len() {
            updates.push(DiffUpdate::ClearSnapshot);
        } else {
            updates.extend(removed.into_iter().map(|key| DiffUpdate::Row {
                command: RowCommand::Delete,
                key: key.to_owned(),
                row: None,
                is_snapshot,
            }));
        }

        for key in &new.order {
            let row = new.rows[key];
            let command = match old.rows.get(key) {
                None => RowCommand::Add,
                Some(&previous) if previous != row => RowCommand::Update,
                Some(_) => continue,
            };

            updates.push(DiffUpdate::Row {
                command,
                key: (*key).to_owned(),
                row: Some(row.clone()),
                is_snapshot,
            });
        }

        if is_snapshot {
            updates.push(DiffUpdate::EndOfSnapshot);
        }

        self.previous = Some(next.clone());

        updates
    }

    fn index<'a>(&self, view: &'a ViewSnapshot) -> RowIndex<'a> {
        let mut index = RowIndex::default();

        for (row_key, row) in view.rows() {
            let Some(key) = row.get(&self.business_key) else {
                warn!(row_key = %row_key, business_key = %self.business_key, "row has no business key, skipping it");
                continue;
            };

            if index.rows.insert(key.as_str(), row).is_none() {
                index.order.push(key.as_str());
            }
        }

        index
    }
}

/// Rows of a view by business key.
#[derive(Debug, Default)]
struct RowIndex<'a> {
    order: Vec<&'a str>,
    rows: HashMap<&'a str, &'a Row>,
}
