use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use tokio::sync::Mutex;

use crate::metrics::{MVIEW_CHANGES_APPLIED_TOTAL, MVIEW_VIEW_ROWS, TABLE_LABEL};
use crate::types::{Row, RowChange, ViewSnapshot};

/// Receiver of the snapshots a [`TableView`] publishes.
pub trait ViewSink: Send + Sync {
    /// Publishes a new snapshot of the view. Called with the view locked.
    fn publish(&self, snapshot: ViewSnapshot);
}

/// Rows of a view in insertion order.
///
/// Removed rows leave a hole in `slots` that is reclaimed once holes make up half of the
/// slots.
#[derive(Debug, Default)]
struct Rows {
    slots: Vec<Option<(String, Row)>>,
    index: HashMap<String, usize>,
}

impl Rows {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn upsert(&mut self, key: String, row: Row) {
        match self.index.get(&key) {
            Some(&slot) => self.slots[slot] = Some((key, row)),
            None => {
                self.index.insert(key.clone(), self.slots.len());
                self.slots.push(Some((key, row)));
            }
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(slot) = self.index.remove(key) {
            self.slots[slot] = None;
        }

        if self.slots.len() >= 2 * self.index.len().max(1) {
            self.compact();
        }
    }

    fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        for (slot, (key, _)) in self.slots.iter().flatten().enumerate() {
            self.index.insert(key.clone(), slot);
        }
    }

    fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::new(self.slots.iter().flatten().cloned().collect())
    }
}

/// The authoritative rows of one table view.
///
/// Every mutation locks the view, applies the change and publishes a full copy of the rows to
/// the sink before unlocking, so published snapshots follow the order changes were applied in.
#[derive(Debug)]
pub struct TableView<S> {
    table: Arc<str>,
    rows: Mutex<Rows>,
    sink: S,
}

impl<S> TableView<S>
where
    S: ViewSink,
{
    /// Creates an empty view of `table` publishing to `sink`.
    pub fn new(table: impl Into<Arc<str>>, sink: S) -> Self {
        Self {
            table: table.into(),
            rows: Mutex::new(Rows::default()),
            sink,
        }
    }

    /// Replaces the content of the view with `rows` and publishes it.
    ///
    /// A key appearing more than once keeps its first position and its last row.
    pub async fn load(&self, rows: impl IntoIterator<Item = (String, Row)>) {
        let mut guard = self.rows.lock().await;

        let mut loaded = Rows::default();
        for (key, row) in rows {
            loaded.upsert(key, row);
        }
        *guard = loaded;

        self.publish(&guard);
    }

    /// Applies `change` and publishes the resulting view.
    pub async fn apply(&self, change: RowChange) {
        let mut guard = self.rows.lock().await;

        match change.value {
            Some(row) => guard.upsert(change.key, row),
            None => guard.remove(&change.key),
        }
        counter!(MVIEW_CHANGES_APPLIED_TOTAL, TABLE_LABEL => self.table.to_string()).increment(1);

        self.publish(&guard);
    }

    /// Returns a copy of the current rows.
    pub async fn snapshot(&self) -> ViewSnapshot {
        self.rows.lock().await.snapshot()
    }

    fn publish(&self, rows: &Rows) {
        gauge!(MVIEW_VIEW_ROWS, TABLE_LABEL => self.table.to_string()).set(rows.len() as f64);
        self.sink.publish(rows.snapshot());
    }
}
