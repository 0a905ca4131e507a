//! Per-item subscriptions on top of a view hub.
//!
//! Push adapters address data by item name. A [`ViewProvider`] binds item names to one hub and
//! forwards every view it publishes to an [`ItemListener`], in the shape chosen by its
//! [`ItemMode`]. Each subscribed item is served by its own task, so a slow item never delays
//! another one.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span};

use crate::diff::{DiffPublisher, DiffUpdate};
use crate::hub::{BroadcastHub, Subscription};
use crate::types::{Row, ViewSnapshot};

/// How views are delivered to an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemMode {
    /// Every view is forwarded in full.
    Snapshot,
    /// Every view is flattened into a single field map, one field per row, named after the
    /// row's `key_attribute` and holding its `value_attribute`.
    KeyValue {
        key_attribute: String,
        value_attribute: String,
    },
    /// Views are turned into row commands matched on `business_key`.
    Diff { business_key: String },
}

/// Update delivered to an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemUpdate {
    View(Arc<ViewSnapshot>),
    Fields(Row),
    Diff(DiffUpdate),
}

/// Receives the updates of subscribed items.
pub trait ItemListener: Send + Sync + 'static {
    fn on_update(&self, item: &str, update: ItemUpdate);
}

/// Serves items from the views of one hub.
pub struct ViewProvider<L> {
    hub: BroadcastHub<ViewSnapshot>,
    mode: ItemMode,
    listener: Arc<L>,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl<L> ViewProvider<L>
where
    L: ItemListener,
{
    pub fn new(hub: BroadcastHub<ViewSnapshot>, mode: ItemMode, listener: L) -> Self {
        Self {
            hub,
            mode,
            listener: Arc::new(listener),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` when items start with a snapshot that is explicitly terminated.
    pub fn is_snapshot_available(&self) -> bool {
        matches!(self.mode, ItemMode::Diff { .. })
    }

    /// Starts delivering views to `item`.
    ///
    /// Subscribing an item that is already subscribed replaces its previous subscription. Must
    /// be called from within a tokio runtime.
    pub fn subscribe(&self, item: impl Into<String>) {
        let item = item.into();
        let subscription = self.hub.subscribe();

        let span = info_span!("item_subscription", hub = %self.hub.name(), item = %item);
        let task = serve_item(
            item.clone(),
            self.mode.clone(),
            subscription,
            self.listener.clone(),
        );
        let handle = tokio::spawn(task.instrument(span));

        let previous = self.lock().insert(item.clone(), handle);
        if let Some(previous) = previous {
            previous.abort();
            debug!(item = %item, "replaced existing item subscription");
        }

        info!(hub = %self.hub.name(), item = %item, "item subscribed");
    }

    /// Stops delivering views to `item`. Unknown items are ignored.
    pub fn unsubscribe(&self, item: &str) {
        if let Some(handle) = self.lock().remove(item) {
            handle.abort();
            info!(hub = %self.hub.name(), item, "item unsubscribed");
        }
    }

    /// Returns the names of the currently subscribed items.
    pub fn items(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<L> Drop for ViewProvider<L> {
    fn drop(&mut self) {
        let subscriptions = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        for (_, handle) in subscriptions.drain() {
            handle.abort();
        }
    }
}

async fn serve_item<L>(
    item: String,
    mode: ItemMode,
    subscription: Subscription<ViewSnapshot>,
    listener: Arc<L>,
) where
    L: ItemListener,
{
    let mut diff = match &mode {
        ItemMode::Diff { business_key } => Some(DiffPublisher::new(business_key.as_str())),
        _ => None,
    };

    let mut views = pin!(subscription.into_stream());
    while let Some(view) = views.next().await {
        match (&mode, diff.as_mut()) {
            (ItemMode::Diff { .. }, Some(publisher)) => {
                for update in publisher.diff(&view) {
                    listener.on_update(&item, ItemUpdate::Diff(update));
                }
            }
            (
                ItemMode::KeyValue {
                    key_attribute,
                    value_attribute,
                },
                _,
            ) => {
                let fields = key_values(&view, key_attribute, value_attribute);
                listener.on_update(&item, ItemUpdate::Fields(fields));
            }
            _ => listener.on_update(&item, ItemUpdate::View(view)),
        }
    }
}

/// Flattens `view` into `key_attribute -> value_attribute` fields, skipping rows lacking
/// either attribute.
fn key_values(view: &ViewSnapshot, key_attribute: &str, value_attribute: &str) -> Row {
    view.rows()
        .iter()
        .filter_map(|(_, row)| {
            let key = row.get(key_attribute)?;
            let value = row.get(value_attribute)?;
            Some((key.clone(), value.clone()))
        })
        .collect()
}
