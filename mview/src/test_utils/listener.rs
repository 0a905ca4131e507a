use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

use crate::provider::{ItemListener, ItemUpdate};
use crate::test_utils::wait::DEFAULT_WAIT_TIMEOUT;

/// An [`ItemListener`] keeping every update it receives, per item.
#[derive(Clone, Default)]
pub struct RecordingListener {
    updates: Arc<Mutex<HashMap<String, Vec<ItemUpdate>>>>,
    notify: Arc<Notify>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every update received by `item` so far.
    pub fn updates(&self, item: &str) -> Vec<ItemUpdate> {
        self.updates
            .lock()
            .unwrap()
            .get(item)
            .cloned()
            .unwrap_or_default()
    }

    /// Waits until `item` received at least `count` updates and returns all of them.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `count` updates are received within [`DEFAULT_WAIT_TIMEOUT`].
    pub async fn wait_for_updates(&self, item: &str, count: usize) -> Vec<ItemUpdate> {
        self.wait_for_updates_with_timeout(item, count, DEFAULT_WAIT_TIMEOUT)
            .await
    }

    pub async fn wait_for_updates_with_timeout(
        &self,
        item: &str,
        count: usize,
        timeout_duration: Duration,
    ) -> Vec<ItemUpdate> {
        let received = async {
            loop {
                let notified = self.notify.notified();
                let updates = self.updates(item);
                if updates.len() >= count {
                    return updates;
                }
                notified.await;
            }
        };

        match timeout(timeout_duration, received).await {
            Ok(updates) => updates,
            Err(_) => panic!(
                "Item `{item}` received {} of {count} expected updates within {timeout_duration:?}.",
                self.updates(item).len()
            ),
        }
    }
}

impl ItemListener for RecordingListener {
    fn on_update(&self, item: &str, update: ItemUpdate) {
        self.updates
            .lock()
            .unwrap()
            .entry(item.to_owned())
            .or_default()
            .push(update);
        self.notify.notify_waiters();
    }
}

impl fmt::Debug for RecordingListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingListener").finish_non_exhaustive()
    }
}
