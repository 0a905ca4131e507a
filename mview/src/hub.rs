//! Conflating broadcast of a pipeline's latest value.
//!
//! A [`BroadcastHub`] runs a pipeline only while it has subscribers. The pipeline publishes
//! values through a [`Publisher`] and the hub keeps the latest one: every subscriber gets it
//! right away when subscribing, then every newer value it has not seen yet. A slow subscriber
//! skips intermediate values instead of slowing the pipeline down.
//!
//! When the last subscriber leaves, the pipeline is kept running for a grace period so that a
//! quick resubscription finds it warm. Once the grace period is over the pipeline is shut down
//! and its last value discarded.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::Stream;
use futures::future::BoxFuture;
use metrics::gauge;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span};

use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::metrics::{MVIEW_HUB_SUBSCRIBERS, TABLE_LABEL};
use crate::types::ViewSnapshot;
use crate::view::table::ViewSink;

/// Starts a pipeline publishing through the given [`Publisher`] until shutdown is signalled.
pub type PipelineFactory<T> =
    Arc<dyn Fn(Publisher<T>, ShutdownRx) -> BoxFuture<'static, ()> + Send + Sync>;

struct RunningPipeline {
    generation: u64,
    shutdown_tx: ShutdownTx,
    handle: JoinHandle<()>,
}

struct HubState<T> {
    latest: Option<Arc<T>>,
    /// Incremented on every accepted publish.
    version: u64,
    next_subscriber_id: u64,
    subscribers: HashMap<u64, Arc<Notify>>,
    /// Incremented every time a pipeline is started.
    generation: u64,
    pipeline: Option<RunningPipeline>,
    /// Pending teardown, waiting for the grace period to elapse.
    teardown: Option<JoinHandle<()>>,
}

struct HubShared<T> {
    name: String,
    grace: Duration,
    factory: PipelineFactory<T>,
    state: Mutex<HubState<T>>,
}

impl<T> HubShared<T> {
    fn lock(&self) -> MutexGuard<'_, HubState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shares one pipeline between any number of subscribers.
pub struct BroadcastHub<T> {
    shared: Arc<HubShared<T>>,
}

impl<T> Clone for BroadcastHub<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for BroadcastHub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("name", &self.shared.name)
            .field("grace", &self.shared.grace)
            .finish_non_exhaustive()
    }
}

impl<T> BroadcastHub<T>
where
    T: Send + Sync + 'static,
{
    /// Creates a hub named `name` starting pipelines with `factory`.
    ///
    /// No pipeline runs until the first subscription.
    pub fn new(name: impl Into<String>, grace: Duration, factory: PipelineFactory<T>) -> Self {
        let state = HubState {
            latest: None,
            version: 0,
            next_subscriber_id: 0,
            subscribers: HashMap::new(),
            generation: 0,
            pipeline: None,
            teardown: None,
        };

        Self {
            shared: Arc::new(HubShared {
                name: name.into(),
                grace,
                factory,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Attaches a new subscriber, starting the pipeline if it is not running.
    ///
    /// Cancels a pending teardown. Must be called from within a tokio runtime.
    pub fn subscribe(&self) -> Subscription<T> {
        let mut state = self.shared.lock();

        if let Some(teardown) = state.teardown.take() {
            teardown.abort();
            info!(hub = %self.shared.name, "subscriber arrived during grace period, pipeline kept");
        }

        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        let notify = Arc::new(Notify::new());
        state.subscribers.insert(id, notify.clone());
        gauge!(MVIEW_HUB_SUBSCRIBERS, TABLE_LABEL => self.shared.name.clone())
            .set(state.subscribers.len() as f64);

        if state.pipeline.is_none() {
            self.start_pipeline(&mut state);
        }

        Subscription {
            id,
            seen_version: 0,
            notify,
            shared: self.shared.clone(),
        }
    }

    /// Returns the latest published value, if the pipeline published one.
    pub fn latest(&self) -> Option<Arc<T>> {
        self.shared.lock().latest.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }

    /// Returns `true` while a pipeline is running, including during the grace period.
    pub fn is_running(&self) -> bool {
        self.shared.lock().pipeline.is_some()
    }

    fn start_pipeline(&self, state: &mut HubState<T>) {
        state.generation += 1;
        let generation = state.generation;

        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let publisher = Publisher {
            shared: Arc::downgrade(&self.shared),
            generation,
        };

        let span = info_span!("view_pipeline", hub = %self.shared.name, generation);
        let pipeline = (self.shared.factory)(publisher, shutdown_rx);
        let handle = tokio::spawn(pipeline.instrument(span));
        info!(hub = %self.shared.name, generation, "pipeline started");

        state.pipeline = Some(RunningPipeline {
            generation,
            shutdown_tx,
            handle,
        });
    }
}

/// Handle a pipeline publishes its values through.
///
/// Values published after the pipeline was torn down are ignored.
pub struct Publisher<T> {
    shared: Weak<HubShared<T>>,
    generation: u64,
}

impl<T> Publisher<T> {
    /// Makes `value` the latest value and wakes every subscriber.
    ///
    /// Returns `false` when the value was ignored because the pipeline is no longer current.
    pub fn publish(&self, value: T) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut state = shared.lock();

        let current = state
            .pipeline
            .as_ref()
            .is_some_and(|pipeline| pipeline.generation == self.generation);
        if !current {
            return false;
        }

        state.latest = Some(Arc::new(value));
        state.version += 1;
        for notify in state.subscribers.values() {
            notify.notify_one();
        }

        true
    }
}

impl<T> fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl ViewSink for Publisher<ViewSnapshot> {
    fn publish(&self, snapshot: ViewSnapshot) {
        Publisher::publish(self, snapshot);
    }
}

/// A subscriber of a [`BroadcastHub`].
///
/// Dropping the subscription detaches it from the hub.
pub struct Subscription<T>
where
    T: Send + Sync + 'static,
{
    id: u64,
    seen_version: u64,
    notify: Arc<Notify>,
    shared: Arc<HubShared<T>>,
}

impl<T> Subscription<T>
where
    T: Send + Sync + 'static,
{
    /// Waits for a value this subscription has not seen yet and returns the latest one.
    pub async fn next(&mut self) -> Arc<T> {
        loop {
            {
                let state = self.shared.lock();
                if state.version > self.seen_version
                    && let Some(latest) = &state.latest
                {
                    self.seen_version = state.version;
                    return latest.clone();
                }
            }

            self.notify.notified().await;
        }
    }

    /// Turns the subscription into an endless stream of values.
    pub fn into_stream(self) -> impl Stream<Item = Arc<T>> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            let value = subscription.next().await;
            Some((value, subscription))
        })
    }
}

impl<T> fmt::Debug for Subscription<T>
where
    T: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("seen_version", &self.seen_version)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for Subscription<T>
where
    T: Send + Sync + 'static,
{
    fn drop(&mut self) {
        let mut state = self.shared.lock();

        state.subscribers.remove(&self.id);
        gauge!(MVIEW_HUB_SUBSCRIBERS, TABLE_LABEL => self.shared.name.clone())
            .set(state.subscribers.len() as f64);

        if !state.subscribers.is_empty() || state.pipeline.is_none() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let shared = self.shared.clone();
                state.teardown = Some(runtime.spawn(teardown_after_grace(shared)));
            }
            Err(_) => {
                // Without a runtime there is nothing to wait on, stop right away.
                state.latest = None;
                if let Some(pipeline) = state.pipeline.take() {
                    pipeline.shutdown_tx.shutdown();
                    pipeline.handle.abort();
                }
            }
        }
    }
}

async fn teardown_after_grace<T>(shared: Arc<HubShared<T>>) {
    tokio::time::sleep(shared.grace).await;

    // From here on the teardown can no longer be cancelled by a new subscriber.
    let pipeline = {
        let mut state = shared.lock();
        if !state.subscribers.is_empty() {
            return;
        }

        state.teardown = None;
        state.latest = None;
        state.pipeline.take()
    };

    let Some(pipeline) = pipeline else {
        return;
    };

    info!(hub = %shared.name, generation = pipeline.generation, "grace period elapsed, stopping pipeline");
    pipeline.shutdown_tx.shutdown();

    if let Err(err) = pipeline.handle.await
        && err.is_panic()
    {
        error!(hub = %shared.name, error = %err, "pipeline panicked");
    }
}
