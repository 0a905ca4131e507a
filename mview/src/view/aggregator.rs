//! The pipeline maintaining the view of one table.
//!
//! A run loads the view from a full scan of the table, then follows the table's stream,
//! starting one [`ShardConsumer`] per active shard and applying every change they produce. Any
//! failure ends the run. [`ViewPipeline::run`] starts a new run from a fresh scan after a short
//! delay, until shutdown is requested.

use std::pin::pin;
use std::sync::Arc;

use config::shared::{PipelineConfig, TableViewConfig};
use futures::{StreamExt, TryStreamExt};
use metrics::counter;
use source::client::SourceClient;
use source::types::StreamId;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::bail;
use crate::concurrency::join::{collect_failures, flatten_join};
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, ViewResult};
use crate::metrics::{MVIEW_PIPELINE_RESTARTS_TOTAL, TABLE_LABEL};
use crate::replication::shard::ShardConsumer;
use crate::replication::shards::watch_active_shards;
use crate::replication::snapshot::read_table;
use crate::types::Row;
use crate::view::table::{TableView, ViewSink};

/// Maintains the view of one table, publishing every state of it to a [`ViewSink`].
#[derive(Debug, Clone)]
pub struct ViewPipeline<C> {
    client: C,
    table: Arc<TableViewConfig>,
    config: Arc<PipelineConfig>,
}

impl<C> ViewPipeline<C>
where
    C: SourceClient + Clone + Send + Sync + 'static,
{
    pub fn new(client: C, table: Arc<TableViewConfig>, config: Arc<PipelineConfig>) -> Self {
        Self {
            client,
            table,
            config,
        }
    }

    /// Runs the pipeline until `shutdown_rx` fires, restarting it after every failure.
    ///
    /// The view is created empty and dropped when this returns. Restarted runs replace its
    /// content with a fresh scan, so subscribers never observe an error.
    pub async fn run<S>(self, sink: S, mut shutdown_rx: ShutdownRx)
    where
        S: ViewSink,
    {
        let view = TableView::new(self.table.name.as_str(), sink);

        loop {
            let result = tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    info!(table = %self.table.name, "shutdown requested, stopping view pipeline");
                    return;
                }
                result = self.run_once(&view) => result,
            };

            match result {
                Ok(()) => info!(table = %self.table.name, "view pipeline run ended"),
                Err(err) if err.is_transient() => {
                    warn!(table = %self.table.name, error = %err, "view pipeline run failed")
                }
                Err(err) => {
                    error!(table = %self.table.name, error = %err, "view pipeline run failed")
                }
            }

            counter!(MVIEW_PIPELINE_RESTARTS_TOTAL, TABLE_LABEL => self.table.name.clone())
                .increment(1);

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => return,
                _ = tokio::time::sleep(self.config.restart_delay()) => {
                    info!(table = %self.table.name, "restarting view pipeline from a fresh scan");
                }
            }
        }
    }

    /// Runs the pipeline once, from the initial scan until the first failure.
    ///
    /// Once the stream is disabled and every shard has been drained, the run ends with
    /// [`ErrorKind::PipelineCompleted`] so that the next run looks the stream up again.
    async fn run_once<S>(&self, view: &TableView<S>) -> ViewResult<()>
    where
        S: ViewSink,
    {
        let stream_id = self.resolve_stream().await?;
        info!(table = %self.table.name, stream = %stream_id, "starting view pipeline run");

        let rows: Vec<(String, Row)> = read_table(self.client.clone(), self.table.clone())
            .try_collect()
            .await?;
        info!(table = %self.table.name, rows = rows.len(), "loaded table snapshot");
        view.load(rows).await;

        let (changes_tx, mut changes_rx) = mpsc::channel(self.config.changes_buffer_size);
        // Dropped once no more shards can appear, so that the channel closes with the consumers.
        let mut changes_tx = Some(changes_tx);

        let mut shards = pin!(watch_active_shards(
            self.client.clone(),
            stream_id.clone(),
            self.config.shard_poll_interval(),
        ));
        let mut consumers = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                Some(result) = consumers.join_next() => {
                    if let Err(err) = flatten_join(result, "shard consumer") {
                        return Err(collect_failures(err, &mut consumers, "shard consumer"));
                    }
                }

                Some(change) = changes_rx.recv() => {
                    view.apply(change).await;
                }

                shard = shards.next(), if changes_tx.is_some() => {
                    let (Some(shard_id), Some(tx)) = (shard.transpose()?, changes_tx.clone()) else {
                        info!(table = %self.table.name, stream = %stream_id, "stream disabled, draining remaining shards");
                        changes_tx = None;
                        continue;
                    };

                    let span = info_span!(
                        "shard_consumer",
                        table = %self.table.name,
                        stream = %stream_id,
                        shard = %shard_id
                    );
                    let consumer = ShardConsumer::new(
                        self.client.clone(),
                        stream_id.clone(),
                        shard_id,
                        self.table.clone(),
                        self.config.clone(),
                    );
                    consumers.spawn(consumer.run(tx).instrument(span));
                    debug!(table = %self.table.name, consumers = consumers.len(), "started shard consumer");
                }

                else => break,
            }
        }

        bail!(
            ErrorKind::PipelineCompleted,
            "View pipeline ran out of shards",
            format!("stream `{stream_id}` of table `{}` was disabled", self.table.name)
        );
    }

    /// Returns the configured stream, or the one currently attached to the table.
    async fn resolve_stream(&self) -> ViewResult<StreamId> {
        if let Some(stream_id) = &self.table.stream_id {
            return Ok(StreamId::new(stream_id.as_str()));
        }

        let description = self.client.describe_table(&self.table.name).await?;
        match description.latest_stream_id {
            Some(stream_id) => Ok(stream_id),
            None => bail!(
                ErrorKind::StreamNotFound,
                "Table has no stream attached",
                format!("streaming is not enabled on table `{}`", self.table.name)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::types::ViewSnapshot;
    use source::error::SourceError;
    use source::memory::{MemorySource, Operation};
    use source::types::{AttributeValue, Item};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::watch;

    /// Sink exposing the latest published snapshot through a watch channel.
    struct WatchSink(watch::Sender<ViewSnapshot>);

    impl ViewSink for WatchSink {
        fn publish(&self, snapshot: ViewSnapshot) {
            self.0.send_replace(snapshot);
        }
    }

    /// Sink keeping every published snapshot.
    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<ViewSnapshot>>>);

    impl ViewSink for RecordingSink {
        fn publish(&self, snapshot: ViewSnapshot) {
            self.0.lock().unwrap().push(snapshot);
        }
    }

    fn table() -> Arc<TableViewConfig> {
        Arc::new(TableViewConfig {
            name: "departures".to_owned(),
            key_attribute: "row".to_owned(),
            attributes: vec!["row".to_owned(), "status".to_owned()],
            stream_id: None,
            business_key: None,
        })
    }

    fn flight(row: &str, status: &str) -> Item {
        Item::from([
            ("row".to_owned(), AttributeValue::n(row)),
            ("status".to_owned(), AttributeValue::s(status)),
        ])
    }

    fn status_of(snapshot: &ViewSnapshot, key: &str) -> Option<String> {
        snapshot.get(key)?.get("status").cloned()
    }

    async fn wait_for(
        rx: &mut watch::Receiver<ViewSnapshot>,
        condition: impl Fn(&ViewSnapshot) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|view| condition(view)))
            .await
            .expect("view never reached the expected state")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn view_follows_snapshot_then_stream() {
        let source = MemorySource::new();
        source.create_table("departures", "row", true).await.unwrap();
        source.put_item("departures", flight("1", "on time")).await.unwrap();

        let (tx, mut rx) = watch::channel(ViewSnapshot::default());
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let pipeline = ViewPipeline::new(source.clone(), table(), Arc::default());
        let handle = tokio::spawn(pipeline.run(WatchSink(tx), shutdown_rx));

        wait_for(&mut rx, |view| view.len() == 1).await;

        source.put_item("departures", flight("2", "boarding")).await.unwrap();
        source.put_item("departures", flight("1", "delayed")).await.unwrap();
        wait_for(&mut rx, |view| {
            status_of(view, "1").as_deref() == Some("delayed")
                && status_of(view, "2").as_deref() == Some("boarding")
        })
        .await;

        source
            .delete_item("departures", Item::from([("row".to_owned(), AttributeValue::n("2"))]))
            .await
            .unwrap();
        wait_for(&mut rx, |view| view.get("2").is_none()).await;

        shutdown_tx.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_runs_restart_from_a_fresh_scan() {
        let source = MemorySource::new();
        source.create_table("departures", "row", true).await.unwrap();
        source.put_item("departures", flight("1", "on time")).await.unwrap();
        source
            .fail_next(
                Operation::Scan,
                SourceError::Throttled("slow down".to_owned()),
            )
            .await;

        let sink = RecordingSink::default();
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let pipeline = ViewPipeline::new(source.clone(), table(), Arc::default());
        let handle = tokio::spawn(pipeline.run(sink.clone(), shutdown_rx));

        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown_tx.shutdown();
        handle.await.unwrap();

        assert_eq!(source.calls(Operation::Scan).await, 2);
        let published = sink.0.lock().unwrap();
        assert_eq!(status_of(&published[0], "1").as_deref(), Some("on time"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_stream_is_retried_until_enabled() {
        let source = MemorySource::new();
        source.create_table("departures", "row", false).await;
        source.put_item("departures", flight("1", "on time")).await.unwrap();

        let (tx, mut rx) = watch::channel(ViewSnapshot::default());
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let pipeline = ViewPipeline::new(source.clone(), table(), Arc::default());
        let handle = tokio::spawn(pipeline.run(WatchSink(tx), shutdown_rx));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.borrow().is_empty());
        assert!(source.calls(Operation::DescribeTable).await >= 2);

        source.enable_stream("departures").await.unwrap();
        wait_for(&mut rx, |view| view.len() == 1).await;

        shutdown_tx.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_stream_ends_the_run_after_draining() {
        let source = MemorySource::new();
        source.create_table("departures", "row", true).await.unwrap();

        let (tx, mut rx) = watch::channel(ViewSnapshot::default());
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let pipeline = ViewPipeline::new(source.clone(), table(), Arc::default());
        let handle = tokio::spawn(pipeline.run(WatchSink(tx), shutdown_rx));

        // Let the first run discover the shard before writing to it.
        tokio::time::sleep(Duration::from_secs(1)).await;
        source.put_item("departures", flight("1", "on time")).await.unwrap();
        source.disable_stream("departures").await.unwrap();

        wait_for(&mut rx, |view| view.len() == 1).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        // Every later run finds no stream and fails before scanning.
        assert_eq!(source.calls(Operation::Scan).await, 1);
        assert!(source.calls(Operation::DescribeTable).await >= 2);

        shutdown_tx.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_failures_restart_the_run_while_changes_keep_coming() {
        let source = MemorySource::new();
        source.create_table("departures", "row", true).await.unwrap();
        source.put_item("departures", flight("1", "on time")).await.unwrap();

        let (tx, mut rx) = watch::channel(ViewSnapshot::default());
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let pipeline = ViewPipeline::new(source.clone(), table(), Arc::default());
        let handle = tokio::spawn(pipeline.run(WatchSink(tx), shutdown_rx));
        wait_for(&mut rx, |view| view.len() == 1).await;

        let writer = tokio::spawn({
            let source = source.clone();
            async move {
                for round in 0u64.. {
                    let row = (round % 10).to_string();
                    source.put_item("departures", flight(&row, "boarding")).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        source
            .fail_next(
                Operation::FetchRecords,
                SourceError::Connection("connection reset".to_owned()),
            )
            .await;

        tokio::time::timeout(Duration::from_secs(60), async {
            while source.calls(Operation::Scan).await < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("the failed consumer never restarted the run");

        writer.abort();
        shutdown_tx.shutdown();
        handle.await.unwrap();
    }
}
