//! Consumption of a single shard.
//!
//! A [`ShardConsumer`] reads a shard from its oldest retained record until the shard is closed
//! and drained, turning records into [`RowChange`]s. Records are folded per batch so that only
//! the last change of each key survives, then resolved either from the record's new image or
//! from the table itself.
//!
//! Whether new images can be trusted depends on how fresh the shard is. While the consumer is
//! catching up from old records, images may be stale compared to the table, so every key is
//! re-read. Once the previous batch was observed in sync with the wall clock, images are used
//! directly. The verdict lags one batch behind.
//!
//! Resolution of a batch runs concurrently with the fetch of the next ones, but changes are
//! always sent in batch order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use config::shared::{PipelineConfig, TableViewConfig};
use futures::future::try_join_all;
use metrics::counter;
use source::client::SourceClient;
use source::types::{ShardId, StreamId, StreamRecord};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, warn};

use crate::concurrency::join::{collect_failures, flatten_join};
use crate::conversions::{item_key, key_item, project_item};
use crate::error::{ErrorKind, ViewResult};
use crate::metrics::{
    MVIEW_SHARD_BATCHES_TOTAL, MVIEW_SHARD_LAGGING_BATCHES_TOTAL, TABLE_LABEL,
};
use crate::types::RowChange;
use crate::view_error;

/// Delay between two fetches of a shard, adapted to what the last fetch returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveDelay {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl AdaptiveDelay {
    /// Creates a delay bounded to `[min, max]` when growing, starting at zero.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            current: Duration::ZERO,
            min,
            max: max.max(min),
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Doubles the delay after an empty fetch.
    pub fn on_empty_batch(&mut self) -> Duration {
        self.current = self.current.saturating_mul(2).clamp(self.min, self.max);
        self.current
    }

    /// Halves the delay after a batch that was in sync.
    pub fn on_in_sync_batch(&mut self) -> Duration {
        self.current /= 2;
        self.current
    }

    /// Drops the delay to zero after a batch that was lagging.
    pub fn on_lagging_batch(&mut self) -> Duration {
        self.current = Duration::ZERO;
        self.current
    }
}

/// Consumer of one shard of a table's stream.
#[derive(Debug)]
pub struct ShardConsumer<C> {
    client: C,
    stream_id: StreamId,
    shard_id: ShardId,
    table: Arc<TableViewConfig>,
    config: Arc<PipelineConfig>,
}

impl<C> ShardConsumer<C>
where
    C: SourceClient + Clone + Send + Sync + 'static,
{
    pub fn new(
        client: C,
        stream_id: StreamId,
        shard_id: ShardId,
        table: Arc<TableViewConfig>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            client,
            stream_id,
            shard_id,
            table,
            config,
        }
    }

    /// Consumes the shard until it is closed and fully read, sending changes to `changes_tx`.
    ///
    /// Returns the first error hit while fetching or resolving records, together with the
    /// failures of other resolutions that finished meanwhile. Dropping the returned future
    /// cancels every pending resolution.
    pub async fn run(self, changes_tx: mpsc::Sender<RowChange>) -> ViewResult<()> {
        let mut cursor = Some(
            self.client
                .open_shard_cursor(&self.stream_id, &self.shard_id)
                .await?,
        );

        let mut delay =
            AdaptiveDelay::new(self.config.min_poll_delay(), self.config.max_poll_delay());
        let mut previous_in_sync = false;
        let mut previous_batch: Option<oneshot::Receiver<()>> = None;
        let mut batches = JoinSet::new();

        while let Some(current) = cursor.take() {
            while let Some(result) = batches.try_join_next() {
                if let Err(err) = flatten_join(result, "shard batch resolution") {
                    return Err(collect_failures(err, &mut batches, "shard batch resolution"));
                }
            }

            let batch = self.client.fetch_records(&current).await?;
            cursor = batch.next_cursor;

            if batch.records.is_empty() {
                let wait = delay.on_empty_batch();
                if cursor.is_some() {
                    tokio::time::sleep(wait).await;
                }
                continue;
            }

            counter!(MVIEW_SHARD_BATCHES_TOTAL, TABLE_LABEL => self.table.name.clone())
                .increment(1);

            let in_sync = is_in_sync(&batch.records, self.config.in_sync_threshold());
            let records = fold_by_key(batch.records, &self.table.key_attribute)?;
            debug!(records = records.len(), in_sync, "fetched shard batch");

            let (done_tx, done_rx) = oneshot::channel();
            let resolution = BatchResolution {
                client: self.client.clone(),
                table: self.table.clone(),
                records,
                trust_images: previous_in_sync,
                previous: previous_batch.replace(done_rx),
                done_tx,
                changes_tx: changes_tx.clone(),
            };
            batches.spawn(resolution.run().in_current_span());
            previous_in_sync = in_sync;

            if in_sync {
                tokio::time::sleep(delay.on_in_sync_batch()).await;
            } else {
                delay.on_lagging_batch();
                counter!(MVIEW_SHARD_LAGGING_BATCHES_TOTAL, TABLE_LABEL => self.table.name.clone())
                    .increment(1);
                warn!("receiving old data, draining shard backlog");
            }
        }

        while let Some(result) = batches.join_next().await {
            if let Err(err) = flatten_join(result, "shard batch resolution") {
                return Err(collect_failures(err, &mut batches, "shard batch resolution"));
            }
        }

        info!("shard closed and fully consumed");

        Ok(())
    }
}

/// Resolution of one folded batch into row changes.
struct BatchResolution<C> {
    client: C,
    table: Arc<TableViewConfig>,
    records: Vec<(String, StreamRecord)>,
    trust_images: bool,
    /// Completes once the previous batch has sent all of its changes.
    previous: Option<oneshot::Receiver<()>>,
    done_tx: oneshot::Sender<()>,
    changes_tx: mpsc::Sender<RowChange>,
}

impl<C> BatchResolution<C>
where
    C: SourceClient + Send + Sync + 'static,
{
    async fn run(self) -> ViewResult<()> {
        let client = &self.client;
        let table = &self.table;
        let trust_images = self.trust_images;

        let lookups = self.records.into_iter().map(move |(key, record)| async move {
            let value = match record.new_image {
                Some(image) if trust_images => Some(project_item(&image, &table.attributes)),
                _ => client
                    .get_item(
                        &table.name,
                        key_item(&record.keys, &table.key_attribute),
                        &table.attributes,
                    )
                    .await?
                    .map(|item| project_item(&item, &table.attributes)),
            };

            Ok::<_, crate::error::ViewError>(RowChange {
                key,
                value: value.filter(|row| !row.is_empty()),
            })
        });
        let changes = try_join_all(lookups).await?;

        if let Some(previous) = self.previous {
            // The previous batch failed, its error is reported by its own task.
            if previous.await.is_err() {
                return Ok(());
            }
        }

        for change in changes {
            self.changes_tx.send(change).await.map_err(|_| {
                view_error!(
                    ErrorKind::PipelineCancelled,
                    "View stopped receiving shard changes"
                )
            })?;
        }

        let _ = self.done_tx.send(());

        Ok(())
    }
}

/// Returns `true` when the newest record of the batch is at most `threshold` old.
fn is_in_sync(records: &[StreamRecord], threshold: Duration) -> bool {
    let Some(newest) = records
        .iter()
        .map(|record| record.approximate_creation_time)
        .max()
    else {
        return false;
    };

    // Records stamped in the future count as fresh.
    match Utc::now().signed_duration_since(newest).to_std() {
        Ok(age) => age <= threshold,
        Err(_) => true,
    }
}

/// Keeps the last record of every key, in the order keys were first seen.
fn fold_by_key(
    records: Vec<StreamRecord>,
    key_attribute: &str,
) -> ViewResult<Vec<(String, StreamRecord)>> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut folded: Vec<(String, StreamRecord)> = Vec::with_capacity(records.len());

    for record in records {
        let key = item_key(&record.keys, key_attribute)?;
        match positions.get(&key) {
            Some(&position) => folded[position].1 = record,
            None => {
                positions.insert(key.clone(), folded.len());
                folded.push((key, record));
            }
        }
    }

    Ok(folded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Row;
    use source::memory::{MemorySource, Operation};
    use source::types::{AttributeValue, Item};

    const MS: Duration = Duration::from_millis(1);
    const SECOND: Duration = Duration::from_secs(1);

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

    fn row(key: &str, status: &str) -> Row {
        Row::from([
            ("row".to_owned(), key.to_owned()),
            ("status".to_owned(), status.to_owned()),
        ])
    }

    fn record(row: &str, status: Option<&str>) -> StreamRecord {
        StreamRecord {
            keys: Item::from([("row".to_owned(), AttributeValue::n(row))]),
            new_image: status.map(|status| flight(row, status)),
            approximate_creation_time: Utc::now(),
            sequence_number: "0".to_owned(),
        }
    }

    fn key(row: &str) -> Item {
        Item::from([("row".to_owned(), AttributeValue::n(row))])
    }

    async fn consume_closed_shard(source: &MemorySource, stream_id: &StreamId) -> Vec<RowChange> {
        let shard_id = source.describe_stream(stream_id).await.unwrap().shards[0]
            .shard_id
            .clone();
        source.split_shard(stream_id).await.unwrap();

        let (changes_tx, mut changes_rx) = mpsc::channel(64);
        let consumer = ShardConsumer::new(
            source.clone(),
            stream_id.clone(),
            shard_id,
            table(),
            Arc::new(PipelineConfig::default()),
        );
        consumer.run(changes_tx).await.unwrap();

        let mut changes = Vec::new();
        while let Some(change) = changes_rx.recv().await {
            changes.push(change);
        }

        changes
    }

    #[test]
    fn delay_grows_on_empty_batches_within_bounds() {
        let mut delay = AdaptiveDelay::new(MS, SECOND);

        assert_eq!(delay.on_empty_batch(), MS);
        assert_eq!(delay.on_empty_batch(), 2 * MS);
        for _ in 0..20 {
            delay.on_empty_batch();
        }
        assert_eq!(delay.current(), SECOND);
    }

    #[test]
    fn delay_halves_when_in_sync_and_resets_when_lagging() {
        let mut delay = AdaptiveDelay::new(MS, SECOND);
        for _ in 0..4 {
            delay.on_empty_batch();
        }
        assert_eq!(delay.current(), 8 * MS);

        assert_eq!(delay.on_in_sync_batch(), 4 * MS);
        assert_eq!(delay.on_lagging_batch(), Duration::ZERO);
        assert_eq!(delay.on_empty_batch(), MS);
    }

    #[test]
    fn folding_keeps_last_record_in_first_seen_order() {
        let records = vec![
            record("1", Some("boarding")),
            record("2", Some("on time")),
            record("1", None),
            record("3", Some("delayed")),
            record("2", Some("departed")),
        ];

        let folded = fold_by_key(records, "row").unwrap();

        let keys: Vec<_> = folded.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, ["1", "2", "3"]);
        assert!(folded[0].1.new_image.is_none());
        assert_eq!(folded[1].1.new_image, Some(flight("2", "departed")));
    }

    #[test]
    fn records_without_key_fail_folding() {
        let mut bad = record("1", Some("on time"));
        bad.keys.clear();

        let err = fold_by_key(vec![bad], "row").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MissingKeyAttribute);
    }

    #[test]
    fn freshness_is_judged_on_the_newest_record() {
        let mut old = record("1", Some("on time"));
        old.approximate_creation_time = Utc::now() - chrono::Duration::minutes(5);
        let fresh = record("2", Some("on time"));

        assert!(!is_in_sync(std::slice::from_ref(&old), 3 * SECOND));
        assert!(is_in_sync(&[old, fresh], 3 * SECOND));
        assert!(!is_in_sync(&[], 3 * SECOND));
    }

    #[tokio::test]
    async fn first_batch_is_resolved_from_the_table() {
        let source = MemorySource::new();
        let stream_id = source.create_table("departures", "row", true).await.unwrap();
        source.put_item("departures", flight("1", "on time")).await.unwrap();
        source.put_item("departures", flight("2", "boarding")).await.unwrap();
        source
            .overwrite_without_record("departures", flight("1", "departed"))
            .await
            .unwrap();

        let changes = consume_closed_shard(&source, &stream_id).await;

        // Images are not trusted before an in-sync batch was seen, so the table wins.
        assert_eq!(
            changes,
            vec![
                RowChange::upsert("1", row("1", "departed")),
                RowChange::upsert("2", row("2", "boarding")),
            ]
        );
        assert_eq!(source.calls(Operation::GetItem).await, 2);
    }

    #[tokio::test]
    async fn removed_items_become_tombstones() {
        let source = MemorySource::new();
        let stream_id = source.create_table("departures", "row", true).await.unwrap();
        source.put_item("departures", flight("1", "on time")).await.unwrap();
        source
            .delete_item("departures", flight("1", "on time"))
            .await
            .unwrap();

        let changes = consume_closed_shard(&source, &stream_id).await;

        assert_eq!(changes, vec![RowChange::tombstone("1")]);
    }

    #[tokio::test]
    async fn lookup_failures_stop_the_consumer() {
        let source = MemorySource::new();
        let stream_id = source.create_table("departures", "row", true).await.unwrap();
        source.put_item("departures", flight("1", "on time")).await.unwrap();
        let shard_id = source.describe_stream(&stream_id).await.unwrap().shards[0]
            .shard_id
            .clone();
        source.split_shard(&stream_id).await.unwrap();
        source
            .fail_next(
                Operation::GetItem,
                source::error::SourceError::Throttled("slow down".to_owned()),
            )
            .await;

        let (changes_tx, _changes_rx) = mpsc::channel(64);
        let consumer = ShardConsumer::new(
            source.clone(),
            stream_id,
            shard_id,
            table(),
            Arc::new(PipelineConfig::default()),
        );

        let err = consumer.run(changes_tx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceThrottled);
    }

    #[tokio::test]
    async fn images_are_trusted_after_an_in_sync_batch() {
        let source = MemorySource::with_limits(100, 1);
        let stream_id = source.create_table("departures", "row", true).await.unwrap();
        source.put_item("departures", flight("1", "on time")).await.unwrap();
        source.put_item("departures", flight("2", "boarding")).await.unwrap();
        source
            .overwrite_without_record("departures", flight("2", "cancelled"))
            .await
            .unwrap();

        let changes = consume_closed_shard(&source, &stream_id).await;

        // The first batch is re-read, the second one comes from its image.
        assert_eq!(
            changes,
            vec![
                RowChange::upsert("1", row("1", "on time")),
                RowChange::upsert("2", row("2", "boarding")),
            ]
        );
        assert_eq!(source.calls(Operation::GetItem).await, 1);
    }

    #[tokio::test]
    async fn lagging_batches_are_always_read_from_the_table() {
        let source = MemorySource::with_limits(100, 1);
        let stream_id = source.create_table("departures", "row", true).await.unwrap();
        source.set_record_age(Duration::from_secs(60)).await;
        source.put_item("departures", flight("1", "on time")).await.unwrap();
        source.put_item("departures", flight("2", "boarding")).await.unwrap();
        source
            .overwrite_without_record("departures", flight("2", "cancelled"))
            .await
            .unwrap();

        let changes = consume_closed_shard(&source, &stream_id).await;

        assert_eq!(
            changes,
            vec![
                RowChange::upsert("1", row("1", "on time")),
                RowChange::upsert("2", row("2", "cancelled")),
            ]
        );
        assert_eq!(source.calls(Operation::GetItem).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_batches_are_fetched_back_to_back() {
        let source = MemorySource::with_limits(100, 1);
        let stream_id = source.create_table("departures", "row", true).await.unwrap();
        let shard_id = source.describe_stream(&stream_id).await.unwrap().shards[0]
            .shard_id
            .clone();

        let config = PipelineConfig {
            min_poll_delay_ms: 1_000,
            max_poll_delay_ms: 8_000,
            ..PipelineConfig::default()
        };
        let (changes_tx, mut changes_rx) = mpsc::channel(64);
        let consumer = ShardConsumer::new(
            source.clone(),
            stream_id.clone(),
            shard_id,
            table(),
            Arc::new(config),
        );

        let start = tokio::time::Instant::now();
        let handle = tokio::spawn(consumer.run(changes_tx));

        // Empty fetches at 0s, 1s and 3s grow the delay to 4s.
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
        for row in ["1", "2", "3"] {
            source
                .append_record("departures", key(row), None, an_hour_ago)
                .await
                .unwrap();
        }
        source.split_shard(&stream_id).await.unwrap();

        handle.await.unwrap().unwrap();

        // Woken at 7s, the three lagging batches follow each other without any pause.
        assert!(start.elapsed() < Duration::from_secs(8));
        let mut changes = Vec::new();
        while let Some(change) = changes_rx.recv().await {
            changes.push(change);
        }
        assert_eq!(
            changes,
            vec![
                RowChange::tombstone("1"),
                RowChange::tombstone("2"),
                RowChange::tombstone("3"),
            ]
        );
    }
}
