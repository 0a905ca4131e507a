//! In-memory source for tests.
//!
//! [`MemorySource`] keeps tables and their change streams in memory and mimics the observable
//! behavior of a real table service: paginated scans, shard topology changes, cursors that
//! stay open on active shards, and records carrying full new images. It also allows injecting
//! failures and controlling record timestamps, which is what makes lag and restart scenarios
//! testable without a network.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::client::SourceClient;
use crate::error::{SourceError, SourceResult};
use crate::types::{
    AttributeValue, Item, RecordsBatch, ScanPage, ShardCursor, ShardDescription, ShardId,
    StreamDescription, StreamId, StreamRecord, StreamStatus, TableDescription,
};

/// Default number of items returned by one scan page.
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 100;

/// Default maximum number of records returned by one fetch.
pub const DEFAULT_FETCH_LIMIT: usize = 1000;

const CURSOR_SEPARATOR: char = '|';

/// Operations of [`SourceClient`], used to inject failures and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DescribeTable,
    Scan,
    GetItem,
    PutItem,
    DeleteItem,
    DescribeStream,
    OpenShardCursor,
    FetchRecords,
}

#[derive(Debug)]
struct MemoryTable {
    key_attribute: String,
    items: Vec<Item>,
    stream_id: Option<StreamId>,
}

impl MemoryTable {
    fn position(&self, key: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item_key(item, &self.key_attribute).ok() == Some(key))
    }
}

#[derive(Debug)]
struct MemoryShard {
    description: ShardDescription,
    records: Vec<StreamRecord>,
}

#[derive(Debug)]
struct MemoryStream {
    status: StreamStatus,
    shards: Vec<MemoryShard>,
}

impl MemoryStream {
    fn active_shard_mut(&mut self) -> Option<&mut MemoryShard> {
        self.shards
            .iter_mut()
            .rev()
            .find(|shard| shard.description.is_active())
    }
}

#[derive(Debug)]
struct Inner {
    tables: HashMap<String, MemoryTable>,
    streams: HashMap<StreamId, MemoryStream>,
    next_sequence: u64,
    scan_page_size: usize,
    fetch_limit: usize,
    record_age: Duration,
    failures: HashMap<Operation, VecDeque<SourceError>>,
    calls: HashMap<Operation, usize>,
}

impl Inner {
    fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    /// Counts the call and returns the next injected failure for `operation`, if any.
    fn enter(&mut self, operation: Operation) -> SourceResult<()> {
        *self.calls.entry(operation).or_default() += 1;

        match self
            .failures
            .get_mut(&operation)
            .and_then(|failures| failures.pop_front())
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn table(&self, table: &str) -> SourceResult<&MemoryTable> {
        self.tables
            .get(table)
            .ok_or_else(|| SourceError::TableNotFound(table.to_owned()))
    }

    fn table_mut(&mut self, table: &str) -> SourceResult<&mut MemoryTable> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| SourceError::TableNotFound(table.to_owned()))
    }

    fn new_shard(&mut self, stream_id: &StreamId, parent: Option<ShardId>) -> MemoryShard {
        let sequence = self.next_sequence();

        MemoryShard {
            description: ShardDescription {
                shard_id: ShardId::new(format!("{stream_id}-shard-{sequence:06}")),
                parent_shard_id: parent,
                starting_sequence_number: sequence.to_string(),
                ending_sequence_number: None,
            },
            records: Vec::new(),
        }
    }

    fn new_stream(&mut self, table: &str) -> StreamId {
        let stream_id = StreamId::new(format!("{table}/stream/{:06}", self.next_sequence()));
        let shard = self.new_shard(&stream_id, None);

        self.streams.insert(
            stream_id.clone(),
            MemoryStream {
                status: StreamStatus::Enabled,
                shards: vec![shard],
            },
        );

        stream_id
    }

    /// Appends a record to the active shard of the table's stream, if the table streams.
    fn record(
        &mut self,
        table: &str,
        keys: Item,
        new_image: Option<Item>,
        created_at: DateTime<Utc>,
    ) -> SourceResult<()> {
        let Some(stream_id) = self.table(table)?.stream_id.clone() else {
            return Ok(());
        };
        let sequence_number = self.next_sequence().to_string();

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        if stream.status != StreamStatus::Enabled {
            return Ok(());
        }

        if let Some(shard) = stream.active_shard_mut() {
            shard.records.push(StreamRecord {
                keys,
                new_image,
                approximate_creation_time: created_at,
                sequence_number,
            });
        }

        Ok(())
    }

    fn record_time(&self) -> DateTime<Utc> {
        let age = chrono::Duration::from_std(self.record_age).unwrap_or(chrono::Duration::zero());
        Utc::now() - age
    }
}

/// In-memory implementation of [`SourceClient`].
#[derive(Debug, Clone)]
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySource {
    /// Creates an empty source with default page and fetch limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_SCAN_PAGE_SIZE, DEFAULT_FETCH_LIMIT)
    }

    /// Creates an empty source returning at most `scan_page_size` items per scan page and
    /// `fetch_limit` records per fetch.
    pub fn with_limits(scan_page_size: usize, fetch_limit: usize) -> Self {
        let inner = Inner {
            tables: HashMap::new(),
            streams: HashMap::new(),
            next_sequence: 0,
            scan_page_size: scan_page_size.max(1),
            fetch_limit: fetch_limit.max(1),
            record_age: Duration::ZERO,
            failures: HashMap::new(),
            calls: HashMap::new(),
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Creates a table keyed by `key_attribute`, with a change stream when `streaming` is set.
    ///
    /// Returns the id of the created stream.
    pub async fn create_table(
        &self,
        table: &str,
        key_attribute: &str,
        streaming: bool,
    ) -> Option<StreamId> {
        let mut inner = self.inner.lock().await;

        let stream_id = streaming.then(|| inner.new_stream(table));
        inner.tables.insert(
            table.to_owned(),
            MemoryTable {
                key_attribute: key_attribute.to_owned(),
                items: Vec::new(),
                stream_id: stream_id.clone(),
            },
        );

        stream_id
    }

    /// Makes every record written from now on look `age` old.
    pub async fn set_record_age(&self, age: Duration) {
        self.inner.lock().await.record_age = age;
    }

    /// Closes the active shards of `stream` and opens a single child shard.
    pub async fn split_shard(&self, stream: &StreamId) -> SourceResult<ShardId> {
        let mut inner = self.inner.lock().await;
        let ending_sequence = inner.next_sequence().to_string();

        let parent = {
            let stream_state = inner
                .streams
                .get_mut(stream)
                .ok_or_else(|| SourceError::StreamNotFound(stream.to_string()))?;

            let mut parent = None;
            for shard in stream_state
                .shards
                .iter_mut()
                .filter(|shard| shard.description.is_active())
            {
                shard.description.ending_sequence_number = Some(ending_sequence.clone());
                parent = Some(shard.description.shard_id.clone());
            }

            parent
        };

        let child = inner.new_shard(stream, parent);
        let child_id = child.description.shard_id.clone();
        if let Some(stream_state) = inner.streams.get_mut(stream) {
            stream_state.shards.push(child);
        }

        Ok(child_id)
    }

    /// Disables the stream of `table`, closing all of its shards.
    pub async fn disable_stream(&self, table: &str) -> SourceResult<()> {
        let mut inner = self.inner.lock().await;
        let ending_sequence = inner.next_sequence().to_string();

        let Some(stream_id) = inner.table_mut(table)?.stream_id.take() else {
            return Ok(());
        };

        if let Some(stream) = inner.streams.get_mut(&stream_id) {
            stream.status = StreamStatus::Disabled;
            for shard in stream
                .shards
                .iter_mut()
                .filter(|shard| shard.description.is_active())
            {
                shard.description.ending_sequence_number = Some(ending_sequence.clone());
            }
        }

        Ok(())
    }

    /// Attaches a brand new stream to `table`.
    pub async fn enable_stream(&self, table: &str) -> SourceResult<StreamId> {
        let mut inner = self.inner.lock().await;
        inner.table(table)?;

        let stream_id = inner.new_stream(table);
        inner.table_mut(table)?.stream_id = Some(stream_id.clone());

        Ok(stream_id)
    }

    /// Replaces an item in the table without producing a stream record.
    pub async fn overwrite_without_record(&self, table: &str, item: Item) -> SourceResult<()> {
        let mut inner = self.inner.lock().await;
        let table_state = inner.table_mut(table)?;
        let key = item_key(&item, &table_state.key_attribute)?.to_owned();

        match table_state.position(&key) {
            Some(position) => table_state.items[position] = item,
            None => table_state.items.push(item),
        }

        Ok(())
    }

    /// Appends a raw record to the table's stream without touching the table.
    pub async fn append_record(
        &self,
        table: &str,
        keys: Item,
        new_image: Option<Item>,
        created_at: DateTime<Utc>,
    ) -> SourceResult<()> {
        self.inner
            .lock()
            .await
            .record(table, keys, new_image, created_at)
    }

    /// Makes the next call to `operation` fail with `error`.
    ///
    /// Failures queue up: injecting two failures makes the next two calls fail.
    pub async fn fail_next(&self, operation: Operation, error: SourceError) {
        self.inner
            .lock()
            .await
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Returns how many times `operation` was called.
    pub async fn calls(&self, operation: Operation) -> usize {
        self.inner
            .lock()
            .await
            .calls
            .get(&operation)
            .copied()
            .unwrap_or_default()
    }

    /// Returns a copy of every item currently stored in `table`, in insertion order.
    pub async fn items(&self, table: &str) -> SourceResult<Vec<Item>> {
        Ok(self.inner.lock().await.table(table)?.items.clone())
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceClient for MemorySource {
    async fn describe_table(&self, table: &str) -> SourceResult<TableDescription> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::DescribeTable)?;

        let table_state = inner.table(table)?;

        Ok(TableDescription {
            name: table.to_owned(),
            latest_stream_id: table_state.stream_id.clone(),
        })
    }

    async fn scan(
        &self,
        table: &str,
        attributes: &[String],
        exclusive_start_key: Option<Item>,
    ) -> SourceResult<ScanPage> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::Scan)?;

        let page_size = inner.scan_page_size;
        let table_state = inner.table(table)?;

        let start = match exclusive_start_key {
            Some(key) => {
                let key = item_key(&key, &table_state.key_attribute)?;
                table_state
                    .position(key)
                    .map(|position| position + 1)
                    .ok_or_else(|| {
                        SourceError::Validation(format!("unknown exclusive start key `{key}`"))
                    })?
            }
            None => 0,
        };

        let end = (start + page_size).min(table_state.items.len());
        let items = table_state.items[start..end]
            .iter()
            .map(|item| project(item, attributes))
            .collect();

        let last_evaluated_key = (end < table_state.items.len())
            .then(|| key_item(&table_state.items[end - 1], &table_state.key_attribute));

        Ok(ScanPage {
            items,
            last_evaluated_key,
        })
    }

    async fn get_item(
        &self,
        table: &str,
        key: Item,
        attributes: &[String],
    ) -> SourceResult<Option<Item>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::GetItem)?;

        let table_state = inner.table(table)?;
        let key = item_key(&key, &table_state.key_attribute)?;

        Ok(table_state
            .position(key)
            .map(|position| project(&table_state.items[position], attributes)))
    }

    async fn put_item(&self, table: &str, item: Item) -> SourceResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::PutItem)?;

        let created_at = inner.record_time();
        let table_state = inner.table_mut(table)?;
        let key = item_key(&item, &table_state.key_attribute)?.to_owned();
        let keys = key_item(&item, &table_state.key_attribute);

        match table_state.position(&key) {
            Some(position) => table_state.items[position] = item.clone(),
            None => table_state.items.push(item.clone()),
        }

        inner.record(table, keys, Some(item), created_at)
    }

    async fn delete_item(&self, table: &str, key: Item) -> SourceResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::DeleteItem)?;

        let created_at = inner.record_time();
        let table_state = inner.table_mut(table)?;
        let key_value = item_key(&key, &table_state.key_attribute)?.to_owned();
        let keys = key_item(&key, &table_state.key_attribute);

        let Some(position) = table_state.position(&key_value) else {
            return Ok(());
        };
        table_state.items.remove(position);

        inner.record(table, keys, None, created_at)
    }

    async fn describe_stream(&self, stream: &StreamId) -> SourceResult<StreamDescription> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::DescribeStream)?;

        let stream_state = inner
            .streams
            .get(stream)
            .ok_or_else(|| SourceError::StreamNotFound(stream.to_string()))?;

        Ok(StreamDescription {
            stream_id: stream.clone(),
            status: stream_state.status,
            shards: stream_state
                .shards
                .iter()
                .map(|shard| shard.description.clone())
                .collect(),
        })
    }

    async fn open_shard_cursor(
        &self,
        stream: &StreamId,
        shard: &ShardId,
    ) -> SourceResult<ShardCursor> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::OpenShardCursor)?;

        let stream_state = inner
            .streams
            .get(stream)
            .ok_or_else(|| SourceError::StreamNotFound(stream.to_string()))?;
        if !stream_state
            .shards
            .iter()
            .any(|candidate| &candidate.description.shard_id == shard)
        {
            return Err(SourceError::ShardNotFound {
                stream_id: stream.to_string(),
                shard_id: shard.to_string(),
            });
        }

        Ok(encode_cursor(stream, shard, 0))
    }

    async fn fetch_records(&self, cursor: &ShardCursor) -> SourceResult<RecordsBatch> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::FetchRecords)?;

        let (stream, shard, offset) = decode_cursor(cursor)?;
        let fetch_limit = inner.fetch_limit;
        let shard_state = inner
            .streams
            .get(&stream)
            .and_then(|stream_state| {
                stream_state
                    .shards
                    .iter()
                    .find(|candidate| candidate.description.shard_id == shard)
            })
            .ok_or_else(|| SourceError::ExpiredCursor(cursor.to_string()))?;

        let start = offset.min(shard_state.records.len());
        let end = (start + fetch_limit).min(shard_state.records.len());
        let records = shard_state.records[start..end].to_vec();

        let drained = end == shard_state.records.len();
        let next_cursor = if drained && !shard_state.description.is_active() {
            None
        } else {
            Some(encode_cursor(&stream, &shard, end))
        };

        Ok(RecordsBatch {
            records,
            next_cursor,
        })
    }
}

fn item_key<'a>(item: &'a Item, key_attribute: &str) -> SourceResult<&'a str> {
    item.get(key_attribute)
        .and_then(AttributeValue::as_text)
        .ok_or_else(|| SourceError::Validation(format!("missing key attribute `{key_attribute}`")))
}

fn key_item(item: &Item, key_attribute: &str) -> Item {
    item.iter()
        .filter(|(name, _)| name.as_str() == key_attribute)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn project(item: &Item, attributes: &[String]) -> Item {
    if attributes.is_empty() {
        return item.clone();
    }

    item.iter()
        .filter(|(name, _)| attributes.contains(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn encode_cursor(stream: &StreamId, shard: &ShardId, offset: usize) -> ShardCursor {
    ShardCursor::new(format!(
        "{stream}{CURSOR_SEPARATOR}{shard}{CURSOR_SEPARATOR}{offset}"
    ))
}

fn decode_cursor(cursor: &ShardCursor) -> SourceResult<(StreamId, ShardId, usize)> {
    let mut parts = cursor.as_str().split(CURSOR_SEPARATOR);
    let (Some(stream), Some(shard), Some(offset), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(SourceError::ExpiredCursor(cursor.to_string()));
    };

    let offset = offset
        .parse()
        .map_err(|_| SourceError::ExpiredCursor(cursor.to_string()))?;

    Ok((StreamId::from(stream), ShardId::from(shard), offset))
}
