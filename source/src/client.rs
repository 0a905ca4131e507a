use std::future::Future;

use crate::error::SourceResult;
use crate::types::{
    Item, RecordsBatch, ScanPage, ShardCursor, ShardId, StreamDescription, StreamId,
    TableDescription,
};

/// Client for a key-value table service and the change streams attached to its tables.
///
/// Implementations are expected to be cheap handles that can be cloned and shared between
/// tasks: the view pipeline clones one for every shard it consumes. No method retries on its
/// own, failures are reported to the caller as they happen.
pub trait SourceClient {
    /// Describes `table`, including the stream currently attached to it.
    fn describe_table(
        &self,
        table: &str,
    ) -> impl Future<Output = SourceResult<TableDescription>> + Send;

    /// Reads one page of `table`, projecting items onto `attributes`.
    ///
    /// The scan starts from the beginning when `exclusive_start_key` is [`None`], otherwise
    /// right after the given key.
    fn scan(
        &self,
        table: &str,
        attributes: &[String],
        exclusive_start_key: Option<Item>,
    ) -> impl Future<Output = SourceResult<ScanPage>> + Send;

    /// Reads the current value of the item identified by `key`, projected onto `attributes`.
    fn get_item(
        &self,
        table: &str,
        key: Item,
        attributes: &[String],
    ) -> impl Future<Output = SourceResult<Option<Item>>> + Send;

    /// Creates or replaces an item.
    fn put_item(&self, table: &str, item: Item) -> impl Future<Output = SourceResult<()>> + Send;

    /// Deletes the item identified by `key`. Deleting a missing item is not an error.
    fn delete_item(&self, table: &str, key: Item)
    -> impl Future<Output = SourceResult<()>> + Send;

    /// Describes `stream`, listing every shard it currently retains.
    fn describe_stream(
        &self,
        stream: &StreamId,
    ) -> impl Future<Output = SourceResult<StreamDescription>> + Send;

    /// Opens a cursor at the oldest record still retained by `shard`.
    fn open_shard_cursor(
        &self,
        stream: &StreamId,
        shard: &ShardId,
    ) -> impl Future<Output = SourceResult<ShardCursor>> + Send;

    /// Fetches the records available at `cursor`.
    fn fetch_records(
        &self,
        cursor: &ShardCursor,
    ) -> impl Future<Output = SourceResult<RecordsBatch>> + Send;
}
