use std::sync::Arc;

use config::shared::TableViewConfig;
use futures::{Stream, TryStreamExt, stream};
use source::client::SourceClient;
use source::types::Item;
use tracing::debug;

use crate::conversions::{item_key, project_item};
use crate::error::{ViewError, ViewResult};
use crate::types::Row;

enum ScanPosition {
    Start,
    After(Item),
    End,
}

/// Reads every item of `table` as keyed rows.
///
/// The table is scanned lazily, one page per poll of an exhausted page, until the source stops
/// returning a resume key. Rows come out in scan order. Errors end the stream and are not
/// retried.
pub fn read_table<C>(
    client: C,
    table: Arc<TableViewConfig>,
) -> impl Stream<Item = ViewResult<(String, Row)>> + Send
where
    C: SourceClient + Clone + Send + Sync + 'static,
{
    stream::try_unfold(ScanPosition::Start, move |position| {
        read_page(client.clone(), table.clone(), position)
    })
    .map_ok(|rows| stream::iter(rows.into_iter().map(Ok::<_, ViewError>)))
    .try_flatten()
}

async fn read_page<C>(
    client: C,
    table: Arc<TableViewConfig>,
    position: ScanPosition,
) -> ViewResult<Option<(Vec<(String, Row)>, ScanPosition)>>
where
    C: SourceClient,
{
    let exclusive_start_key = match position {
        ScanPosition::Start => None,
        ScanPosition::After(key) => Some(key),
        ScanPosition::End => return Ok(None),
    };

    let page = client
        .scan(&table.name, &table.attributes, exclusive_start_key)
        .await?;
    debug!(table = %table.name, items = page.items.len(), "scanned table page");

    let rows = page
        .items
        .iter()
        .map(|item| {
            let key = item_key(item, &table.key_attribute)?;
            Ok((key, project_item(item, &table.attributes)))
        })
        .collect::<ViewResult<Vec<_>>>()?;

    // A missing or empty resume key ends the scan.
    let next = match page.last_evaluated_key {
        Some(key) if !key.is_empty() => ScanPosition::After(key),
        _ => ScanPosition::End,
    };

    Ok(Some((rows, next)))
}
