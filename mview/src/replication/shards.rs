use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use futures::{Stream, stream};
use metrics::counter;
use source::client::SourceClient;
use source::types::{ShardId, StreamId, StreamStatus};
use tracing::{debug, info};

use crate::error::ViewResult;
use crate::metrics::{MVIEW_SHARDS_DISCOVERED_TOTAL, STREAM_LABEL};

struct WatchState<C> {
    client: C,
    stream_id: StreamId,
    poll_interval: Duration,
    /// Every shard ever emitted. Grows for the lifetime of the watcher.
    emitted: HashSet<ShardId>,
    pending: VecDeque<ShardId>,
    polled: bool,
    disabled: bool,
}

/// Watches `stream_id` and yields every shard the first time it is listed as active.
///
/// The stream's shards are listed immediately, then every `poll_interval`. Shards that turn
/// active within one listing are yielded in listing order, and no shard is yielded twice.
/// The watcher ends once the stream is reported as disabled, after yielding the shards of
/// that last listing. Listing errors end the watcher.
pub fn watch_active_shards<C>(
    client: C,
    stream_id: StreamId,
    poll_interval: Duration,
) -> impl Stream<Item = ViewResult<ShardId>> + Send
where
    C: SourceClient + Send + Sync + 'static,
{
    let state = WatchState {
        client,
        stream_id,
        poll_interval,
        emitted: HashSet::new(),
        pending: VecDeque::new(),
        polled: false,
        disabled: false,
    };

    stream::try_unfold(state, next_active_shard)
}

async fn next_active_shard<C>(
    mut state: WatchState<C>,
) -> ViewResult<Option<(ShardId, WatchState<C>)>>
where
    C: SourceClient,
{
    loop {
        if let Some(shard_id) = state.pending.pop_front() {
            return Ok(Some((shard_id, state)));
        }

        if state.disabled {
            info!(stream = %state.stream_id, "stream disabled, no more shards to watch");
            return Ok(None);
        }

        if state.polled {
            tokio::time::sleep(state.poll_interval).await;
        }
        state.polled = true;

        let description = state.client.describe_stream(&state.stream_id).await?;

        for shard in description.shards {
            if shard.is_active() && state.emitted.insert(shard.shard_id.clone()) {
                info!(stream = %state.stream_id, shard = %shard.shard_id, "discovered active shard");
                counter!(MVIEW_SHARDS_DISCOVERED_TOTAL, STREAM_LABEL => state.stream_id.to_string())
                    .increment(1);
                state.pending.push_back(shard.shard_id);
            }
        }
        debug!(
            stream = %state.stream_id,
            status = ?description.status,
            new_shards = state.pending.len(),
            "listed stream shards"
        );

        state.disabled = description.status == StreamStatus::Disabled;
    }
}
