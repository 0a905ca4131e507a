//! Metric names recorded by view pipelines.
//!
//! Metrics go through the `metrics` facade. No recorder is installed by this crate, so they
//! are dropped unless the embedding process installs one.

use std::sync::Once;

use metrics::{describe_counter, describe_gauge};

static REGISTER: Once = Once::new();

/// Label for the table a metric refers to.
pub const TABLE_LABEL: &str = "table";

/// Label for the stream a metric refers to.
pub const STREAM_LABEL: &str = "stream";

// Pipeline metrics

/// Counter for pipeline runs that failed and were restarted.
pub const MVIEW_PIPELINE_RESTARTS_TOTAL: &str = "mview_pipeline_restarts_total";

/// Counter for row changes applied to views.
pub const MVIEW_CHANGES_APPLIED_TOTAL: &str = "mview_changes_applied_total";

/// Gauge for the number of rows in a view.
pub const MVIEW_VIEW_ROWS: &str = "mview_view_rows";

// Stream metrics

/// Counter for active shards discovered by shard watchers.
pub const MVIEW_SHARDS_DISCOVERED_TOTAL: &str = "mview_shards_discovered_total";

/// Counter for non-empty batches fetched from shards.
pub const MVIEW_SHARD_BATCHES_TOTAL: &str = "mview_shard_batches_total";

/// Counter for fetched batches whose newest record was older than the in-sync threshold.
pub const MVIEW_SHARD_LAGGING_BATCHES_TOTAL: &str = "mview_shard_lagging_batches_total";

// Hub metrics

/// Gauge for the number of subscribers attached to a hub.
pub const MVIEW_HUB_SUBSCRIBERS: &str = "mview_hub_subscribers";

/// Registers metric descriptions. Safe to call multiple times.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        describe_counter!(
            MVIEW_PIPELINE_RESTARTS_TOTAL,
            "Number of view pipeline runs that failed and were restarted"
        );
        describe_counter!(
            MVIEW_CHANGES_APPLIED_TOTAL,
            "Number of row changes applied to views"
        );
        describe_gauge!(MVIEW_VIEW_ROWS, "Number of rows currently held by a view");
        describe_counter!(
            MVIEW_SHARDS_DISCOVERED_TOTAL,
            "Number of active shards discovered while watching streams"
        );
        describe_counter!(
            MVIEW_SHARD_BATCHES_TOTAL,
            "Number of non-empty record batches fetched from shards"
        );
        describe_counter!(
            MVIEW_SHARD_LAGGING_BATCHES_TOTAL,
            "Number of fetched batches that were behind the wall clock"
        );
        describe_gauge!(
            MVIEW_HUB_SUBSCRIBERS,
            "Number of subscribers attached to a view hub"
        );
    });
}
