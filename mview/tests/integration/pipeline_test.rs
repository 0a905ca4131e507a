use std::time::Duration;

use mview::test_utils::wait::{row_value, wait_for_view};
use source::client::SourceClient;
use source::error::SourceError;
use source::memory::{MemorySource, Operation};
use telemetry::tracing::init_test_tracing;
use tokio::time::sleep;

use crate::common::{TABLE, departure, departures, row_key};

/// Waits until the shard watcher listed the stream at least once more.
///
/// Shards are only followed if they are still active when listed.
async fn wait_for_listing(source: &MemorySource) {
    let listings = source.calls(Operation::DescribeStream).await;
    while source.calls(Operation::DescribeStream).await <= listings {
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribers_see_the_snapshot_then_every_change() {
    init_test_tracing();

    let (source, views) = departures().await;
    source.put_item(TABLE, departure(1, "DL101", "on time")).await.unwrap();
    source.put_item(TABLE, departure(2, "DL202", "boarding")).await.unwrap();

    let mut subscription = views.subscribe(TABLE).unwrap();
    let view = wait_for_view(&mut subscription, |view| view.len() == 2).await;
    assert_eq!(view.keys().collect::<Vec<_>>(), ["1", "2"]);

    source.put_item(TABLE, departure(3, "DL303", "delayed")).await.unwrap();
    source.put_item(TABLE, departure(1, "DL101", "departed")).await.unwrap();
    source.delete_item(TABLE, row_key(2)).await.unwrap();

    let view = wait_for_view(&mut subscription, |view| {
        view.len() == 2 && row_value(view, "1", "status") == Some("departed")
    })
    .await;
    assert_eq!(view.keys().collect::<Vec<_>>(), ["1", "3"]);
    assert_eq!(row_value(&view, "3", "flight"), Some("DL303"));
}

#[tokio::test(flavor = "multi_thread")]
async fn late_subscribers_start_from_the_current_view() {
    init_test_tracing();

    let (source, views) = departures().await;
    source.put_item(TABLE, departure(1, "DL101", "on time")).await.unwrap();

    let mut first = views.subscribe(TABLE).unwrap();
    source.put_item(TABLE, departure(1, "DL101", "boarding")).await.unwrap();
    wait_for_view(&mut first, |view| {
        row_value(view, "1", "status") == Some("boarding")
    })
    .await;

    let mut second = views.subscribe(TABLE).unwrap();
    let view = tokio::time::timeout(Duration::from_secs(1), second.next())
        .await
        .expect("late subscribers get the latest view right away");
    assert_eq!(row_value(&view, "1", "status"), Some("boarding"));
}

#[tokio::test(flavor = "multi_thread")]
async fn backlog_is_resolved_from_the_table() {
    init_test_tracing();

    let (source, views) = departures().await;
    source.put_item(TABLE, departure(1, "DL101", "on time")).await.unwrap();
    // The stream still carries the first image, the table already holds a newer one.
    source
        .overwrite_without_record(TABLE, departure(1, "DL101", "cancelled"))
        .await
        .unwrap();

    let mut subscription = views.subscribe(TABLE).unwrap();
    wait_for_view(&mut subscription, |view| view.len() == 1).await;

    // Wait for the backlog batch to be resolved.
    while source.calls(Operation::GetItem).await == 0 {
        sleep(Duration::from_millis(10)).await;
    }
    sleep(Duration::from_millis(100)).await;

    let view = views.hub(TABLE).unwrap().latest().unwrap();
    assert_eq!(row_value(&view, "1", "status"), Some("cancelled"));
}

#[tokio::test(flavor = "multi_thread")]
async fn changes_on_split_shards_are_followed() {
    init_test_tracing();

    let (source, views) = departures().await;
    let stream_id = source
        .describe_table(TABLE)
        .await
        .unwrap()
        .latest_stream_id
        .unwrap();

    let mut subscription = views.subscribe(TABLE).unwrap();
    wait_for_view(&mut subscription, |view| view.is_empty()).await;

    source.put_item(TABLE, departure(1, "DL101", "on time")).await.unwrap();
    source.split_shard(&stream_id).await.unwrap();
    wait_for_listing(&source).await;
    source.put_item(TABLE, departure(2, "DL202", "boarding")).await.unwrap();
    source.split_shard(&stream_id).await.unwrap();
    wait_for_listing(&source).await;
    source.put_item(TABLE, departure(1, "DL101", "delayed")).await.unwrap();

    wait_for_view(&mut subscription, |view| {
        view.len() == 2 && row_value(view, "1", "status") == Some("delayed")
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_runs_restart_from_a_fresh_snapshot() {
    init_test_tracing();

    let (source, views) = departures().await;
    source.put_item(TABLE, departure(1, "DL101", "on time")).await.unwrap();
    source
        .fail_next(
            Operation::FetchRecords,
            SourceError::Connection("connection reset".to_owned()),
        )
        .await;

    let mut subscription = views.subscribe(TABLE).unwrap();
    wait_for_view(&mut subscription, |view| view.len() == 1).await;

    while source.calls(Operation::Scan).await < 2 {
        sleep(Duration::from_millis(10)).await;
    }

    source.put_item(TABLE, departure(2, "DL202", "boarding")).await.unwrap();
    wait_for_view(&mut subscription, |view| view.len() == 2).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn replaced_streams_are_picked_up() {
    init_test_tracing();

    let (source, views) = departures().await;
    source.put_item(TABLE, departure(1, "DL101", "on time")).await.unwrap();

    let mut subscription = views.subscribe(TABLE).unwrap();
    wait_for_view(&mut subscription, |view| view.len() == 1).await;

    source.disable_stream(TABLE).await.unwrap();
    // Written while no stream is attached, only a fresh scan can see it.
    source.put_item(TABLE, departure(2, "DL202", "boarding")).await.unwrap();
    source.enable_stream(TABLE).await.unwrap();

    wait_for_view(&mut subscription, |view| view.len() == 2).await;

    source.put_item(TABLE, departure(3, "DL303", "delayed")).await.unwrap();
    wait_for_view(&mut subscription, |view| view.len() == 3).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pipelines_stop_once_the_grace_period_is_over() {
    init_test_tracing();

    let (source, views) = departures().await;
    source.put_item(TABLE, departure(1, "DL101", "on time")).await.unwrap();
    let hub = views.hub(TABLE).unwrap();

    let mut subscription = views.subscribe(TABLE).unwrap();
    wait_for_view(&mut subscription, |view| view.len() == 1).await;
    drop(subscription);

    assert!(hub.is_running());
    sleep(Duration::from_millis(600)).await;
    assert!(!hub.is_running());
    assert!(hub.latest().is_none());

    let scans = source.calls(Operation::Scan).await;
    let mut subscription = views.subscribe(TABLE).unwrap();
    wait_for_view(&mut subscription, |view| view.len() == 1).await;
    assert_eq!(source.calls(Operation::Scan).await, scans + 1);
}
