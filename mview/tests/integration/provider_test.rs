use mview::diff::{DiffUpdate, RowCommand};
use mview::provider::{ItemMode, ItemUpdate};
use mview::test_utils::listener::RecordingListener;
use source::client::SourceClient;
use telemetry::tracing::init_test_tracing;

use crate::common::{TABLE, departure, departures, row_key};

fn row_commands(updates: &[ItemUpdate]) -> Vec<(RowCommand, String)> {
    updates
        .iter()
        .filter_map(|update| match update {
            ItemUpdate::Diff(DiffUpdate::Row { command, key, .. }) => Some((*command, key.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn diff_items_receive_row_commands_by_flight() {
    init_test_tracing();

    let (source, views) = departures().await;
    source.put_item(TABLE, departure(1, "DL101", "on time")).await.unwrap();

    let listener = RecordingListener::new();
    let provider = views.diff_provider(TABLE, listener.clone()).unwrap();
    assert!(provider.is_snapshot_available());
    provider.subscribe("departures");

    let updates = listener.wait_for_updates("departures", 2).await;
    assert_eq!(
        updates[0],
        ItemUpdate::Diff(DiffUpdate::Row {
            command: RowCommand::Add,
            key: "DL101".to_owned(),
            row: Some(
                [("row", "1"), ("flight", "DL101"), ("status", "on time")]
                    .into_iter()
                    .map(|(name, value)| (name.to_owned(), value.to_owned()))
                    .collect()
            ),
            is_snapshot: true,
        })
    );
    assert_eq!(updates[1], ItemUpdate::Diff(DiffUpdate::EndOfSnapshot));

    // Adapters push row commands as flat field maps.
    let ItemUpdate::Diff(update) = &updates[0] else {
        panic!("expected a row command, got {:?}", updates[0]);
    };
    let fields = update.fields().expect("row commands carry fields");
    assert_eq!(fields["key"], "DL101");
    assert_eq!(fields["command"], "ADD");
    assert_eq!(fields["status"], "on time");

    source.put_item(TABLE, departure(2, "DL202", "boarding")).await.unwrap();
    let updates = listener.wait_for_updates("departures", 3).await;
    assert_eq!(row_commands(&updates[2..]), [(RowCommand::Add, "DL202".to_owned())]);

    source.delete_item(TABLE, row_key(1)).await.unwrap();
    let updates = listener.wait_for_updates("departures", 4).await;
    assert_eq!(row_commands(&updates[3..]), [(RowCommand::Delete, "DL101".to_owned())]);

    source.delete_item(TABLE, row_key(2)).await.unwrap();
    let updates = listener.wait_for_updates("departures", 5).await;
    assert_eq!(updates[4], ItemUpdate::Diff(DiffUpdate::ClearSnapshot));
}

#[tokio::test(flavor = "multi_thread")]
async fn key_value_items_receive_one_field_per_row() {
    init_test_tracing();

    let (source, views) = departures().await;
    source.put_item(TABLE, departure(1, "DL101", "on time")).await.unwrap();
    source.put_item(TABLE, departure(2, "DL202", "boarding")).await.unwrap();

    let listener = RecordingListener::new();
    let mode = ItemMode::KeyValue {
        key_attribute: "flight".to_owned(),
        value_attribute: "status".to_owned(),
    };
    let provider = views.provider(TABLE, mode, listener.clone()).unwrap();
    assert!(!provider.is_snapshot_available());
    provider.subscribe("statuses");

    let updates = listener.wait_for_updates("statuses", 1).await;
    let ItemUpdate::Fields(fields) = &updates[0] else {
        panic!("expected flattened fields, got {:?}", updates[0]);
    };
    assert_eq!(fields["DL101"], "on time");
    assert_eq!(fields["DL202"], "boarding");
}

#[tokio::test(flavor = "multi_thread")]
async fn items_share_one_pipeline_per_table() {
    init_test_tracing();

    let (_source, views) = departures().await;
    let provider = views
        .provider(TABLE, ItemMode::Snapshot, RecordingListener::new())
        .unwrap();

    provider.subscribe("board");
    provider.subscribe("gates");

    let hub = views.hub(TABLE).unwrap();
    assert_eq!(hub.subscriber_count(), 2);
    assert!(hub.is_running());

    drop(provider);
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while hub.subscriber_count() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("dropping the provider releases its subscriptions");
}
