use config::shared::{PipelineConfig, TableViewConfig, ViewsConfig};
use mview::views::TableViews;
use source::memory::MemorySource;
use source::types::{AttributeValue, Item};

pub const TABLE: &str = "departures";

/// Pipeline timings short enough for tests to observe restarts, shard changes and teardowns.
pub fn fast_pipeline() -> PipelineConfig {
    PipelineConfig {
        shard_poll_interval_ms: 50,
        max_poll_delay_ms: 20,
        restart_delay_ms: 50,
        teardown_grace_ms: 200,
        ..PipelineConfig::default()
    }
}

pub fn departures_table() -> TableViewConfig {
    TableViewConfig {
        name: TABLE.to_owned(),
        key_attribute: "row".to_owned(),
        attributes: vec!["row".to_owned(), "flight".to_owned(), "status".to_owned()],
        stream_id: None,
        business_key: Some("flight".to_owned()),
    }
}

/// Creates a streaming departures table and the views reading it.
pub async fn departures() -> (MemorySource, TableViews) {
    let source = MemorySource::new();
    source.create_table(TABLE, "row", true).await;

    let config = ViewsConfig {
        pipeline: fast_pipeline(),
        tables: vec![departures_table()],
    };
    let views = TableViews::new(source.clone(), config).unwrap();

    (source, views)
}

pub fn departure(row: u32, flight: &str, status: &str) -> Item {
    Item::from([
        ("row".to_owned(), AttributeValue::n(row.to_string())),
        ("flight".to_owned(), AttributeValue::s(flight)),
        ("status".to_owned(), AttributeValue::s(status)),
    ])
}

pub fn row_key(row: u32) -> Item {
    Item::from([("row".to_owned(), AttributeValue::n(row.to_string()))])
}
