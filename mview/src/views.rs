use std::collections::BTreeMap;
use std::sync::Arc;

use config::shared::{PipelineConfig, TableViewConfig, ViewsConfig};
use futures::FutureExt;
use source::client::SourceClient;
use tracing::info;

use crate::bail;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, ViewResult};
use crate::hub::{BroadcastHub, PipelineFactory, Publisher, Subscription};
use crate::metrics::register_metrics;
use crate::provider::{ItemListener, ItemMode, ViewProvider};
use crate::types::ViewSnapshot;
use crate::view::aggregator::ViewPipeline;

struct TableEntry {
    config: Arc<TableViewConfig>,
    hub: BroadcastHub<ViewSnapshot>,
}

/// The views of every configured table, one hub each.
///
/// Building the registry starts nothing: a table's pipeline runs only while its hub has
/// subscribers.
pub struct TableViews {
    tables: BTreeMap<String, TableEntry>,
}

impl TableViews {
    /// Validates `config` and builds a hub per table, reading through `client`.
    pub fn new<C>(client: C, config: ViewsConfig) -> ViewResult<Self>
    where
        C: SourceClient + Clone + Send + Sync + 'static,
    {
        config.validate()?;
        register_metrics();

        let pipeline = Arc::new(config.pipeline);
        let mut tables = BTreeMap::new();
        for table in config.tables {
            let table = Arc::new(table);
            let hub = BroadcastHub::new(
                table.name.clone(),
                pipeline.teardown_grace(),
                pipeline_factory(client.clone(), table.clone(), pipeline.clone()),
            );

            info!(table = %table.name, key = %table.key_attribute, "registered table view");
            tables.insert(table.name.clone(), TableEntry { config: table, hub });
        }

        Ok(Self { tables })
    }

    /// Returns the names of the configured tables, sorted.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Returns the hub of `table`.
    pub fn hub(&self, table: &str) -> Option<&BroadcastHub<ViewSnapshot>> {
        self.tables.get(table).map(|entry| &entry.hub)
    }

    /// Subscribes to the views of `table`.
    pub fn subscribe(&self, table: &str) -> ViewResult<Subscription<ViewSnapshot>> {
        Ok(self.entry(table)?.hub.subscribe())
    }

    /// Creates a provider delivering the views of `table` to `listener` as row commands,
    /// matched on the table's business key.
    pub fn diff_provider<L>(&self, table: &str, listener: L) -> ViewResult<ViewProvider<L>>
    where
        L: ItemListener,
    {
        let entry = self.entry(table)?;
        let mode = ItemMode::Diff {
            business_key: entry.config.business_key().to_owned(),
        };

        Ok(ViewProvider::new(entry.hub.clone(), mode, listener))
    }

    /// Creates a provider delivering the views of `table` to `listener` in the given `mode`.
    pub fn provider<L>(&self, table: &str, mode: ItemMode, listener: L) -> ViewResult<ViewProvider<L>>
    where
        L: ItemListener,
    {
        Ok(ViewProvider::new(self.entry(table)?.hub.clone(), mode, listener))
    }

    fn entry(&self, table: &str) -> ViewResult<&TableEntry> {
        match self.tables.get(table) {
            Some(entry) => Ok(entry),
            None => bail!(
                ErrorKind::ConfigError,
                "No view is configured for the table",
                format!("table `{table}`")
            ),
        }
    }
}

fn pipeline_factory<C>(
    client: C,
    table: Arc<TableViewConfig>,
    config: Arc<PipelineConfig>,
) -> PipelineFactory<ViewSnapshot>
where
    C: SourceClient + Clone + Send + Sync + 'static,
{
    Arc::new(
        move |publisher: Publisher<ViewSnapshot>, shutdown_rx: ShutdownRx| {
            ViewPipeline::new(client.clone(), table.clone(), config.clone())
                .run(publisher, shutdown_rx)
                .boxed()
        },
    )
}
