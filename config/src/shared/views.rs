use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::shared::{PipelineConfig, TableViewConfig, ValidationError};

/// Top-level configuration: the shared pipeline settings and every table view to serve.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ViewsConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub tables: Vec<TableViewConfig>,
}

impl ViewsConfig {
    /// Returns the configuration of the view named `name`.
    pub fn table(&self, name: &str) -> Option<&TableViewConfig> {
        self.tables.iter().find(|table| table.name == name)
    }

    /// Validates pipeline settings and every table view, rejecting duplicate names.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.pipeline.validate()?;

        if self.tables.is_empty() {
            return Err(ValidationError::NoTables);
        }

        let mut names = HashSet::with_capacity(self.tables.len());
        for table in &self.tables {
            table.validate()?;

            if !names.insert(table.name.as_str()) {
                return Err(ValidationError::DuplicateTable(table.name.clone()));
            }
        }

        Ok(())
    }
}
