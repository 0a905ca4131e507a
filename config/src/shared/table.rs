use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Configuration of one materialized table view.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TableViewConfig {
    /// Name of the source table, also used to look the view up.
    pub name: String,
    /// Attribute holding the primary key of every item.
    pub key_attribute: String,
    /// Attributes projected into view rows. Must include [`TableViewConfig::key_attribute`].
    pub attributes: Vec<String>,
    /// Stream to consume. When absent, the table's latest stream is looked up on every
    /// pipeline run.
    #[serde(default)]
    pub stream_id: Option<String>,
    /// Attribute identifying rows to downstream consumers of diffs.
    ///
    /// Defaults to [`TableViewConfig::key_attribute`] when absent.
    #[serde(default)]
    pub business_key: Option<String>,
}

impl TableViewConfig {
    /// Returns the attribute diffs are keyed by.
    pub fn business_key(&self) -> &str {
        self.business_key.as_deref().unwrap_or(&self.key_attribute)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyTableName);
        }

        if self.key_attribute.trim().is_empty() {
            return Err(ValidationError::EmptyKeyAttribute {
                table: self.name.clone(),
            });
        }

        for attribute in [self.key_attribute.as_str(), self.business_key()] {
            if !self.attributes.iter().any(|candidate| candidate == attribute) {
                return Err(ValidationError::AttributeNotProjected {
                    table: self.name.clone(),
                    attribute: attribute.to_owned(),
                });
            }
        }

        Ok(())
    }
}
