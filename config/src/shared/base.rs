use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// At least one table view must be configured.
    #[error("no table views are configured")]
    NoTables,
    /// A table view has an empty name.
    #[error("table view names cannot be empty")]
    EmptyTableName,
    /// Two table views share the same name.
    #[error("table view `{0}` is configured more than once")]
    DuplicateTable(String),
    /// A table view has an empty key attribute.
    #[error("table view `{table}` has an empty `key_attribute`")]
    EmptyKeyAttribute { table: String },
    /// An attribute the view relies on is not part of its projection.
    #[error("table view `{table}` does not list `{attribute}` in its `attributes`")]
    AttributeNotProjected { table: String, attribute: String },
    /// A field holds a value outside of its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}
