use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

/// A typed attribute value as stored in a source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// A string attribute.
    S(String),
    /// A number attribute, kept in its textual representation.
    N(String),
    /// A boolean attribute.
    Bool(bool),
    /// An explicit null attribute.
    Null,
}

impl AttributeValue {
    /// Returns the textual content of string and number attributes.
    ///
    /// Returns [`None`] for every other attribute type.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::S(value) | AttributeValue::N(value) => Some(value),
            AttributeValue::Bool(_) | AttributeValue::Null => None,
        }
    }

    /// Creates a string attribute.
    pub fn s(value: impl Into<String>) -> Self {
        AttributeValue::S(value.into())
    }

    /// Creates a number attribute from its textual representation.
    pub fn n(value: impl Into<String>) -> Self {
        AttributeValue::N(value.into())
    }
}

/// An item as returned by the source: attribute name to typed value.
pub type Item = HashMap<String, AttributeValue>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            /// Creates a new identifier from anything convertible into a [`String`].
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a change stream attached to a table.
    StreamId
);

string_id!(
    /// Identifier of a shard, unique within its stream.
    ShardId
);

string_id!(
    /// Opaque position within one shard.
    ///
    /// Cursors are only meaningful to the source that produced them.
    ShardCursor
);

/// Description of a table, as far as change streaming is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    pub name: String,
    /// The stream currently capturing the table's changes, if streaming is enabled.
    pub latest_stream_id: Option<StreamId>,
}

/// One page of a paginated table scan.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<Item>,
    /// Key to resume the scan from. An absent or empty key ends the scan.
    pub last_evaluated_key: Option<Item>,
}

/// Top-level status of a change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Enabling,
    Enabled,
    Disabling,
    Disabled,
}

/// Description of one shard of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescription {
    pub shard_id: ShardId,
    pub parent_shard_id: Option<ShardId>,
    pub starting_sequence_number: String,
    /// Set once the shard has been closed for writes.
    pub ending_sequence_number: Option<String>,
}

impl ShardDescription {
    /// A shard is active as long as it has no ending sequence number.
    pub fn is_active(&self) -> bool {
        self.ending_sequence_number.is_none()
    }
}

/// Description of a change stream and its current shard topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescription {
    pub stream_id: StreamId,
    pub status: StreamStatus,
    pub shards: Vec<ShardDescription>,
}

/// A single change captured by a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    /// Key attributes of the changed item.
    pub keys: Item,
    /// Full item after the change. Absent for removals or when the stream view type
    /// does not carry images.
    pub new_image: Option<Item>,
    /// Approximate time at which the change was captured.
    pub approximate_creation_time: DateTime<Utc>,
    pub sequence_number: String,
}

/// Result of fetching one batch of records from a shard cursor.
#[derive(Debug, Clone, Default)]
pub struct RecordsBatch {
    pub records: Vec<StreamRecord>,
    /// Cursor for the next fetch, absent once the shard is closed and fully read.
    pub next_cursor: Option<ShardCursor>,
}
