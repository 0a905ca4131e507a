//! Materialized views of key-value tables, kept up to date from their change streams.
//!
//! A view starts from a full scan of its table and then follows every shard of the table's
//! stream, applying changes as they come. Views are shared through a [`hub::BroadcastHub`]
//! which runs the pipeline only while someone listens, and restarts it from a fresh scan
//! whenever it fails.
//!
//! Entry points:
//!
//! - [`views::TableViews`] builds one hub per configured table.
//! - [`provider::ViewProvider`] serves named items from a hub, as full views, flattened fields
//!   or row commands computed by [`diff::DiffPublisher`].

pub mod concurrency;
pub mod conversions;
pub mod diff;
pub mod error;
pub mod hub;
mod macros;
pub mod metrics;
pub mod provider;
pub mod replication;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod view;
pub mod views;
