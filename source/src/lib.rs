//! Access to a key-value table service and the change streams attached to its tables.
//!
//! The [`client::SourceClient`] trait is the only seam the view pipeline talks through.
//! An in-memory implementation is available behind the `test-utils` feature.

pub mod client;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod types;
