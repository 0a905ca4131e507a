//! In-memory views and the pipelines maintaining them.

pub mod aggregator;
pub mod table;
