//! Configuration for materialized views: per-table view settings, pipeline timings and the
//! hierarchical loader that reads them from files and environment variables.

pub mod environment;
pub mod load;
pub mod shared;
