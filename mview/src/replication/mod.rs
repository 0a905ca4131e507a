//! Reading a table and following its change stream.
//!
//! - [`snapshot`] pages through a full table scan.
//! - [`shards`] watches a stream for newly active shards.
//! - [`shard`] consumes one shard and resolves its records into row changes.

pub mod shard;
pub mod shards;
pub mod snapshot;
