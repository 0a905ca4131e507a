//! Helpers for testing view pipelines.
//!
//! - [`listener`] records what items receive through a [`crate::provider::ViewProvider`].
//! - [`wait`] waits for subscriptions to reach a state, failing the test instead of hanging.

pub mod listener;
pub mod wait;
