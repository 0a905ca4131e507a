//! Tracing setup shared by services and tests.

pub mod tracing;
