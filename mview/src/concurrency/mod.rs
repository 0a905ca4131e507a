pub mod join;
pub mod shutdown;
