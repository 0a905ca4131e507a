mod base;
mod pipeline;
mod table;
mod views;

pub use base::*;
pub use pipeline::*;
pub use table::*;
pub use views::*;
