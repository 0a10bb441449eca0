//! Request handlers for sync items.

mod list;
mod receive;

pub use list::*;
pub use receive::*;
