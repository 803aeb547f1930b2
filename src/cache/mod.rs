//! Local resource cache
//!
//! What the user sees: confirmed remote state with local intent applied on top.

mod store;
mod types;

pub use store::*;
pub use types::*;
