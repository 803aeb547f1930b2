//! Durable operation queue
//!
//! Every local mutation is recorded here before the remote sees it. The queue
//! keeps at most one outstanding intent per resource by collapsing or
//! superseding earlier entries.

mod store;
mod types;

pub use store::*;
pub use types::*;
