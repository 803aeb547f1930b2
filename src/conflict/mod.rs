//! Conflict resolution
//!
//! When the remote rejects an operation as stale, the resolver reconstructs
//! what the user intended, fetches the remote's current state and settles the
//! difference with one of a bounded set of outcomes.

mod handler;
mod resolver;
mod types;

pub use handler::*;
pub use resolver::*;
pub use types::*;
