//! Sync engine
//!
//! Drives the operation queue against the remote:
//! - single-flight drain with an explicit state machine
//! - exponential backoff for transient failures
//! - hand-off to the conflict resolver for stale writes

mod backoff;
mod orchestrator;
mod types;

pub use backoff::*;
pub use orchestrator::*;
pub use types::*;
