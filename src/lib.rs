//! Listsync
//!
//! Offline-first synchronization core for shared lists and their items.
//! Mutations land in a local SQLite cache immediately and are queued as
//! durable operations; the orchestrator replays them against the remote
//! store whenever it is reachable.
//!
//! # Modules
//!
//! - `context`: entry point; mutations, reads and lifecycle
//! - `queue`: durable operation queue with deduplication
//! - `cache`: locally cached lists and items
//! - `sync`: drain orchestration and retry policy
//! - `conflict`: version conflict resolution
//! - `remote`: remote store client (HTTP and in-process)
//! - `reachability`: remote reachability tracking

pub mod cache;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod context;
pub mod db;
pub mod error;
pub mod events;
pub mod queue;
pub mod reachability;
pub mod remote;
pub mod sync;

pub use cache::{ItemFields, ListFields, ResourceData, ResourceRecord};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, SyncConfig};
pub use conflict::{
    ConflictContext, DeferResolution, FixedResolution, PromptResolutionHandler, Resolution,
    ResolutionHandler,
};
pub use context::{SyncContext, SyncContextBuilder};
pub use error::{Result, SyncError};
pub use events::{EventBus, Subscription, SyncEvent};
pub use queue::{ItemOrder, ItemPatch, ListPatch, Operation, OperationKind, OperationStatus};
pub use remote::{HealthProbe, HttpRemote, InMemoryRemote, RemoteApi, RemoteRecord};
pub use sync::{DrainReport, RetryPolicy, SyncState, SyncStatus};
