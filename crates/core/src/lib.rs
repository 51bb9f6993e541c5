//! docsync core library.
//!
//! This crate provides the conflict-resolution engine of a multi-master
//! document synchronization subsystem: the conflict model, pluggable and
//! default resolution policies, transactional commit against a concurrently
//! mutating store, blob reachability checks, per-document scheduling, and
//! replication event delivery. A SQLite-backed reference store is included.

pub mod config;
pub mod conflict;
pub mod dispatcher;
pub mod errors;
pub mod models;
pub mod notify;
pub mod store;

// Re-exports for convenience.
pub use config::{EngineConfig, ResolutionConfig, StoreConfig};
pub use conflict::{Conflict, ConflictResolver, DefaultPolicy, Resolution};
pub use dispatcher::{Dispatcher, PendingResolution};
pub use errors::{CoreError, ResolutionError, StoreError};
pub use models::{BlobRef, CommitResult, Document, DocumentFlags, DocumentReplication, Revision};
pub use notify::{NotificationEmitter, Subscription};
pub use store::SqliteStore;
