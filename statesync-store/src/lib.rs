//! # statesync-store
//!
//! File-backed JSON document store with an mtime-validated cache, atomic
//! writes, per-document version history and an optimistic update
//! coordinator.
//!
//! Construct a [`DocumentStore`] with a [`Fanout`](statesync_fanout::Fanout)
//! and share it behind `Arc`; every mutation is broadcast exactly once.

mod atomic;
pub mod cache;
pub mod coordinator;
pub mod history;
pub mod lock;
pub mod store;

pub use cache::CacheEntry;
pub use coordinator::OptimisticCoordinator;
pub use history::VersionHistory;
pub use lock::{DocumentLock, LockPolicy};
pub use store::DocumentStore;
