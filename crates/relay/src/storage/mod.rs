//! Storage traits and implementations
//!
//! This module defines the storage abstraction layer for syncs, runs and
//! tracked records. The trait-based design allows swapping between
//! in-memory and persistent storage implementations.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemorySyncStore;
pub use sqlite::SqliteSyncStore;
pub use traits::{DiscardOutcome, Scope, StaleRunError, StatusUpdate, SyncStore};
