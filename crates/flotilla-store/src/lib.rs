#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **flotilla-store** – Persistence layer for Flotilla.
//!
//! Two concerns live here, both defined as traits with in-memory and
//! production-shaped implementations:
//!
//! - **Event persistence**: an append-only log behind [`EventStoreBackend`],
//!   fronted by [`BufferedEventStore`] which batches writes (flush on size or
//!   interval), retries failed batches without ever dropping an event, and
//!   flushes before every read for read-your-writes consistency.
//! - **Agent state persistence**: [`StateStorage`] for the durable
//!   [`SavedState`](flotilla_types::SavedState) snapshots written by the
//!   persistent state machine, with a memory backend for tests and an
//!   atomic temp-file-rename file backend for production.

use thiserror::Error;

mod event_store;
mod state_storage;

pub use event_store::{BufferedEventStore, EventStoreBackend, MemoryEventStore};
pub use state_storage::{FileStateStorage, MemoryStateStorage, StateStorage};

/// Event type emitted on the bus when a flush or save fails.
pub const PERSISTENCE_ERROR_EVENT: &str = "persistence:error";

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store was closed; no further appends are accepted.
    #[error("event store is closed")]
    Closed,
    /// A flush could not commit its batch; the events remain buffered.
    #[error("flush failed: {0}")]
    FlushFailed(String),
    /// An agent id is not usable as a storage key.
    #[error("invalid agent id for storage: {0}")]
    InvalidAgentId(String),
    /// Backend query failed.
    #[error("backend query failed: {0}")]
    Query(String),
}
