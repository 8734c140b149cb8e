//! Durable persistence for stores.
//!
//! This module wraps a [`Store`](crate::Store) with a storage adapter:
//! state is rehydrated from the adapter on construction and written back
//! after every committed transition, coalescing bursts into a single
//! physical write. Persistence is a side effect — storage faults are
//! reported and retried, never surfaced from a state update.

mod adapter;
mod envelope;
mod error;
mod persist;

pub use adapter::{FileStorage, MemoryStorage, StorageAdapter, StorageError, StorageResult};
pub use envelope::Envelope;
pub use error::PersistError;
pub use persist::{PersistOptions, Persisted, DEFAULT_DEBOUNCE_MS};
