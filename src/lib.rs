//! # Satchel
//!
//! Reactive state containers with draft-based immutable updates and
//! pluggable persistence.
//!
//! Satchel provides three layers that compose into an application's stores:
//!
//! ## Drafts (immutable updates)
//!
//! State values are immutable once published; transitions are expressed as
//! in-place edits to a [`Draft`] and materialized by [`produce`] into a new
//! value that shares untouched substructure with the old one:
//! - `produce` / `try_produce` - draft-based transitions
//! - [`Shared<T>`](Shared) - substructure shared by pointer between versions
//!
//! ## Stores (state containers)
//!
//! A [`Store`] owns one current state value and notifies subscribers
//! synchronously after every committed transition:
//! - `get` / `read` / `update` / `set` - access and transitions
//! - `subscribe` / `watch` - plain and selector-filtered subscriptions
//!
//! ## Persistence (durable stores)
//!
//! A [`Persisted`] store rehydrates from a [`StorageAdapter`] on startup and
//! writes a configurable subset of state back after every change, coalescing
//! bursts into a single physical write.
//!
//! ```
//! use satchel::{MemoryStorage, PersistOptions, Persisted};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Clone, Default, Serialize, Deserialize)]
//! struct Cart {
//!     items: Vec<String>,
//! }
//!
//! let storage = Arc::new(MemoryStorage::new());
//! let cart = Persisted::new(Cart::default(), storage, PersistOptions::new("cart"));
//!
//! cart.update(|draft| draft.items.push("p1".to_string()));
//! assert_eq!(cart.get().items.len(), 1);
//! ```

pub mod draft;
pub mod persist;
pub mod store;

// Re-export main types for convenience
pub use draft::{produce, try_produce, Draft, Shared};
pub use persist::{
    Envelope, FileStorage, MemoryStorage, PersistError, PersistOptions, Persisted, StorageAdapter,
    StorageError,
};
pub use store::{Store, Subscription};
