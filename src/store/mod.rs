//! High-level state management with stores.
//!
//! Stores provide a convenient abstraction for managing complex application
//! state with draft-based updates, automatic change detection, and
//! subscription handles.

mod store;

pub use store::{Store, Subscription};
