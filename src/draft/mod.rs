//! Draft-based immutable updates with structural sharing.
//!
//! This module provides the core building blocks for expressing state
//! transitions as in-place edits:
//! - Drafts: single-use mutable views over an immutable state value
//! - `produce` / `try_produce`: materialize a draft into a new state value

mod draft;

pub use draft::{produce, try_produce, Draft, Shared};
