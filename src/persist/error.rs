use thiserror::Error;

use crate::persist::adapter::StorageError;

/// Errors reported by the persistence middleware.
///
/// These never propagate out of a state update; they reach the caller only
/// through the configured error observer or an explicit
/// [`flush`](crate::Persisted::flush).
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to encode persisted state: {0}")]
    Encode(String),
}
