//! State store error types.

use std::time::Duration;

use elflow_types::state::StateId;

/// Boxed storage-driver error (`rusqlite`, `postgres`, ...).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by [`StateStore`](crate::StateStore) and
/// [`JobStore`](crate::JobStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying database or storage-driver failure.
    #[error("backend error: {0}")]
    Backend(#[source] BoxError),

    /// Backend failure annotated with the operation that failed.
    #[error("backend error during {context}: {source}")]
    BackendContext {
        context: &'static str,
        #[source]
        source: BoxError,
    },

    /// File-system I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored document or column could not be (de)serialized.
    #[error("invalid state document: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state backend lock poisoned")]
    LockPoisoned,

    /// Another writer held the lock for longer than the configured timeout.
    #[error("state '{state_id}' is locked by another process (waited {waited:?})")]
    StateLocked { state_id: StateId, waited: Duration },

    /// The calling thread asked for a lock it already holds.
    #[error("lock for state '{0}' is already held by this caller")]
    LockReentry(StateId),

    /// No backend is registered for the URI scheme.
    #[error("no state backend registered for scheme '{0}'")]
    UnsupportedScheme(String),

    /// The backend URI could not be interpreted.
    #[error("invalid state backend uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// A `get_state_ids` filter was not a valid glob.
    #[error("invalid state id pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// A stored row could not be interpreted.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StateError {
    /// Wrap a driver error.
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }

    /// Wrap a driver error with the name of the failing operation.
    pub fn backend_context(
        context: &'static str,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::BackendContext {
            context,
            source: Box::new(err),
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
