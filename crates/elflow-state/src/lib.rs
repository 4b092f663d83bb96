//! Bookmark state persistence and job run records for elflow.
//!
//! Provides the [`StateStore`] trait with transactional (`SQLite`,
//! `PostgreSQL`) and lock-marker (local directory, in-memory bucket)
//! implementations, a scheme-keyed [`StateStoreRegistry`], and the
//! [`JobStore`] used by the job runner.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod document;
pub mod error;
pub mod jobs;
pub mod object;
pub mod postgres;
pub mod registry;
pub mod service;
pub mod sqlite;

pub use backend::{StateLockGuard, StateStore};
pub use document::{DocumentStateStore, LockPolicy, LockSettings};
pub use error::StateError;
pub use jobs::{JobStore, SqliteJobStore};
pub use registry::{StateStoreRegistry, StateStoreSettings};
pub use service::StateService;
pub use sqlite::SqliteStateStore;

/// Common imports for consumers of this crate.
pub mod prelude {
    pub use crate::backend::StateStore;
    pub use crate::document::{LocalFsStateStore, MemoryStateStore};
    pub use crate::error::StateError;
    pub use crate::jobs::{JobStore, SqliteJobStore};
    pub use crate::postgres::PostgresStateStore;
    pub use crate::registry::{StateStoreRegistry, StateStoreSettings};
    pub use crate::sqlite::SqliteStateStore;
    pub use elflow_types::state::{StateId, StateKind, StateMap, StateRecord};
}
