//! State store trait definition and the merge rule shared by every backend.
//!
//! [`StateStore`] defines the storage contract for bookmark state. Model
//! types live in [`elflow_types::state`].

use chrono::Utc;
use elflow_types::state::{merge_state, StateId, StateKind, StateMap, StateRecord};

use crate::error;

/// Storage contract for bookmark state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateStore>`.
pub trait StateStore: Send + Sync {
    /// Short backend name used in logs (`"sqlite"`, `"file"`, ...).
    fn kind(&self) -> &'static str;

    /// Persist `state` according to [`apply_update`].
    ///
    /// Complete writes overwrite without locking. Partial writes are a
    /// read-modify-write and run either inside a transaction or under
    /// [`StateStore::acquire_lock`].
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure,
    /// or `StateLocked` when a strict backend cannot obtain the lock.
    fn set(&self, state: &StateRecord) -> error::Result<()>;

    /// Read the stored record for `state_id`.
    ///
    /// Returns `Ok(None)` when nothing has been persisted yet. Use
    /// [`StateRecord::merged`] for the effective state.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get(&self, state_id: &StateId) -> error::Result<Option<StateRecord>>;

    /// Delete all state for `state_id`. Clearing an absent id is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn clear(&self, state_id: &StateId) -> error::Result<()>;

    /// List stored ids, optionally filtered by a glob pattern. Sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure or
    /// an invalid pattern.
    fn get_state_ids(&self, pattern: Option<&str>) -> error::Result<Vec<StateId>>;

    /// Enter the critical section for `state_id`. Released when the guard drops.
    ///
    /// # Errors
    ///
    /// Returns `StateLocked` (strict backends) on timeout and `LockReentry`
    /// if the caller already holds this lock.
    fn acquire_lock(&self, state_id: &StateId) -> error::Result<StateLockGuard<'_>>;
}

/// Scoped handle for a held state lock.
///
/// The release action runs exactly once: on [`StateLockGuard::release`] or on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct StateLockGuard<'a> {
    state_id: StateId,
    release: Option<Box<dyn FnOnce() + Send + 'a>>,
}

impl<'a> StateLockGuard<'a> {
    /// Guard that runs `release` when dropped.
    pub fn new(state_id: StateId, release: impl FnOnce() + Send + 'a) -> Self {
        Self {
            state_id,
            release: Some(Box::new(release)),
        }
    }

    /// Guard for backends whose writes are already atomic.
    pub fn noop(state_id: StateId) -> Self {
        Self {
            state_id,
            release: None,
        }
    }

    #[must_use]
    pub fn state_id(&self) -> &StateId {
        &self.state_id
    }

    /// Release explicitly instead of waiting for drop.
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for StateLockGuard<'_> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for StateLockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateLockGuard")
            .field("state_id", &self.state_id)
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Compute the record to store when `incoming` is written over `existing`.
///
/// Dispatches on `incoming.kind`, never on which maps are empty:
///
/// * [`StateKind::Complete`]: `completed_state` replaced wholesale, `partial_state` reset.
/// * [`StateKind::Partial`]: `partial_state` = deep-merge of incoming onto the
///   stored partial (incoming wins per leaf), `completed_state` untouched.
#[must_use]
pub fn apply_update(existing: Option<StateRecord>, incoming: &StateRecord) -> StateRecord {
    let now = Some(Utc::now());
    match incoming.kind {
        StateKind::Complete => StateRecord::stored(
            incoming.state_id.clone(),
            StateMap::new(),
            incoming.completed_state.clone(),
            now,
        ),
        StateKind::Partial => {
            let base = existing.unwrap_or_else(|| StateRecord::empty(incoming.state_id.clone()));
            StateRecord::stored(
                incoming.state_id.clone(),
                merge_state(&base.partial_state, &incoming.partial_state),
                base.completed_state,
                now,
            )
        }
    }
}

/// Filter and sort ids by an optional glob pattern.
///
/// # Errors
///
/// Returns `Pattern` if `pattern` is not a valid glob.
pub fn filter_state_ids(
    ids: impl IntoIterator<Item = StateId>,
    pattern: Option<&str>,
) -> error::Result<Vec<StateId>> {
    let matcher = pattern.map(glob::Pattern::new).transpose()?;
    let mut ids: Vec<StateId> = ids
        .into_iter()
        .filter(|id| matcher.as_ref().is_none_or(|m| m.matches(id.as_str())))
        .collect();
    ids.sort();
    ids.dedup();
    Ok(ids)
}
