//! [`StateStore`] over object storage: one JSON document and one lock marker
//! per state id.
//!
//! Object storage has no transactions, so partial writes take an advisory
//! lock first. The lock is a marker object created with a create-if-absent
//! write; contenders retry with doubling delay until the configured timeout,
//! after which the backend's [`LockPolicy`] decides between failing and
//! proceeding unlocked.
//!
//! Layout, relative to the storage root:
//!
//! ```text
//! <encoded state id>/state.json   {"completed": {...}, "partial": {...}}
//! <encoded state id>/lock         {"holder_id": "...", "acquired_at": "..."}
//! ```

use std::collections::HashSet;
use std::sync::Mutex;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use elflow_types::state::{StateDocument, StateId, StateRecord};
use serde::{Deserialize, Serialize};

use crate::backend::{apply_update, filter_state_ids, StateLockGuard, StateStore};
use crate::error::{self, StateError};
use crate::object::{LocalFsStorage, MemoryStorage, ObjectStorage};

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "lock";

/// What to do when the lock cannot be obtained within the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Fail the write with [`StateError::StateLocked`].
    Strict,
    /// Log a warning and write without the lock.
    Optimistic,
}

/// Timing of lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// Total time to keep retrying before applying the [`LockPolicy`].
    pub timeout: Duration,
    /// First retry delay; doubles on every attempt.
    pub initial_delay: Duration,
    /// Upper bound for the retry delay.
    pub max_delay: Duration,
    /// Markers older than this are treated as abandoned and removed.
    pub stale_lock_after: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            stale_lock_after: Duration::from_secs(10 * 60),
        }
    }
}

/// Lock marker contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    holder_id: String,
    acquired_at: DateTime<Utc>,
}

/// Escape a state id into a single portable path segment.
///
/// ASCII alphanumerics, `-`, `_` and `.` pass through (except a leading `.`);
/// every other byte becomes `%XX`.
#[must_use]
pub fn encode_state_id(state_id: &StateId) -> String {
    let mut out = String::with_capacity(state_id.as_str().len());
    for (i, byte) in state_id.as_str().bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if plain {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Inverse of [`encode_state_id`]. `None` for malformed input.
#[must_use]
pub fn decode_state_id(encoded: &str) -> Option<StateId> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok().map(StateId::new)
}

/// State store over any [`ObjectStorage`].
pub struct DocumentStateStore<S: ObjectStorage> {
    storage: S,
    kind: &'static str,
    policy: LockPolicy,
    settings: LockSettings,
    holder_id: String,
    held: Mutex<HashSet<(StateId, ThreadId)>>,
}

/// Local-directory store. Strict: a timed-out lock fails the write.
pub type LocalFsStateStore = DocumentStateStore<LocalFsStorage>;

/// In-memory bucket store. Optimistic: a timed-out lock is logged and skipped.
pub type MemoryStateStore = DocumentStateStore<MemoryStorage>;

impl LocalFsStateStore {
    /// Store state documents under `storage`'s root directory.
    #[must_use]
    pub fn local(storage: LocalFsStorage, settings: LockSettings) -> Self {
        Self::new(storage, "file", LockPolicy::Strict, settings)
    }
}

impl MemoryStateStore {
    /// Store state documents in an in-memory bucket.
    #[must_use]
    pub fn memory(storage: MemoryStorage, settings: LockSettings) -> Self {
        Self::new(storage, "memory", LockPolicy::Optimistic, settings)
    }
}

impl<S: ObjectStorage> DocumentStateStore<S> {
    /// Build a store with an explicit lock policy.
    #[must_use]
    pub fn new(storage: S, kind: &'static str, policy: LockPolicy, settings: LockSettings) -> Self {
        Self {
            storage,
            kind,
            policy,
            settings,
            holder_id: uuid::Uuid::new_v4().to_string(),
            held: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn state_key(state_id: &StateId) -> String {
        format!("{}/{STATE_FILE}", encode_state_id(state_id))
    }

    fn lock_key(state_id: &StateId) -> String {
        format!("{}/{LOCK_FILE}", encode_state_id(state_id))
    }

    fn read(&self, state_id: &StateId) -> error::Result<Option<StateRecord>> {
        let key = Self::state_key(state_id);
        let Some(raw) = self.storage.get(&key)? else {
            return Ok(None);
        };
        let document: StateDocument = serde_json::from_slice(&raw)?;
        let updated_at = self.storage.modified_at(&key)?;
        Ok(Some(document.into_record(state_id.clone(), updated_at)))
    }

    fn write(&self, record: &StateRecord) -> error::Result<()> {
        let body = serde_json::to_vec(&record.to_document())?;
        self.storage.put(&Self::state_key(&record.state_id), &body)
    }

    fn held_key(state_id: &StateId) -> (StateId, ThreadId) {
        (state_id.clone(), std::thread::current().id())
    }

    fn mark_held(&self, state_id: &StateId) -> error::Result<(StateId, ThreadId)> {
        let key = Self::held_key(state_id);
        let mut held = self.held.lock().map_err(|_| StateError::LockPoisoned)?;
        if !held.insert(key.clone()) {
            return Err(StateError::LockReentry(state_id.clone()));
        }
        Ok(key)
    }

    fn unmark_held(&self, key: &(StateId, ThreadId)) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(key);
        }
    }

    /// Remove the marker if it has outlived `stale_lock_after`.
    ///
    /// Only the marker that was judged stale is deleted; a fresh marker
    /// written by a competitor in the meantime is left in place.
    fn break_abandoned_lock(&self, state_id: &StateId, key: &str) -> error::Result<bool> {
        let (Some(marker), Some(modified)) =
            (self.storage.get(key)?, self.storage.modified_at(key)?)
        else {
            // Released between our attempt and this check.
            return Ok(true);
        };
        let age = (Utc::now() - modified).to_std().unwrap_or_default();
        if age <= self.settings.stale_lock_after {
            return Ok(false);
        }
        if self.storage.delete_if_matches(key, &marker)? {
            tracing::warn!(
                state_id = %state_id,
                age_secs = age.as_secs(),
                "Removed abandoned state lock"
            );
        } else {
            tracing::debug!(state_id = %state_id, "State lock changed hands before it was broken");
        }
        Ok(true)
    }

    fn release(&self, held: &(StateId, ThreadId), owned: bool) {
        self.unmark_held(held);
        let state_id = &held.0;
        if !owned {
            return;
        }
        let key = Self::lock_key(state_id);
        let ours = match self.storage.get(&key) {
            Ok(Some(raw)) => serde_json::from_slice::<LockInfo>(&raw)
                .map(|info| info.holder_id == self.holder_id)
                .unwrap_or(false),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(state_id = %state_id, "Failed to read state lock on release: {e}");
                false
            }
        };
        if ours {
            if let Err(e) = self.storage.delete(&key) {
                tracing::warn!(state_id = %state_id, "Failed to release state lock: {e}");
            }
        }
    }

    fn try_acquire(&self, state_id: &StateId) -> error::Result<bool> {
        let key = Self::lock_key(state_id);
        let marker = serde_json::to_vec(&LockInfo {
            holder_id: self.holder_id.clone(),
            acquired_at: Utc::now(),
        })?;
        let mut delay = self.settings.initial_delay;
        let started = Instant::now();
        loop {
            if self.storage.put_if_absent(&key, &marker)? {
                return Ok(true);
            }
            if self.break_abandoned_lock(state_id, &key)? {
                continue;
            }
            let waited = started.elapsed();
            if waited >= self.settings.timeout {
                return match self.policy {
                    LockPolicy::Strict => Err(StateError::StateLocked {
                        state_id: state_id.clone(),
                        waited,
                    }),
                    LockPolicy::Optimistic => {
                        tracing::warn!(
                            state_id = %state_id,
                            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                            backend = self.kind,
                            "Timed out waiting for state lock, proceeding without it"
                        );
                        Ok(false)
                    }
                };
            }
            tracing::debug!(state_id = %state_id, delay_ms = delay.as_millis(), "State is locked, retrying");
            std::thread::sleep(delay.min(self.settings.timeout - waited));
            delay = delay.saturating_mul(2).min(self.settings.max_delay);
        }
    }
}

impl<S: ObjectStorage> StateStore for DocumentStateStore<S> {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn set(&self, state: &StateRecord) -> error::Result<()> {
        if state.is_empty_partial() {
            return Ok(());
        }
        if state.is_complete() {
            return self.write(&apply_update(None, state));
        }
        let _guard = self.acquire_lock(&state.state_id)?;
        let existing = self.read(&state.state_id)?;
        self.write(&apply_update(existing, state))
    }

    fn get(&self, state_id: &StateId) -> error::Result<Option<StateRecord>> {
        self.read(state_id)
    }

    fn clear(&self, state_id: &StateId) -> error::Result<()> {
        self.storage.delete(&Self::state_key(state_id))
    }

    fn get_state_ids(&self, pattern: Option<&str>) -> error::Result<Vec<StateId>> {
        let suffix = format!("/{STATE_FILE}");
        let ids = self
            .storage
            .list("")?
            .into_iter()
            .filter_map(|key| key.strip_suffix(&suffix).and_then(decode_state_id));
        filter_state_ids(ids, pattern)
    }

    fn acquire_lock(&self, state_id: &StateId) -> error::Result<StateLockGuard<'_>> {
        let held = self.mark_held(state_id)?;
        let owned = match self.try_acquire(state_id) {
            Ok(owned) => owned,
            Err(e) => {
                self.unmark_held(&held);
                return Err(e);
            }
        };
        Ok(StateLockGuard::new(state_id.clone(), move || {
            self.release(&held, owned);
        }))
    }
}
