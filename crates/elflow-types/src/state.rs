//! Bookmark state model types.
//!
//! Pure data types used by `StateStore` implementations. Kept in the types
//! crate so the store and the engine can share them without circular
//! dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A nested, JSON-compatible bookmark mapping.
pub type StateMap = Map<String, Value>;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque identifier of one resumable stream of work
/// (e.g. `"dev:tap-github-to-target-postgres"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(String);

impl StateId {
    /// Create a new state identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for StateId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

// ---------------------------------------------------------------------------
// Deep merge
// ---------------------------------------------------------------------------

/// Deep-merge `overlay` onto `base`, key by key.
///
/// Nested objects are merged recursively; any other value in `overlay`
/// (scalars, arrays, `null`) replaces the value in `base` at that key.
#[must_use]
pub fn merge_state(base: &StateMap, overlay: &StateMap) -> StateMap {
    let mut merged = base.clone();
    merge_into(&mut merged, overlay);
    merged
}

/// In-place variant of [`merge_state`].
pub fn merge_into(target: &mut StateMap, overlay: &StateMap) {
    for (key, incoming) in overlay {
        match (target.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                merge_into(existing, nested);
            }
            _ => {
                target.insert(key.clone(), incoming.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// State record
// ---------------------------------------------------------------------------

/// How a record is applied when written to a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    /// Replaces `completed_state` and resets `partial_state`.
    #[default]
    Complete,
    /// Deep-merged into `partial_state`. `completed_state` is never touched.
    Partial,
}

/// One unit of persisted bookmark state.
///
/// `completed_state` only ever holds bookmarks from the most recent fully
/// successful run; `partial_state` accumulates bookmarks observed since then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub state_id: StateId,
    #[serde(default)]
    pub kind: StateKind,
    #[serde(default)]
    pub partial_state: StateMap,
    #[serde(default)]
    pub completed_state: StateMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StateRecord {
    /// A record with no bookmarks at all.
    #[must_use]
    pub fn empty(state_id: impl Into<StateId>) -> Self {
        Self {
            state_id: state_id.into(),
            kind: StateKind::Complete,
            partial_state: StateMap::new(),
            completed_state: StateMap::new(),
            updated_at: None,
        }
    }

    /// State produced by a fully successful run.
    #[must_use]
    pub fn complete(state_id: impl Into<StateId>, completed_state: StateMap) -> Self {
        Self {
            completed_state,
            ..Self::empty(state_id)
        }
    }

    /// State observed by a run that has not (yet) finished successfully.
    #[must_use]
    pub fn partial(state_id: impl Into<StateId>, partial_state: StateMap) -> Self {
        Self {
            kind: StateKind::Partial,
            partial_state,
            ..Self::empty(state_id)
        }
    }

    /// A record read back from a store. It reads as partial while partial
    /// bookmarks are pending on top of the completed ones.
    #[must_use]
    pub fn stored(
        state_id: StateId,
        partial_state: StateMap,
        completed_state: StateMap,
        updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        let kind = if partial_state.is_empty() {
            StateKind::Complete
        } else {
            StateKind::Partial
        };
        Self {
            state_id,
            kind,
            partial_state,
            completed_state,
            updated_at,
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.kind == StateKind::Complete
    }

    /// A partial write with nothing in it. Stores skip these.
    #[must_use]
    pub fn is_empty_partial(&self) -> bool {
        self.kind == StateKind::Partial && self.partial_state.is_empty()
    }

    /// Effective, resumable state: `completed_state` with `partial_state`
    /// deep-merged on top.
    #[must_use]
    pub fn merged(&self) -> StateMap {
        merge_state(&self.completed_state, &self.partial_state)
    }

    /// The `bookmarks` entry of the effective state, if present.
    #[must_use]
    pub fn bookmarks(&self) -> Option<Value> {
        self.merged().remove("bookmarks")
    }

    /// Convert into the persisted document shape.
    #[must_use]
    pub fn to_document(&self) -> StateDocument {
        StateDocument {
            completed: self.completed_state.clone(),
            partial: self.partial_state.clone(),
        }
    }
}

/// Persisted shape of a state record for document (object storage) backends.
///
/// Exactly two top-level keys: `completed` and `partial`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateDocument {
    #[serde(default)]
    pub completed: StateMap,
    #[serde(default)]
    pub partial: StateMap,
}

impl StateDocument {
    /// Attach an id and timestamp, producing a [`StateRecord`].
    #[must_use]
    pub fn into_record(self, state_id: StateId, updated_at: Option<DateTime<Utc>>) -> StateRecord {
        StateRecord::stored(state_id, self.partial, self.completed, updated_at)
    }
}
