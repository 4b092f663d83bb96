//! Operator-level state manipulation over any [`StateStore`].

use std::sync::Arc;

use elflow_types::state::{StateId, StateMap, StateRecord};
use serde_json::Value;

use crate::backend::StateStore;
use crate::error::{self, StateError};

/// Thin facade used by the CLI `state` subcommands.
#[derive(Clone)]
pub struct StateService {
    store: Arc<dyn StateStore>,
}

impl StateService {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Ids matching `pattern`, sorted.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn list(&self, pattern: Option<&str>) -> error::Result<Vec<StateId>> {
        self.store.get_state_ids(pattern)
    }

    /// Effective (merged) state, `None` if never set.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn get(&self, state_id: &StateId) -> error::Result<Option<StateMap>> {
        Ok(self.store.get(state_id)?.map(|record| record.merged()))
    }

    /// Write a JSON object as complete or partial state.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Corrupt`] if `raw` is not a JSON object, or
    /// propagates store errors.
    pub fn set_json(&self, state_id: &StateId, raw: &str, partial: bool) -> error::Result<()> {
        let map = match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            other => {
                return Err(StateError::Corrupt(format!(
                    "state must be a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };
        let record = if partial {
            StateRecord::partial(state_id.clone(), map)
        } else {
            StateRecord::complete(state_id.clone(), map)
        };
        self.store.set(&record)
    }

    /// Merge `src`'s effective state into `dst` as a partial write.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Corrupt`] if `src` has no state, or propagates
    /// store errors.
    pub fn merge_state(&self, src: &StateId, dst: &StateId) -> error::Result<()> {
        let state = self.require(src)?;
        self.store.set(&StateRecord::partial(dst.clone(), state))
    }

    /// Overwrite `dst` with `src`'s effective state as a complete write.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Corrupt`] if `src` has no state, or propagates
    /// store errors.
    pub fn copy_state(&self, src: &StateId, dst: &StateId) -> error::Result<()> {
        let state = self.require(src)?;
        self.store.set(&StateRecord::complete(dst.clone(), state))
    }

    /// Copy then clear `src`.
    ///
    /// # Errors
    ///
    /// See [`StateService::copy_state`].
    pub fn move_state(&self, src: &StateId, dst: &StateId) -> error::Result<()> {
        self.copy_state(src, dst)?;
        self.store.clear(src)
    }

    /// # Errors
    ///
    /// Propagates store errors.
    pub fn clear(&self, state_id: &StateId) -> error::Result<()> {
        self.store.clear(state_id)
    }

    fn require(&self, state_id: &StateId) -> error::Result<StateMap> {
        self.get(state_id)?
            .ok_or_else(|| StateError::Corrupt(format!("no state stored for '{state_id}'")))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStateStore;
    use serde_json::json;

    fn service() -> StateService {
        StateService::new(Arc::new(SqliteStateStore::in_memory().unwrap()))
    }

    fn id(s: &str) -> StateId {
        StateId::new(s)
    }

    #[test]
    fn set_json_complete_and_partial() {
        let svc = service();
        svc.set_json(&id("a"), r#"{"bookmarks": {"x": 1}}"#, false)
            .unwrap();
        svc.set_json(&id("a"), r#"{"bookmarks": {"y": 2}}"#, true)
            .unwrap();
        let got = svc.get(&id("a")).unwrap().unwrap();
        assert_eq!(Value::Object(got), json!({"bookmarks": {"x": 1, "y": 2}}));
    }

    #[test]
    fn set_json_rejects_non_objects() {
        let svc = service();
        assert!(matches!(
            svc.set_json(&id("a"), "[1, 2]", false),
            Err(StateError::Corrupt(_))
        ));
        assert!(matches!(
            svc.set_json(&id("a"), "{not json", false),
            Err(StateError::Json(_))
        ));
    }

    #[test]
    fn copy_overwrites_destination() {
        let svc = service();
        svc.set_json(&id("src"), r#"{"bookmarks": {"s": 1}}"#, false)
            .unwrap();
        svc.set_json(&id("dst"), r#"{"bookmarks": {"d": 1}}"#, false)
            .unwrap();
        svc.copy_state(&id("src"), &id("dst")).unwrap();
        assert_eq!(
            Value::Object(svc.get(&id("dst")).unwrap().unwrap()),
            json!({"bookmarks": {"s": 1}})
        );
    }

    #[test]
    fn merge_keeps_destination_keys() {
        let svc = service();
        svc.set_json(&id("src"), r#"{"bookmarks": {"s": 1}}"#, false)
            .unwrap();
        svc.set_json(&id("dst"), r#"{"bookmarks": {"d": 1}}"#, false)
            .unwrap();
        svc.merge_state(&id("src"), &id("dst")).unwrap();
        assert_eq!(
            Value::Object(svc.get(&id("dst")).unwrap().unwrap()),
            json!({"bookmarks": {"d": 1, "s": 1}})
        );
    }

    #[test]
    fn move_clears_source() {
        let svc = service();
        svc.set_json(&id("src"), r#"{"k": 1}"#, false).unwrap();
        svc.move_state(&id("src"), &id("dst")).unwrap();
        assert!(svc.get(&id("src")).unwrap().is_none());
        assert_eq!(svc.list(None).unwrap(), vec![id("dst")]);
    }

    #[test]
    fn copy_from_missing_source_fails() {
        let svc = service();
        assert!(svc.copy_state(&id("nope"), &id("dst")).is_err());
        assert!(svc.get(&id("dst")).unwrap().is_none());
    }
}
