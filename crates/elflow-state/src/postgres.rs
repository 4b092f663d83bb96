//! `PostgreSQL`-backed implementation of [`StateStore`].
//!
//! Uses the sync `postgres` crate with a single `Mutex<Client>` for
//! thread safety. The `postgres` crate manages its own internal tokio
//! runtime, so this works from any thread (callers inside an async runtime
//! go through `spawn_blocking`).

use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use elflow_types::state::{StateId, StateRecord};
use postgres::{Client, GenericClient, NoTls};

use crate::backend::{apply_update, filter_state_ids, StateLockGuard, StateStore};
use crate::error::{self, StateError};
use crate::sqlite::{parse_map, parse_timestamp};

/// Idempotent DDL for the state table (`PostgreSQL` dialect).
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS state (
    state_id TEXT PRIMARY KEY,
    partial_state TEXT NOT NULL DEFAULT '{}',
    completed_state TEXT NOT NULL DEFAULT '{}',
    updated_at TEXT NOT NULL DEFAULT (now()::text)
);
";

/// `PostgreSQL`-backed state storage.
///
/// Create with [`PostgresStateStore::open`] providing a libpq-style
/// connection string or `postgresql://` URI.
pub struct PostgresStateStore {
    client: Mutex<Client>,
}

impl PostgresStateStore {
    /// Connect to a `PostgreSQL` database and initialize the state table.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if connection or DDL execution fails.
    pub fn open(connstr: &str) -> error::Result<Self> {
        let mut client = Client::connect(connstr, NoTls).map_err(StateError::backend)?;
        client
            .batch_execute(CREATE_TABLES)
            .map_err(StateError::backend)?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Acquire the client lock.
    fn lock_client(&self) -> error::Result<MutexGuard<'_, Client>> {
        self.client.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn read(
        client: &mut impl GenericClient,
        state_id: &StateId,
        for_update: bool,
    ) -> error::Result<Option<StateRecord>> {
        let sql = if for_update {
            "SELECT partial_state, completed_state, updated_at FROM state \
             WHERE state_id = $1 FOR UPDATE"
        } else {
            "SELECT partial_state, completed_state, updated_at FROM state WHERE state_id = $1"
        };
        let rows = client
            .query(sql, &[&state_id.as_str()])
            .map_err(|e| StateError::backend_context("get: select", e))?;

        match rows.first() {
            Some(row) => {
                let partial: String = row.get(0);
                let completed: String = row.get(1);
                let updated_at: String = row.get(2);
                Ok(Some(StateRecord::stored(
                    state_id.clone(),
                    parse_map(&partial)?,
                    parse_map(&completed)?,
                    parse_timestamp(&updated_at),
                )))
            }
            None => Ok(None),
        }
    }

    fn write(client: &mut impl GenericClient, record: &StateRecord) -> error::Result<()> {
        let updated_at = record.updated_at.unwrap_or_else(Utc::now).to_rfc3339();
        client
            .execute(
                "INSERT INTO state (state_id, partial_state, completed_state, updated_at) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (state_id) \
                 DO UPDATE SET partial_state = $2, completed_state = $3, updated_at = $4",
                &[
                    &record.state_id.as_str(),
                    &serde_json::to_string(&record.partial_state)?,
                    &serde_json::to_string(&record.completed_state)?,
                    &updated_at,
                ],
            )
            .map_err(|e| StateError::backend_context("set: upsert", e))?;
        Ok(())
    }
}

impl StateStore for PostgresStateStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    fn set(&self, state: &StateRecord) -> error::Result<()> {
        if state.is_empty_partial() {
            return Ok(());
        }
        let mut client = self.lock_client()?;
        if state.is_complete() {
            return Self::write(&mut *client, &apply_update(None, state));
        }

        let mut tx = client
            .transaction()
            .map_err(|e| StateError::backend_context("set: begin tx", e))?;
        // Insert-if-absent first so FOR UPDATE always has a row to lock.
        tx.execute(
            "INSERT INTO state (state_id, updated_at) VALUES ($1, $2) \
             ON CONFLICT (state_id) DO NOTHING",
            &[&state.state_id.as_str(), &Utc::now().to_rfc3339()],
        )
        .map_err(|e| StateError::backend_context("set: seed row", e))?;
        let existing = Self::read(&mut tx, &state.state_id, true)?;
        Self::write(&mut tx, &apply_update(existing, state))?;
        tx.commit()
            .map_err(|e| StateError::backend_context("set: commit", e))?;
        Ok(())
    }

    fn get(&self, state_id: &StateId) -> error::Result<Option<StateRecord>> {
        let mut client = self.lock_client()?;
        Self::read(&mut *client, state_id, false)
    }

    fn clear(&self, state_id: &StateId) -> error::Result<()> {
        let mut client = self.lock_client()?;
        client
            .execute("DELETE FROM state WHERE state_id = $1", &[&state_id.as_str()])
            .map_err(|e| StateError::backend_context("clear: delete", e))?;
        Ok(())
    }

    fn get_state_ids(&self, pattern: Option<&str>) -> error::Result<Vec<StateId>> {
        let mut client = self.lock_client()?;
        let rows = client
            .query("SELECT state_id FROM state", &[])
            .map_err(StateError::backend)?;
        filter_state_ids(
            rows.iter().map(|row| StateId::new(row.get::<_, String>(0))),
            pattern,
        )
    }

    fn acquire_lock(&self, state_id: &StateId) -> error::Result<StateLockGuard<'_>> {
        let key = state_id.as_str().to_string();
        self.lock_client()?
            .execute("SELECT pg_advisory_lock(hashtext($1))", &[&key])
            .map_err(|e| StateError::backend_context("acquire_lock", e))?;

        Ok(StateLockGuard::new(state_id.clone(), move || {
            let unlocked = self.lock_client().and_then(|mut client| {
                client
                    .execute("SELECT pg_advisory_unlock(hashtext($1))", &[&key])
                    .map_err(|e| StateError::backend_context("release_lock", e))
            });
            if let Err(e) = unlocked {
                tracing::warn!(state_id = key, "Failed to release advisory lock: {e}");
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elflow_types::state::StateMap;
    use serde_json::{json, Value};

    /// Helper: get Postgres connection string from env or skip test.
    fn test_connstr() -> String {
        std::env::var("TEST_POSTGRES_URL")
            .expect("TEST_POSTGRES_URL not set; skipping Postgres integration test")
    }

    fn clean_table(store: &PostgresStateStore) {
        store
            .lock_client()
            .unwrap()
            .batch_execute("DELETE FROM state;")
            .unwrap();
    }

    fn map(value: Value) -> StateMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    #[ignore = "requires TEST_POSTGRES_URL"]
    fn partial_then_complete() {
        let store = PostgresStateStore::open(&test_connstr()).unwrap();
        clean_table(&store);
        let id = StateId::new("pg:a-to-b");

        store
            .set(&StateRecord::partial("pg:a-to-b", map(json!({"bookmarks": {"a": 1}}))))
            .unwrap();
        store
            .set(&StateRecord::partial("pg:a-to-b", map(json!({"bookmarks": {"b": 2}}))))
            .unwrap();
        let got = store.get(&id).unwrap().unwrap();
        assert_eq!(
            Value::Object(got.partial_state),
            json!({"bookmarks": {"a": 1, "b": 2}})
        );

        store
            .set(&StateRecord::complete("pg:a-to-b", map(json!({"bookmarks": {"c": 3}}))))
            .unwrap();
        let got = store.get(&id).unwrap().unwrap();
        assert!(got.partial_state.is_empty());
    }

    #[test]
    #[ignore = "requires TEST_POSTGRES_URL"]
    fn clear_and_list() {
        let store = PostgresStateStore::open(&test_connstr()).unwrap();
        clean_table(&store);
        store
            .set(&StateRecord::complete("dev:x", map(json!({"k": 1}))))
            .unwrap();
        assert_eq!(store.get_state_ids(Some("dev:*")).unwrap().len(), 1);
        store.clear(&StateId::new("dev:x")).unwrap();
        assert!(store.get(&StateId::new("dev:x")).unwrap().is_none());
    }

    #[test]
    #[ignore = "requires TEST_POSTGRES_URL"]
    fn advisory_lock_roundtrip() {
        let store = PostgresStateStore::open(&test_connstr()).unwrap();
        let guard = store.acquire_lock(&StateId::new("dev:x")).unwrap();
        guard.release();
    }
}
