//! Scheme-keyed construction of state stores.
//!
//! The registry is a plain value owned by whoever opens stores. Callers that
//! need another backend register a constructor for its scheme before opening.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::StateStore;
use crate::document::{DocumentStateStore, LockSettings};
use crate::error::{self, StateError};
use crate::object::{LocalFsStorage, MemoryStorage};
use crate::postgres::PostgresStateStore;
use crate::sqlite::SqliteStateStore;

/// Default state store location when the project names none.
pub const DEFAULT_STATE_URI: &str = "sqlite://.elflow/state.db";

/// Where and how to open a state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateStoreSettings {
    pub uri: String,
    #[serde(default, with = "lock_settings_serde")]
    pub lock: LockSettings,
}

impl StateStoreSettings {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            lock: LockSettings::default(),
        }
    }

    /// Scheme and remainder of the URI, e.g. `("file", "/var/state")`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidUri`] if the URI has no `scheme://` prefix.
    pub fn split_uri(&self) -> error::Result<(&str, &str)> {
        match self.uri.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() => Ok((scheme, rest)),
            _ => Err(StateError::InvalidUri {
                uri: self.uri.clone(),
                reason: "expected <scheme>://<location>".into(),
            }),
        }
    }
}

impl Default for StateStoreSettings {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_URI)
    }
}

/// Constructor for one URI scheme.
pub type StoreConstructor = fn(&StateStoreSettings) -> error::Result<Arc<dyn StateStore>>;

/// Map from URI scheme to store constructor.
#[derive(Clone)]
pub struct StateStoreRegistry {
    constructors: BTreeMap<String, StoreConstructor>,
}

impl StateStoreRegistry {
    /// Registry without any schemes.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with the built-in `sqlite`, `postgres`, `postgresql`, `file`
    /// and `memory` schemes.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("sqlite", open_sqlite);
        registry.register("postgres", open_postgres);
        registry.register("postgresql", open_postgres);
        registry.register("file", open_local);
        registry.register("memory", open_memory);
        registry
    }

    /// Add or replace the constructor for `scheme`.
    pub fn register(&mut self, scheme: impl Into<String>, constructor: StoreConstructor) {
        self.constructors
            .insert(scheme.into().to_ascii_lowercase(), constructor);
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Open the store named by `settings.uri`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::UnsupportedScheme`] for an unregistered scheme,
    /// or the constructor's error.
    pub fn open(&self, settings: &StateStoreSettings) -> error::Result<Arc<dyn StateStore>> {
        let (scheme, _) = settings.split_uri()?;
        let constructor = self
            .constructors
            .get(&scheme.to_ascii_lowercase())
            .ok_or_else(|| StateError::UnsupportedScheme(scheme.to_string()))?;
        let store = constructor(settings)?;
        tracing::debug!(backend = store.kind(), uri = %settings.uri, "Opened state store");
        Ok(store)
    }
}

impl Default for StateStoreRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for StateStoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

fn location(settings: &StateStoreSettings) -> error::Result<&str> {
    let (_, rest) = settings.split_uri()?;
    if rest.is_empty() {
        return Err(StateError::InvalidUri {
            uri: settings.uri.clone(),
            reason: "missing location".into(),
        });
    }
    Ok(rest)
}

fn open_sqlite(settings: &StateStoreSettings) -> error::Result<Arc<dyn StateStore>> {
    let rest = location(settings)?;
    if rest == ":memory:" {
        return Ok(Arc::new(SqliteStateStore::in_memory()?));
    }
    Ok(Arc::new(SqliteStateStore::open(&PathBuf::from(rest))?))
}

fn open_postgres(settings: &StateStoreSettings) -> error::Result<Arc<dyn StateStore>> {
    location(settings)?;
    Ok(Arc::new(PostgresStateStore::open(&settings.uri)?))
}

fn open_local(settings: &StateStoreSettings) -> error::Result<Arc<dyn StateStore>> {
    let storage = LocalFsStorage::new(location(settings)?)?;
    Ok(Arc::new(DocumentStateStore::local(storage, settings.lock)))
}

fn open_memory(settings: &StateStoreSettings) -> error::Result<Arc<dyn StateStore>> {
    let (_, name) = settings.split_uri()?;
    let storage = MemoryStorage::new(name);
    Ok(Arc::new(DocumentStateStore::memory(storage, settings.lock)))
}

/// Lock settings as seconds/milliseconds in project files.
mod lock_settings_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::document::LockSettings;

    #[derive(Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Raw {
        #[serde(default)]
        timeout_secs: Option<u64>,
        #[serde(default)]
        initial_delay_ms: Option<u64>,
        #[serde(default)]
        max_delay_ms: Option<u64>,
        #[serde(default)]
        stale_lock_after_secs: Option<u64>,
    }

    pub fn serialize<S: Serializer>(lock: &LockSettings, serializer: S) -> Result<S::Ok, S::Error> {
        Raw {
            timeout_secs: Some(lock.timeout.as_secs()),
            initial_delay_ms: u64::try_from(lock.initial_delay.as_millis()).ok(),
            max_delay_ms: u64::try_from(lock.max_delay.as_millis()).ok(),
            stale_lock_after_secs: Some(lock.stale_lock_after.as_secs()),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LockSettings, D::Error> {
        let raw = Raw::deserialize(deserializer)?;
        let defaults = LockSettings::default();
        Ok(LockSettings {
            timeout: raw.timeout_secs.map_or(defaults.timeout, Duration::from_secs),
            initial_delay: raw
                .initial_delay_ms
                .map_or(defaults.initial_delay, Duration::from_millis),
            max_delay: raw.max_delay_ms.map_or(defaults.max_delay, Duration::from_millis),
            stale_lock_after: raw
                .stale_lock_after_secs
                .map_or(defaults.stale_lock_after, Duration::from_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elflow_types::state::{StateId, StateRecord};
    use serde_json::json;
    use std::time::Duration;

    fn record(id: &str) -> StateRecord {
        StateRecord::complete(id, json!({"k": 1}).as_object().cloned().unwrap())
    }

    #[test]
    fn opens_builtin_schemes() {
        let registry = StateStoreRegistry::with_defaults();
        let dir = tempfile::tempdir().unwrap();

        let sqlite = registry
            .open(&StateStoreSettings::new("sqlite://:memory:"))
            .unwrap();
        assert_eq!(sqlite.kind(), "sqlite");

        let file_uri = format!("file://{}", dir.path().join("states").display());
        let local = registry.open(&StateStoreSettings::new(file_uri)).unwrap();
        assert_eq!(local.kind(), "file");
        local.set(&record("a")).unwrap();
        assert!(dir.path().join("states").join("a").join("state.json").exists());

        let memory = registry
            .open(&StateStoreSettings::new("memory://bucket"))
            .unwrap();
        assert_eq!(memory.kind(), "memory");
    }

    #[test]
    fn sqlite_file_uri_uses_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("state.db");
        let uri = format!("sqlite://{}", path.display());
        let store = StateStoreRegistry::with_defaults()
            .open(&StateStoreSettings::new(uri))
            .unwrap();
        store.set(&record("a")).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let Err(err) = StateStoreRegistry::with_defaults()
            .open(&StateStoreSettings::new("s3://bucket/prefix"))
        else {
            panic!("s3:// should not open");
        };
        assert!(matches!(err, StateError::UnsupportedScheme(ref s) if s == "s3"));
    }

    #[test]
    fn malformed_uri_is_rejected() {
        let Err(err) = StateStoreRegistry::with_defaults().open(&StateStoreSettings::new("state.db"))
        else {
            panic!("a bare path should not open");
        };
        assert!(matches!(err, StateError::InvalidUri { .. }));
    }

    #[test]
    fn custom_scheme_can_be_registered() {
        fn open_mock(_: &StateStoreSettings) -> error::Result<Arc<dyn StateStore>> {
            Ok(Arc::new(SqliteStateStore::in_memory()?))
        }
        let mut registry = StateStoreRegistry::empty();
        assert!(registry.open(&StateStoreSettings::new("mock://x")).is_err());
        registry.register("MOCK", open_mock);
        let store = registry.open(&StateStoreSettings::new("mock://x")).unwrap();
        store.set(&record("a")).unwrap();
        assert!(store.get(&StateId::new("a")).unwrap().is_some());
        assert_eq!(registry.schemes().collect::<Vec<_>>(), vec!["mock"]);
    }

    #[test]
    fn settings_deserialize_with_partial_lock_section() {
        let settings: StateStoreSettings = serde_json::from_value(json!({
            "uri": "file:///tmp/x",
            "lock": {"timeout_secs": 3}
        }))
        .unwrap();
        assert_eq!(settings.lock.timeout, Duration::from_secs(3));
        assert_eq!(settings.lock.max_delay, LockSettings::default().max_delay);

        let bare: StateStoreSettings =
            serde_json::from_value(json!({"uri": "memory://m"})).unwrap();
        assert_eq!(bare.lock, LockSettings::default());
    }
}
