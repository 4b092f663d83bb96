//! Object storage abstraction used by the document state stores.
//!
//! The contract is the small subset of cloud object-storage semantics the
//! lock-marker protocol needs: whole-object reads and writes, a
//! create-if-absent write, idempotent delete, prefix listing, and a
//! last-modified timestamp.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::error::{self, StateError};

/// Storage backend for keyed blobs.
///
/// Keys are `/`-separated relative paths.
pub trait ObjectStorage: Send + Sync {
    /// Human-readable location for logs.
    fn describe(&self) -> String;

    /// Read an object. `Ok(None)` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn get(&self, key: &str) -> error::Result<Option<Vec<u8>>>;

    /// Write an object unconditionally, replacing any previous content.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn put(&self, key: &str, data: &[u8]) -> error::Result<()>;

    /// Write only if the object does not exist yet.
    ///
    /// Returns `false` (not an error) when the object already exists.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn put_if_absent(&self, key: &str, data: &[u8]) -> error::Result<bool>;

    /// Delete an object. Deleting a missing object succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn delete(&self, key: &str) -> error::Result<()>;

    /// Delete an object only if its content is still `expected`.
    ///
    /// Returns `false` when the object is missing or holds something else.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn delete_if_matches(&self, key: &str, expected: &[u8]) -> error::Result<bool>;

    /// All keys starting with `prefix`, in arbitrary order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn list(&self, prefix: &str) -> error::Result<Vec<String>>;

    /// Last modification time of an object, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn modified_at(&self, key: &str) -> error::Result<Option<DateTime<Utc>>>;
}

// ---------------------------------------------------------------------------
// Local filesystem
// ---------------------------------------------------------------------------

/// Objects stored as files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalFsStorage {
    root: PathBuf,
}

impl LocalFsStorage {
    /// Use `root` as the storage root, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created.
    pub fn new(root: impl Into<PathBuf>) -> error::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/').fold(self.root.clone(), |path, part| path.join(part))
    }

    fn walk(&self, dir: &Path, keys: &mut Vec<String>) -> error::Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.walk(&path, keys)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl ObjectStorage for LocalFsStorage {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn get(&self, key: &str) -> error::Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> error::Result<()> {
        let path = self.path_for(key);
        let dir = path
            .parent()
            .ok_or_else(|| StateError::Corrupt(format!("object key '{key}' has no parent")))?;
        std::fs::create_dir_all(dir)?;
        // Write-then-rename so readers never observe a torn document.
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StateError::Io(e.error))?;
        Ok(())
    }

    fn put_if_absent(&self, key: &str, data: &[u8]) -> error::Result<bool> {
        let path = self.path_for(key);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(data)?;
                file.sync_all()?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> error::Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // Drop the per-state directory once it is empty; ignore failures.
        if let Some(dir) = path.parent().filter(|d| *d != self.root) {
            let _ = std::fs::remove_dir(dir);
        }
        Ok(())
    }

    fn delete_if_matches(&self, key: &str, expected: &[u8]) -> error::Result<bool> {
        let path = self.path_for(key);
        let Some(dir) = path.parent() else {
            return Ok(false);
        };
        // Move the object aside first so nobody else can replace it while
        // we compare.
        let aside = dir.join(format!(".{}.breaking", uuid::Uuid::new_v4()));
        match std::fs::rename(&path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        let matched = std::fs::read(&aside)? == expected;
        if !matched {
            // Put it back unless a new object took the key meanwhile.
            match std::fs::hard_link(&aside, &path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    let _ = std::fs::remove_file(&aside);
                    return Err(e.into());
                }
            }
        }
        std::fs::remove_file(&aside)?;
        Ok(matched)
    }

    fn list(&self, prefix: &str) -> error::Result<Vec<String>> {
        let mut keys = Vec::new();
        self.walk(&self.root, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        Ok(keys)
    }

    fn modified_at(&self, key: &str) -> error::Result<Option<DateTime<Utc>>> {
        match std::fs::metadata(self.path_for(key)) {
            Ok(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    modified_at: DateTime<Utc>,
}

/// In-memory object storage.
///
/// Thread-safe via `RwLock`. Stands in for a remote bucket in tests and
/// single-process setups; clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    name: String,
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Arc::default(),
        }
    }

    /// Overwrite an object's modification time (for lock-expiry tests).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockPoisoned`] if the map lock is poisoned.
    pub fn set_modified_at(&self, key: &str, at: DateTime<Utc>) -> error::Result<()> {
        let mut objects = self.objects.write().map_err(|_| StateError::LockPoisoned)?;
        if let Some(object) = objects.get_mut(key) {
            object.modified_at = at;
        }
        Ok(())
    }
}

impl ObjectStorage for MemoryStorage {
    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }

    fn get(&self, key: &str) -> error::Result<Option<Vec<u8>>> {
        let objects = self.objects.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(objects.get(key).map(|o| o.data.clone()))
    }

    fn put(&self, key: &str, data: &[u8]) -> error::Result<()> {
        let mut objects = self.objects.write().map_err(|_| StateError::LockPoisoned)?;
        objects.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                modified_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn put_if_absent(&self, key: &str, data: &[u8]) -> error::Result<bool> {
        let mut objects = self.objects.write().map_err(|_| StateError::LockPoisoned)?;
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                modified_at: Utc::now(),
            },
        );
        Ok(true)
    }

    fn delete(&self, key: &str) -> error::Result<()> {
        let mut objects = self.objects.write().map_err(|_| StateError::LockPoisoned)?;
        objects.remove(key);
        Ok(())
    }

    fn delete_if_matches(&self, key: &str, expected: &[u8]) -> error::Result<bool> {
        let mut objects = self.objects.write().map_err(|_| StateError::LockPoisoned)?;
        if objects.get(key).is_some_and(|o| o.data == expected) {
            objects.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    fn list(&self, prefix: &str) -> error::Result<Vec<String>> {
        let objects = self.objects.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn modified_at(&self, key: &str) -> error::Result<Option<DateTime<Utc>>> {
        let objects = self.objects.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(objects.get(key).map(|o| o.modified_at))
    }
}
