//! Durable key-value storage for the persisted provider choice.

use std::{
    collections::{BTreeMap, HashMap},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::{Error, Result};

/// A string key-value store that outlives the process.
pub trait ChoiceStore: Send + Sync {
    /// The value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

impl<T: ChoiceStore + ?Sized> ChoiceStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}

type Entries = BTreeMap<String, String>;

/// A [`ChoiceStore`] backed by a JSON object in a file.
///
/// A missing file is an empty store. The file and its parent directories are created on the first
/// write.
#[derive(Debug, Clone)]
pub struct FileChoiceStore {
    path: PathBuf,
}

impl FileChoiceStore {
    /// Create a store persisting to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileChoiceStore { path: path.into() }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Entries> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Entries::new()),
            Err(err) => return Err(err.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Entries::new());
        }
        serde_json::from_slice(&bytes).map_err(|err| Error::InvalidDocument {
            path: self.path.display().to_string(),
            source: err.into(),
        })
    }

    fn write(&self, entries: &Entries) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(entries)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl ChoiceStore for FileChoiceStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.read().unwrap_or_else(|err| {
            log::warn!(target: "flagswitch", "discarding unreadable state file: {}", err);
            Entries::new()
        });
        entries.insert(key.to_owned(), value.to_owned());
        log::debug!(target: "flagswitch", key, path:display = self.path.display(); "persisting value");
        self.write(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.read()?;
        if entries.remove(key).is_some() {
            self.write(&entries)?;
        }
        Ok(())
    }
}

/// A [`ChoiceStore`] that lives in memory only.
#[derive(Debug, Default)]
pub struct MemoryChoiceStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryChoiceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChoiceStore for MemoryChoiceStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(match self.entries.lock() {
            Ok(entries) => entries.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        match self.entries.lock() {
            Ok(mut entries) => entries.insert(key.to_owned(), value.to_owned()),
            Err(poisoned) => poisoned
                .into_inner()
                .insert(key.to_owned(), value.to_owned()),
        };
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.entries.lock() {
            Ok(mut entries) => entries.remove(key),
            Err(poisoned) => poisoned.into_inner().remove(key),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ChoiceStore, FileChoiceStore, MemoryChoiceStore};
    use crate::Error;

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = FileChoiceStore::new(&path);
        assert_eq!(store.get("providerChoice").unwrap(), None);
        store.set("providerChoice", "growthbook").unwrap();
        store.set("other", "value").unwrap();

        let reopened = FileChoiceStore::new(&path);
        assert_eq!(
            reopened.get("providerChoice").unwrap().as_deref(),
            Some("growthbook")
        );

        reopened.remove("providerChoice").unwrap();
        assert_eq!(store.get("providerChoice").unwrap(), None);
        assert_eq!(store.get("other").unwrap().as_deref(), Some("value"));
        reopened.remove("never-set").unwrap();
    }

    #[test]
    fn corrupt_file_is_reported_and_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = FileChoiceStore::new(&path);
        assert!(matches!(
            store.get("providerChoice"),
            Err(Error::InvalidDocument { .. })
        ));
        store.set("providerChoice", "flagd").unwrap();
        assert_eq!(store.get("providerChoice").unwrap().as_deref(), Some("flagd"));
    }

    #[test]
    fn memory_store() {
        let store = MemoryChoiceStore::new();
        store.set("providerChoice", "flagsmith").unwrap();
        assert_eq!(
            store.get("providerChoice").unwrap().as_deref(),
            Some("flagsmith")
        );
        store.remove("providerChoice").unwrap();
        assert_eq!(store.get("providerChoice").unwrap(), None);
    }
}
