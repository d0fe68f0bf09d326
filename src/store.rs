//! Key-value blob store used for credentials and the picture counter.
//!
//! Backends:
//! - [`crate::persistence::NvsStore`] - ESP32 NVS (ESP32 only)
//! - [`crate::persistence_host::FileKvStore`] - one file per key (host)
//! - [`MemoryStore`] - in-memory, for tests and simulation

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Blob store keyed by short strings.
///
/// Each call is atomic at the store boundary: a `set` either fully lands or
/// returns an error.
pub trait KvStore: Send {
    /// Read a blob. `Ok(None)` when the key was never written.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a blob, replacing any previous value.
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;

    /// Flush pending writes. Backends that write through can keep the default.
    fn commit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Store handle shared by the connectivity task, the provisioning listener
/// and the persistence consumer.
pub type SharedStore = Arc<Mutex<dyn KvStore>>;

/// Wrap a store for sharing.
pub fn shared<S: KvStore + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Lock a shared store. A panic in another holder does not make the store
/// unusable: every operation leaves it consistent.
pub fn lock(store: &SharedStore) -> MutexGuard<'_, dyn KvStore + 'static> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Errors from a store backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be opened.
    Init(String),
    /// A read failed.
    Read { key: String, reason: String },
    /// A write, remove or commit failed.
    Write { key: String, reason: String },
    /// A value was read back but does not have the expected shape.
    Corrupt { key: String, reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init(reason) => write!(f, "store init failed: {}", reason),
            Self::Read { key, reason } => write!(f, "read of '{}' failed: {}", key, reason),
            Self::Write { key, reason } => write!(f, "write of '{}' failed: {}", key, reason),
            Self::Corrupt { key, reason } => write!(f, "value of '{}' is corrupt: {}", key, reason),
        }
    }
}

impl std::error::Error for StoreError {}

/// In-memory store.
///
/// `fail_writes` makes every `set` fail and `fail_key` fails writes to a single
/// key, which tests use to inject storage faults.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: HashMap<String, Vec<u8>>,
    fail_writes: bool,
    fail_key: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Make writes to `key` fail, as if flash died halfway through a save.
    pub fn fail_writes_to(&mut self, key: &str) {
        self.fail_key = Some(key.to_string());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes || self.fail_key.as_deref() == Some(key) {
            return Err(StoreError::Write {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.values.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let mut store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);

        store.set("k", b"value").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"value".to_vec()));

        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_injected_failure() {
        let mut store = MemoryStore::new();
        store.set("k", b"old").unwrap();
        store.set_fail_writes(true);

        assert!(matches!(store.set("k", b"new"), Err(StoreError::Write { .. })));
        assert_eq!(store.get("k").unwrap(), Some(b"old".to_vec()));
    }

    #[test]
    fn test_shared_store_survives_poisoning() {
        let store = shared(MemoryStore::new());
        let clone = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("holder panicked");
        })
        .join();

        lock(&store).set("k", b"v").unwrap();
        assert_eq!(lock(&store).get("k").unwrap(), Some(b"v".to_vec()));
    }
}
