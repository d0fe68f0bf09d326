//! Key-value store for host (development) builds.
//!
//! Stores each key as a file inside a namespace directory so credentials and
//! the picture counter persist across runs. Uses `<dir>/storage/<key>`.
//!
//! # Usage
//!
//! ```ignore
//! use camstream_esp32::persistence_host::FileKvStore;
//!
//! let store = FileKvStore::open(".camstream")?;
//! ```

use crate::store::{KvStore, StoreError};
use crate::wifi::STORAGE_NAMESPACE;
use log::{debug, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File-backed [`KvStore`].
#[derive(Debug)]
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    /// Open (creating if needed) the store under `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = root.as_ref().join(STORAGE_NAMESPACE);
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Init(format!("{}: {}", dir.display(), e)))?;
        info!("Key-value store at {:?}", dir);
        Ok(Self { dir })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.key_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No value stored for '{}'", key);
                Ok(None)
            }
            Err(e) => Err(StoreError::Read {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let write_err = |e: io::Error| StoreError::Write {
            key: key.to_string(),
            reason: e.to_string(),
        };

        // Write to a sibling file and rename so a crash never leaves a
        // half-written value behind.
        let path = self.key_path(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value).map_err(write_err)?;
        fs::rename(&tmp, &path).map_err(write_err)?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Write {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Counter to ensure unique test directories even in parallel execution
    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_store_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        env::temp_dir().join(format!("camstream-kv-test-{}-{}", pid, id))
    }

    #[test]
    fn test_roundtrip() {
        let dir = unique_store_dir();
        let mut store = FileKvStore::open(&dir).unwrap();

        assert_eq!(store.get("pic_number").unwrap(), None);
        store.set("pic_number", &7u32.to_le_bytes()).unwrap();
        assert_eq!(
            store.get("pic_number").unwrap(),
            Some(7u32.to_le_bytes().to_vec())
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = unique_store_dir();
        {
            let mut store = FileKvStore::open(&dir).unwrap();
            store.set("previous_ssid", b"home").unwrap();
        }

        let store = FileKvStore::open(&dir).unwrap();
        assert_eq!(store.get("previous_ssid").unwrap(), Some(b"home".to_vec()));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_remove_missing_key_is_ok() {
        let dir = unique_store_dir();
        let mut store = FileKvStore::open(&dir).unwrap();
        assert!(store.remove("never_written").is_ok());

        let _ = fs::remove_dir_all(&dir);
    }
}
