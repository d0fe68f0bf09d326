//! NVS-backed key-value store for ESP32.
//!
//! Credentials and the picture counter live in ESP32's Non-Volatile Storage
//! under the `storage` namespace so they persist across reboots.
//!
//! # Security
//!
//! Values are stored unencrypted unless NVS encryption is enabled in the
//! partition table.
//!
//! # Atomicity
//!
//! `EspNvs` commits every `set` on its own, so a multi-key update is not a
//! single NVS transaction. Failed writes are rolled back by the caller
//! ([`crate::wifi::save_credential`]); a power loss between the two
//! credential writes can still leave a mixed pair, which fails to connect
//! and sends the device back into provisioning.
//!
//! # Usage
//!
//! ```ignore
//! use camstream_esp32::persistence::NvsStore;
//! use esp_idf_svc::nvs::EspDefaultNvsPartition;
//!
//! // `take()` erases and re-initialises the partition when it is full or
//! // was written by a newer NVS version.
//! let partition = EspDefaultNvsPartition::take()?;
//! let store = NvsStore::new(partition.clone())?;
//! ```

use crate::store::{KvStore, StoreError};
use crate::wifi::STORAGE_NAMESPACE;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_sys::EspError;
use log::info;

/// NVS-backed [`KvStore`].
pub struct NvsStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsStore {
    /// Open the `storage` namespace read-write.
    pub fn new(partition: EspDefaultNvsPartition) -> Result<Self, StoreError> {
        let nvs = EspNvs::new(partition, STORAGE_NAMESPACE, true)
            .map_err(|e| StoreError::Init(format!("{:?}", e)))?;
        info!("NVS namespace '{}' opened", STORAGE_NAMESPACE);
        Ok(Self { nvs })
    }
}

fn read_err(key: &str, e: EspError) -> StoreError {
    StoreError::Read {
        key: key.to_string(),
        reason: format!("{:?}", e),
    }
}

fn write_err(key: &str, e: EspError) -> StoreError {
    StoreError::Write {
        key: key.to_string(),
        reason: format!("{:?}", e),
    }
}

impl KvStore for NvsStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(len) = self.nvs.blob_len(key).map_err(|e| read_err(key, e))? else {
            return Ok(None);
        };

        let mut buf = vec![0u8; len];
        let bytes = self
            .nvs
            .get_raw(key, &mut buf)
            .map_err(|e| read_err(key, e))?;
        Ok(bytes.map(|b| b.to_vec()))
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        // EspNvs commits after every write; `commit` stays the default no-op
        self.nvs
            .set_raw(key, value)
            .map_err(|e| write_err(key, e))?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.nvs.remove(key).map_err(|e| write_err(key, e))?;
        Ok(())
    }
}
