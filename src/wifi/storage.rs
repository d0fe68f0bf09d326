//! Persistence of the WiFi credential and the picture counter.
//!
//! Layout inside the `storage` namespace:
//!
//! | Key             | Value                                   |
//! |-----------------|-----------------------------------------|
//! | `previous_ssid` | SSID, NUL-padded to 33 bytes            |
//! | `previous_pwd`  | password, NUL-padded to 65 bytes        |
//! | `pic_number`    | picture counter, little-endian `u32`    |

use crate::config::WifiCredential;
use crate::store::{KvStore, StoreError};
use log::{info, warn};
use zeroize::Zeroize;

/// Namespace holding every persisted value.
pub const STORAGE_NAMESPACE: &str = "storage";

/// Key for the stored SSID blob.
pub const SSID_KEY: &str = "previous_ssid";

/// Key for the stored password blob.
pub const PASSWORD_KEY: &str = "previous_pwd";

/// Key for the picture counter.
pub const PICTURE_NUMBER_KEY: &str = "pic_number";

/// Load the stored credential.
///
/// Returns `Ok(None)` if nothing is stored or the stored blobs no longer form
/// a valid credential. Only backend read failures are errors.
pub fn load_credential(store: &dyn KvStore) -> Result<Option<WifiCredential>, StoreError> {
    let Some(ssid) = store.get(SSID_KEY)? else {
        return Ok(None);
    };
    let mut password = store.get(PASSWORD_KEY)?.unwrap_or_default();

    let result = WifiCredential::from_blobs(&ssid, &password);
    password.zeroize();

    match result {
        Ok(credential) => Ok(Some(credential)),
        Err(e) => {
            warn!("Ignoring stored credential: {}", e);
            Ok(None)
        }
    }
}

/// Save the credential, then read it back to catch silent flash failures.
///
/// Both blobs are written before the single commit. If either write, the
/// commit or the read-back fails, the previous pair is restored so the store
/// never holds one network's SSID with another's password.
pub fn save_credential(
    store: &mut dyn KvStore,
    credential: &WifiCredential,
) -> Result<(), StoreError> {
    let previous_ssid = store.get(SSID_KEY)?;
    let mut previous_password = store.get(PASSWORD_KEY)?;

    let result = write_pair(store, credential);
    if let Err(ref e) = result {
        warn!("Saving credential failed ({}), restoring the previous one", e);
        if let Err(e) = restore_pair(store, previous_ssid.as_deref(), previous_password.as_deref()) {
            warn!("Could not restore previous credential: {}", e);
        }
    }
    if let Some(password) = previous_password.as_mut() {
        password.zeroize();
    }

    result?;
    info!("Credential for '{}' saved", credential.ssid_lossy());
    Ok(())
}

fn write_pair(store: &mut dyn KvStore, credential: &WifiCredential) -> Result<(), StoreError> {
    let ssid = credential.ssid_blob();
    let mut password = credential.password_blob();

    let written = store
        .set(SSID_KEY, &ssid)
        .and_then(|()| store.set(PASSWORD_KEY, &password))
        .and_then(|()| store.commit());
    password.zeroize();
    written?;

    match load_credential(store)? {
        Some(ref stored) if stored == credential => Ok(()),
        _ => Err(StoreError::Corrupt {
            key: SSID_KEY.to_string(),
            reason: "credential read back does not match".to_string(),
        }),
    }
}

fn restore_pair(
    store: &mut dyn KvStore,
    ssid: Option<&[u8]>,
    password: Option<&[u8]>,
) -> Result<(), StoreError> {
    for (key, value) in [(SSID_KEY, ssid), (PASSWORD_KEY, password)] {
        match value {
            Some(value) => store.set(key, value)?,
            None => store.remove(key)?,
        }
    }
    store.commit()
}

/// Forget the stored credential. The next boot goes straight to provisioning.
pub fn clear_credential(store: &mut dyn KvStore) -> Result<(), StoreError> {
    store.remove(SSID_KEY)?;
    store.remove(PASSWORD_KEY)?;
    store.commit()?;
    warn!("Stored WiFi credential cleared");
    Ok(())
}

/// Load the picture counter. A missing key means no picture was taken yet.
pub fn load_picture_number(store: &dyn KvStore) -> Result<u32, StoreError> {
    let Some(bytes) = store.get(PICTURE_NUMBER_KEY)? else {
        return Ok(0);
    };
    let raw: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| StoreError::Corrupt {
            key: PICTURE_NUMBER_KEY.to_string(),
            reason: format!("expected 4 bytes, found {}", bytes.len()),
        })?;
    Ok(u32::from_le_bytes(raw))
}

/// Persist the picture counter.
pub fn save_picture_number(store: &mut dyn KvStore, number: u32) -> Result<(), StoreError> {
    store.set(PICTURE_NUMBER_KEY, &number.to_le_bytes())?;
    store.commit()
}
