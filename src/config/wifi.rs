//! WiFi credential type.
//!
//! Platform-independent, so it can be tested on the host machine.
//!
//! # Example
//!
//! ```
//! use camstream_esp32::config::WifiCredential;
//!
//! let credential = WifiCredential::new("MyNetwork", "MyPassword").unwrap();
//! assert_eq!(credential.ssid(), b"MyNetwork");
//! assert!(!credential.is_open());
//! ```

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum SSID length per IEEE 802.11 standard.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum password length for WPA2.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Shortest WPA2 passphrase. Shorter passwords are still accepted; WEP keys
/// are 5 or 13 bytes.
pub const MIN_WPA_PASSWORD_LEN: usize = 8;

/// Size of the NUL-padded SSID blob kept in the credential store.
pub const SSID_BLOB_LEN: usize = MAX_SSID_LEN + 1;

/// Size of the NUL-padded password blob kept in the credential store.
pub const PASSWORD_BLOB_LEN: usize = MAX_PASSWORD_LEN + 1;

/// Length of an access point hardware address.
pub const BSSID_LEN: usize = 6;

/// Credentials for joining an access point.
///
/// Immutable once built. A newer credential replaces this one rather than
/// mutating it. The password is zeroed when the value is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct WifiCredential {
    ssid: Vec<u8>,
    password: Vec<u8>,
    bssid: Option<[u8; BSSID_LEN]>,
}

impl WifiCredential {
    /// Create a credential. An empty `password` means an open network.
    pub fn new(
        ssid: impl AsRef<[u8]>,
        password: impl AsRef<[u8]>,
    ) -> Result<Self, CredentialError> {
        let credential = Self {
            ssid: ssid.as_ref().to_vec(),
            password: password.as_ref().to_vec(),
            bssid: None,
        };
        credential.validate()?;
        Ok(credential)
    }

    /// Create a credential for an open network (no password).
    pub fn open(ssid: impl AsRef<[u8]>) -> Result<Self, CredentialError> {
        Self::new(ssid, b"")
    }

    /// Pin the credential to one access point.
    pub fn with_bssid(mut self, bssid: [u8; BSSID_LEN]) -> Self {
        self.bssid = Some(bssid);
        self
    }

    fn validate(&self) -> Result<(), CredentialError> {
        if self.ssid.is_empty() {
            return Err(CredentialError::SsidEmpty);
        }
        if self.ssid.len() > MAX_SSID_LEN {
            return Err(CredentialError::SsidTooLong {
                len: self.ssid.len(),
                max: MAX_SSID_LEN,
            });
        }

        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(CredentialError::PasswordTooLong {
                len: self.password.len(),
                max: MAX_PASSWORD_LEN,
            });
        }

        Ok(())
    }

    pub fn ssid(&self) -> &[u8] {
        &self.ssid
    }

    pub fn password(&self) -> &[u8] {
        &self.password
    }

    pub fn bssid(&self) -> Option<[u8; BSSID_LEN]> {
        self.bssid
    }

    /// SSID for log lines. Never log the password.
    pub fn ssid_lossy(&self) -> String {
        String::from_utf8_lossy(&self.ssid).into_owned()
    }

    /// Check if this is an open network (no password).
    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }

    /// The password has the length of a WEP key rather than a WPA passphrase.
    pub fn is_wep_key(&self) -> bool {
        matches!(self.password.len(), 5 | 13)
    }

    /// Encode the SSID as the fixed-size, NUL-padded store blob.
    pub fn ssid_blob(&self) -> [u8; SSID_BLOB_LEN] {
        let mut blob = [0u8; SSID_BLOB_LEN];
        blob[..self.ssid.len()].copy_from_slice(&self.ssid);
        blob
    }

    /// Encode the password as the fixed-size, NUL-padded store blob.
    ///
    /// The caller owns the returned buffer and should zeroize it after use.
    pub fn password_blob(&self) -> [u8; PASSWORD_BLOB_LEN] {
        let mut blob = [0u8; PASSWORD_BLOB_LEN];
        blob[..self.password.len()].copy_from_slice(&self.password);
        blob
    }

    /// Decode a credential from the two store blobs.
    ///
    /// Each blob is read up to its first NUL byte, so both the padded
    /// layout and exact-length values are accepted.
    pub fn from_blobs(ssid: &[u8], password: &[u8]) -> Result<Self, CredentialError> {
        Self::new(until_nul(ssid), until_nul(password))
    }
}

fn until_nul(blob: &[u8]) -> &[u8] {
    match blob.iter().position(|&b| b == 0) {
        Some(end) => &blob[..end],
        None => blob,
    }
}

impl fmt::Debug for WifiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredential")
            .field("ssid", &self.ssid_lossy())
            .field("password", &"<redacted>")
            .field("bssid", &self.bssid)
            .finish()
    }
}

/// Errors that can occur while building a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// SSID is empty.
    SsidEmpty,
    /// SSID exceeds maximum length.
    SsidTooLong { len: usize, max: usize },
    /// Password exceeds maximum length.
    PasswordTooLong { len: usize, max: usize },
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsidEmpty => write!(f, "SSID cannot be empty"),
            Self::SsidTooLong { len, max } => {
                write!(f, "SSID too long: {} bytes (max {})", len, max)
            }
            Self::PasswordTooLong { len, max } => {
                write!(f, "password too long: {} bytes (max {})", len, max)
            }
        }
    }
}

impl std::error::Error for CredentialError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_credential() {
        let credential = WifiCredential::new("TestNetwork", "password123").unwrap();
        assert_eq!(credential.ssid(), b"TestNetwork");
        assert_eq!(credential.password(), b"password123");
        assert_eq!(credential.bssid(), None);
    }

    #[test]
    fn test_open_network() {
        let credential = WifiCredential::open("OpenNetwork").unwrap();
        assert!(credential.is_open());
    }

    #[test]
    fn test_empty_ssid() {
        assert_eq!(
            WifiCredential::new("", "password123"),
            Err(CredentialError::SsidEmpty)
        );
    }

    #[test]
    fn test_ssid_length_limits() {
        assert!(WifiCredential::new("a".repeat(32), "password123").is_ok());
        assert!(matches!(
            WifiCredential::new("a".repeat(33), "password123"),
            Err(CredentialError::SsidTooLong { len: 33, max: 32 })
        ));
    }

    #[test]
    fn test_password_length_limits() {
        assert!(WifiCredential::new("TestNetwork", "1").is_ok());
        assert!(WifiCredential::new("TestNetwork", "12345678").is_ok());
        assert!(WifiCredential::new("TestNetwork", "a".repeat(64)).is_ok());
        assert!(matches!(
            WifiCredential::new("TestNetwork", "a".repeat(65)),
            Err(CredentialError::PasswordTooLong { .. })
        ));
    }

    #[test]
    fn test_wep_keys_are_accepted() {
        let short = WifiCredential::new("home", "abcde").unwrap();
        assert!(short.is_wep_key());
        assert!(!short.is_open());

        let long = WifiCredential::from_blobs(b"home", b"0123456789abc").unwrap();
        assert_eq!(long.password(), b"0123456789abc");
        assert!(long.is_wep_key());

        assert!(!WifiCredential::new("home", "secret123").unwrap().is_wep_key());
    }

    #[test]
    fn test_non_utf8_ssid_is_accepted() {
        let credential = WifiCredential::new([0xff, 0xfe, b'x'], "password123").unwrap();
        assert_eq!(credential.ssid(), &[0xff, 0xfe, b'x']);
        assert!(credential.ssid_lossy().ends_with('x'));
    }

    #[test]
    fn test_blobs_are_nul_padded() {
        let credential = WifiCredential::new("home", "secret123").unwrap();
        let ssid = credential.ssid_blob();
        let password = credential.password_blob();

        assert_eq!(ssid.len(), SSID_BLOB_LEN);
        assert_eq!(&ssid[..4], b"home");
        assert!(ssid[4..].iter().all(|&b| b == 0));
        assert_eq!(password.len(), PASSWORD_BLOB_LEN);
        assert_eq!(&password[..9], b"secret123");

        let restored = WifiCredential::from_blobs(&ssid, &password).unwrap();
        assert_eq!(restored, credential);
    }

    #[test]
    fn test_from_blobs_rejects_empty_ssid() {
        let result = WifiCredential::from_blobs(&[0u8; SSID_BLOB_LEN], b"password123");
        assert_eq!(result, Err(CredentialError::SsidEmpty));
    }

    #[test]
    fn test_debug_redacts_password() {
        let credential = WifiCredential::new("home", "secret123")
            .unwrap()
            .with_bssid([1, 2, 3, 4, 5, 6]);
        let debug = format!("{:?}", credential);
        assert!(debug.contains("home"));
        assert!(!debug.contains("secret123"));
        assert!(debug.contains("redacted"));
    }
}
