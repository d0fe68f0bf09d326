//! Node configuration types.
//!
//! # Components
//!
//! - [`wifi`] - WiFi credential type (host-testable)
//! - [`app`] - Runtime settings loaded from JSON or defaults

mod app;
mod wifi;

pub use app::{
    AppConfig, AppConfigError, StreamMode, CONFIG_ENV_VAR, DEFAULT_STORAGE_DIR, DEFAULT_STREAM_PORT,
};
pub use wifi::{
    CredentialError, WifiCredential, BSSID_LEN, MAX_PASSWORD_LEN, MAX_SSID_LEN,
    MIN_WPA_PASSWORD_LEN, PASSWORD_BLOB_LEN, SSID_BLOB_LEN,
};
