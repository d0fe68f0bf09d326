//! Runtime settings for the camera node.
//!
//! On the host the settings come from a JSON file named by the
//! `CAMSTREAM_CONFIG` environment variable. Every field has a default, so a
//! partial file (or no file at all) is fine. ESP32 builds use the defaults,
//! with a few compile-time overrides.
//!
//! ```
//! use camstream_esp32::config::{AppConfig, StreamMode};
//!
//! let config = AppConfig::from_json(r#"{ "stream_port": 8081, "stream_mode": "direct" }"#).unwrap();
//! assert_eq!(config.stream_port, 8081);
//! assert_eq!(config.stream_mode, StreamMode::Direct);
//! assert!(config.validate().is_ok());
//! ```

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the host configuration file.
pub const CONFIG_ENV_VAR: &str = "CAMSTREAM_CONFIG";

/// Default port for the stream server.
pub const DEFAULT_STREAM_PORT: u16 = 80;

/// Default directory for saved frames: the SPIFFS mount point on ESP32.
#[cfg(feature = "esp32")]
pub const DEFAULT_STORAGE_DIR: &str = "/spiffs";

/// Default directory for saved frames, relative to the working directory.
#[cfg(not(feature = "esp32"))]
pub const DEFAULT_STORAGE_DIR: &str = ".camstream/frames";

/// Where the stream responder gets its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Copy frames out of the shared slot filled by the capture task.
    Slot,
    /// Call the camera directly for every client frame (no capture task).
    Direct,
}

/// Node settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// How long to wait for the stored credential to connect before
    /// provisioning starts. Zero waits forever.
    pub connect_timeout_secs: u64,
    /// First reconnect delay after a disconnect.
    pub backoff_min_ms: u64,
    /// Upper bound for the reconnect delay.
    pub backoff_max_ms: u64,
    /// Port for `/stream` and `/stats`.
    pub stream_port: u16,
    pub stream_mode: StreamMode,
    /// Concurrent stream clients. Each one holds a thread and a frame copy.
    pub max_stream_clients: usize,
    /// Write every published frame to the file store (slot mode only).
    pub persist_frames: bool,
    /// Directory (or mount point) for `frame-<N>.<ext>` files.
    pub storage_dir: PathBuf,
    /// Directory backing the key-value store on the host.
    pub store_dir: PathBuf,
    /// Raw frames wider than this are converted to JPEG.
    pub min_transcode_width: u16,
    /// JPEG quality used for conversion (1-100).
    pub jpeg_quality: u8,
    /// Host only: directory of `.jpg` files to replay as camera frames.
    pub frames_dir: Option<PathBuf>,
    /// Host only: delay between replayed frames.
    pub capture_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            backoff_min_ms: 500,
            backoff_max_ms: 30_000,
            stream_port: DEFAULT_STREAM_PORT,
            stream_mode: StreamMode::Slot,
            max_stream_clients: 2,
            persist_frames: true,
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            store_dir: PathBuf::from(".camstream"),
            min_transcode_width: 400,
            jpeg_quality: 80,
            frames_dir: None,
            capture_interval_ms: 100,
        }
    }
}

impl AppConfig {
    /// Parse settings from JSON.
    pub fn from_json(json: &str) -> Result<Self, AppConfigError> {
        serde_json::from_str(json).map_err(|e| AppConfigError::Parse(e.to_string()))
    }

    /// Read settings from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, AppConfigError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| AppConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Load from the file named by `CAMSTREAM_CONFIG`, or use defaults.
    pub fn from_env() -> Result<Self, AppConfigError> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Defaults with the overrides baked in at build time.
    ///
    /// ESP32 builds have no file system to read a config from, so
    /// `CAMSTREAM_STREAM_PORT`, `CAMSTREAM_STREAM_MODE` and
    /// `CAMSTREAM_PERSIST` are read when the firmware is compiled.
    pub fn from_build_env() -> Result<Self, AppConfigError> {
        Self::with_overrides(
            option_env!("CAMSTREAM_STREAM_PORT"),
            option_env!("CAMSTREAM_STREAM_MODE"),
            option_env!("CAMSTREAM_PERSIST"),
        )
    }

    fn with_overrides(
        port: Option<&str>,
        mode: Option<&str>,
        persist: Option<&str>,
    ) -> Result<Self, AppConfigError> {
        let mut config = Self::default();
        if let Some(port) = port {
            config.stream_port = port
                .parse()
                .map_err(|_| AppConfigError::Invalid("CAMSTREAM_STREAM_PORT must be a port number"))?;
        }
        if let Some(mode) = mode {
            config.stream_mode = match mode {
                "slot" => StreamMode::Slot,
                "direct" => StreamMode::Direct,
                _ => return Err(AppConfigError::Invalid("CAMSTREAM_STREAM_MODE must be slot or direct")),
            };
        }
        if let Some(persist) = persist {
            config.persist_frames = !matches!(persist, "0" | "false" | "no");
        }
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), AppConfigError> {
        if self.backoff_min_ms == 0 {
            return Err(AppConfigError::Invalid("backoff_min_ms must be > 0"));
        }
        if self.backoff_max_ms < self.backoff_min_ms {
            return Err(AppConfigError::Invalid(
                "backoff_max_ms must be >= backoff_min_ms",
            ));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(AppConfigError::Invalid("jpeg_quality must be in 1..=100"));
        }
        if self.max_stream_clients == 0 {
            return Err(AppConfigError::Invalid("max_stream_clients must be > 0"));
        }
        Ok(())
    }

    /// Outcome timeout, `None` meaning wait forever.
    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }
}

/// Errors from loading or validating settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppConfigError {
    /// The file could not be read.
    Io(String),
    /// The file is not valid JSON for [`AppConfig`].
    Parse(String),
    /// A value is out of range.
    Invalid(&'static str),
}

impl fmt::Display for AppConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "cannot read config: {}", msg),
            Self::Parse(msg) => write!(f, "invalid config: {}", msg),
            Self::Invalid(msg) => write!(f, "invalid config value: {}", msg),
        }
    }
}

impl std::error::Error for AppConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.stream_mode, StreamMode::Slot);
    }

    #[cfg(not(feature = "esp32"))]
    #[test]
    fn test_host_storage_is_relative() {
        let config = AppConfig::default();
        assert!(config.storage_dir.is_relative());
        assert!(config.storage_dir.starts_with(&config.store_dir));
    }

    #[test]
    fn test_empty_json_gives_defaults() {
        assert_eq!(AppConfig::from_json("{}").unwrap(), AppConfig::default());
    }

    #[test]
    fn test_zero_timeout_waits_forever() {
        let config = AppConfig::from_json(r#"{"connect_timeout_secs": 0}"#).unwrap();
        assert_eq!(config.connect_timeout(), None);
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let result = AppConfig::from_json(r#"{"stream_mode": "broadcast"}"#);
        assert!(matches!(result, Err(AppConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_backoff_order() {
        let config = AppConfig {
            backoff_min_ms: 1000,
            backoff_max_ms: 10,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AppConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_quality_range() {
        let config = AppConfig {
            jpeg_quality: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AppConfig {
            jpeg_quality: 101,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_build_overrides() {
        let config = AppConfig::with_overrides(Some("8080"), Some("direct"), Some("0")).unwrap();
        assert_eq!(config.stream_port, 8080);
        assert_eq!(config.stream_mode, StreamMode::Direct);
        assert!(!config.persist_frames);

        assert!(AppConfig::with_overrides(Some("http"), None, None).is_err());
        assert!(AppConfig::with_overrides(None, Some("both"), None).is_err());
        assert_eq!(AppConfig::with_overrides(None, None, None).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = AppConfig::from_file(Path::new("/nonexistent/camstream.json"));
        assert!(matches!(result, Err(AppConfigError::Io(_))));
    }
}
