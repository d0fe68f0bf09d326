//! ESP32 camera node firmware library.
//!
//! Two halves, both testable on the host:
//!
//! - [`wifi`] brings the station online: stored credential first, then
//!   SmartConfig provisioning, then reconnects with backoff forever.
//! - [`camera`] runs the frame pipeline: a capture task fills a single
//!   shared slot that the MJPEG stream and the file writer read from.
//!
//! [`network`] holds the station drivers and the HTTP server, [`sim`] the
//! in-process radio and sensor used when no hardware is present.

pub mod camera;
pub mod config;
pub mod network;
#[cfg(feature = "esp32")]
pub mod persistence;
#[cfg(not(feature = "esp32"))]
pub mod persistence_host;
pub mod sim;
pub mod store;
pub mod wifi;

// Re-export commonly used items
pub use camera::{CaptureTask, FrameSource, Pipeline, PipelineStats, StreamResponder};
pub use config::{AppConfig, StreamMode, WifiCredential};
pub use network::{LinkDriver, LinkEvent, StreamServer};
pub use store::{KvStore, MemoryStore, SharedStore};
pub use wifi::{bring_online, ConnectionState, Connectivity, ConnectivityHandle};
