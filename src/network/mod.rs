//! Network abstraction layer.
//!
//! The station interface is driven through [`LinkDriver`], which works on:
//! - **ESP32** (`esp32` feature): [`EspLink`] over `EspWifi`
//! - **Host**: [`HostLink`], backed by the OS network stack
//!
//! Drivers never call back into application code. Link state changes are
//! pushed as [`LinkEvent`]s into a channel that the connectivity task drains
//! on its own, so nothing runs in the network stack's callback context
//! except a channel send.
//!
//! # Example
//!
//! ```ignore
//! let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
//!
//! #[cfg(feature = "esp32")]
//! let driver = network::EspLink::new(modem, sysloop, nvs_partition, events_tx)?;
//!
//! #[cfg(not(feature = "esp32"))]
//! let driver = network::HostLink::new(events_tx);
//!
//! let connectivity = Connectivity::new(driver, events_rx, store, settings);
//! ```

use crate::config::WifiCredential;
use std::net::IpAddr;

mod host;
mod stream_server;
#[cfg(feature = "esp32")]
mod wifi;

pub use host::HostLink;
pub use stream_server::{StreamServer, DEFAULT_STATS_PATH, DEFAULT_STREAM_PATH};
#[cfg(feature = "esp32")]
pub use wifi::EspLink;

/// Events delivered by the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The station interface finished starting.
    StationStarted,
    /// The station lost (or never got) its association.
    Disconnected,
    /// DHCP assigned an address; the link is usable.
    GotIp(IpAddr),
}

/// Control surface of the station interface.
///
/// Every call only issues the request; the outcome arrives later as a
/// [`LinkEvent`].
pub trait LinkDriver: Send {
    /// Bring the interface up. Confirmed by [`LinkEvent::StationStarted`].
    fn start(&mut self) -> Result<(), NetworkError>;

    /// Drop the current association, if any.
    ///
    /// Returns `true` when an association was dropped, meaning a
    /// [`LinkEvent::Disconnected`] for it follows. An attempt that never
    /// associated returns `false`.
    fn disconnect(&mut self) -> Result<bool, NetworkError>;

    /// Install the credential used by the next `connect`.
    fn configure(&mut self, credential: &WifiCredential) -> Result<(), NetworkError>;

    /// Start associating with the configured access point.
    fn connect(&mut self) -> Result<(), NetworkError>;
}

impl<D: LinkDriver + ?Sized> LinkDriver for Box<D> {
    fn start(&mut self) -> Result<(), NetworkError> {
        (**self).start()
    }

    fn disconnect(&mut self) -> Result<bool, NetworkError> {
        (**self).disconnect()
    }

    fn configure(&mut self, credential: &WifiCredential) -> Result<(), NetworkError> {
        (**self).configure(credential)
    }

    fn connect(&mut self) -> Result<(), NetworkError> {
        (**self).connect()
    }
}

/// Network errors.
#[derive(Debug)]
pub enum NetworkError {
    /// SSID cannot be handed to the driver (e.g. not valid UTF-8).
    InvalidSsid,
    /// Password cannot be handed to the driver.
    InvalidPassword,
    /// The driver rejected a request.
    Driver(String),
    /// Generic I/O error.
    Io(std::io::Error),
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSsid => write!(f, "invalid SSID"),
            Self::InvalidPassword => write!(f, "invalid password"),
            Self::Driver(msg) => write!(f, "driver error: {}", msg),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(feature = "esp32")]
impl From<esp_idf_sys::EspError> for NetworkError {
    fn from(e: esp_idf_sys::EspError) -> Self {
        Self::Driver(format!("ESP error: {:?}", e))
    }
}
