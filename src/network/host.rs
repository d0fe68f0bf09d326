//! Host link driver.
//!
//! On host systems, the OS handles networking. This driver reports the
//! system's network as the "station" so the connectivity state machine runs
//! unchanged on a development machine.

use super::{LinkDriver, LinkEvent, NetworkError};
use crate::config::WifiCredential;
use log::{debug, info};
use std::net::{IpAddr, Ipv4Addr};
use tokio::sync::mpsc::UnboundedSender;

/// Host link driver.
///
/// `start` and `connect` succeed immediately and confirm through the event
/// channel, the same way the ESP32 stack does.
pub struct HostLink {
    events: UnboundedSender<LinkEvent>,
    ssid: Option<String>,
    associated: bool,
}

impl HostLink {
    pub fn new(events: UnboundedSender<LinkEvent>) -> Self {
        Self {
            events,
            ssid: None,
            associated: false,
        }
    }

    /// Get the primary local IP address.
    ///
    /// Create a UDP socket and "connect" to a public IP (nothing is sent),
    /// then check which local address was chosen.
    fn detect_local_ip() -> Option<IpAddr> {
        use std::net::UdpSocket;

        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        let local_addr = socket.local_addr().ok()?;
        Some(local_addr.ip())
    }

    fn emit(&self, event: LinkEvent) -> Result<(), NetworkError> {
        self.events
            .send(event)
            .map_err(|_| NetworkError::Driver("event receiver dropped".to_string()))
    }
}

impl LinkDriver for HostLink {
    fn start(&mut self) -> Result<(), NetworkError> {
        debug!("Host link started");
        self.emit(LinkEvent::StationStarted)
    }

    fn disconnect(&mut self) -> Result<bool, NetworkError> {
        if !self.associated {
            return Ok(false);
        }
        self.associated = false;
        self.emit(LinkEvent::Disconnected)?;
        Ok(true)
    }

    fn configure(&mut self, credential: &WifiCredential) -> Result<(), NetworkError> {
        self.ssid = Some(credential.ssid_lossy());
        Ok(())
    }

    fn connect(&mut self) -> Result<(), NetworkError> {
        let ip = Self::detect_local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        info!(
            "Host network ready for '{}', local IP: {}",
            self.ssid.as_deref().unwrap_or("<unconfigured>"),
            ip
        );
        self.associated = true;
        self.emit(LinkEvent::GotIp(ip))
    }
}
