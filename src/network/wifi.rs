//! ESP32 WiFi station driver.
//!
//! Wraps `EspWifi` without the blocking helpers: requests return as soon as
//! ESP-IDF accepts them, and the system event loop subscriptions forward
//! station and DHCP events into the connectivity channel.

use super::{LinkDriver, LinkEvent, NetworkError};
use crate::config::WifiCredential;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::{EspSubscription, EspSystemEventLoop, System};
use esp_idf_svc::netif::IpEvent;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi, WifiEvent};
use log::{debug, info};
use std::net::IpAddr;
use tokio::sync::mpsc::UnboundedSender;

/// WiFi station driver for ESP32.
pub struct EspLink {
    /// ESP-IDF WiFi driver.
    wifi: EspWifi<'static>,
    // Subscriptions unregister on drop
    _wifi_events: EspSubscription<'static, System>,
    _ip_events: EspSubscription<'static, System>,
}

impl EspLink {
    /// Create the driver and register the event forwarders.
    ///
    /// Failure here is unrecoverable: the device cannot run without a
    /// network interface.
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        events: UnboundedSender<LinkEvent>,
    ) -> Result<Self, NetworkError> {
        let mut wifi = EspWifi::new(modem, sysloop.clone(), Some(nvs))?;
        wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;

        let wifi_tx = events.clone();
        let wifi_events = sysloop.subscribe::<WifiEvent, _>(move |event| {
            let forwarded = match event {
                WifiEvent::StaStarted => Some(LinkEvent::StationStarted),
                WifiEvent::StaDisconnected(_) => Some(LinkEvent::Disconnected),
                _ => None,
            };
            if let Some(event) = forwarded {
                // Receiver gone means the node is shutting down
                let _ = wifi_tx.send(event);
            }
        })?;

        let ip_events = sysloop.subscribe::<IpEvent, _>(move |event| {
            if let IpEvent::DhcpIpAssigned(assignment) = event {
                let _ = events.send(LinkEvent::GotIp(IpAddr::V4(assignment.ip())));
            }
        })?;

        Ok(Self {
            wifi,
            _wifi_events: wifi_events,
            _ip_events: ip_events,
        })
    }
}

impl LinkDriver for EspLink {
    fn start(&mut self) -> Result<(), NetworkError> {
        self.wifi.start()?;
        debug!("WiFi start requested");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<bool, NetworkError> {
        // Only an established association is sure to raise StaDisconnected
        let associated = self.wifi.is_connected()?;
        self.wifi.disconnect()?;
        Ok(associated)
    }

    fn configure(&mut self, credential: &WifiCredential) -> Result<(), NetworkError> {
        let ssid = core::str::from_utf8(credential.ssid()).map_err(|_| NetworkError::InvalidSsid)?;
        let password =
            core::str::from_utf8(credential.password()).map_err(|_| NetworkError::InvalidPassword)?;

        // Weakest mode the station will accept
        let auth_method = if credential.is_open() {
            AuthMethod::None
        } else if credential.is_wep_key() {
            AuthMethod::WEP
        } else {
            AuthMethod::WPA2Personal
        };

        let client = ClientConfiguration {
            ssid: ssid.try_into().map_err(|_| NetworkError::InvalidSsid)?,
            password: password
                .try_into()
                .map_err(|_| NetworkError::InvalidPassword)?,
            bssid: credential.bssid(),
            auth_method,
            ..Default::default()
        };

        self.wifi.set_configuration(&Configuration::Client(client))?;
        info!("Station configured for '{}'", ssid);
        Ok(())
    }

    fn connect(&mut self) -> Result<(), NetworkError> {
        self.wifi.connect()?;
        debug!("WiFi connect requested");
        Ok(())
    }
}
