//! ESPTouch (SmartConfig) provisioning transport.
//!
//! The ESP-IDF smartconfig component decodes credentials from UDP packet
//! lengths broadcast by the phone app. Its events are delivered on the
//! default event loop; the handler below only copies them into the
//! listener's channel.

use super::provisioning::{ProvisioningError, ProvisioningEvent, ProvisioningTransport};
use crate::config::WifiCredential;
use core::ffi::c_void;
use esp_idf_sys::{self as sys, esp};
use log::{info, warn};
use tokio::sync::mpsc::UnboundedSender;

/// SmartConfig transport. Requires the WiFi station to be started.
#[derive(Default)]
pub struct SmartConfig {
    /// Boxed sender handed to the C handler as its argument.
    sender: Option<*mut UnboundedSender<ProvisioningEvent>>,
}

// The raw pointer is only touched from `start`/`stop` and the event loop,
// which ESP-IDF serializes with handler (un)registration.
unsafe impl Send for SmartConfig {}

impl SmartConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProvisioningTransport for SmartConfig {
    fn start(
        &mut self,
        events: UnboundedSender<ProvisioningEvent>,
    ) -> Result<(), ProvisioningError> {
        let arg = Box::into_raw(Box::new(events));

        let started = unsafe {
            esp!(sys::esp_event_handler_register(
                sys::SC_EVENT,
                sys::ESP_EVENT_ANY_ID,
                Some(on_smartconfig_event),
                arg as *mut c_void,
            ))
            .and_then(|()| {
                esp!(sys::esp_smartconfig_set_type(
                    sys::smartconfig_type_t_SC_TYPE_ESPTOUCH
                ))
            })
            .and_then(|()| {
                let config = sys::smartconfig_start_config_t {
                    enable_log: false,
                    esp_touch_v2_enable_crypt: false,
                    esp_touch_v2_key: core::ptr::null_mut(),
                };
                esp!(sys::esp_smartconfig_start(&config))
            })
        };

        if let Err(e) = started {
            unsafe {
                sys::esp_event_handler_unregister(
                    sys::SC_EVENT,
                    sys::ESP_EVENT_ANY_ID,
                    Some(on_smartconfig_event),
                );
                drop(Box::from_raw(arg));
            }
            return Err(ProvisioningError::Transport(format!("{:?}", e)));
        }

        self.sender = Some(arg);
        info!("SmartConfig listening");
        Ok(())
    }

    fn stop(&mut self) {
        let Some(arg) = self.sender.take() else {
            return;
        };
        unsafe {
            sys::esp_smartconfig_stop();
            sys::esp_event_handler_unregister(
                sys::SC_EVENT,
                sys::ESP_EVENT_ANY_ID,
                Some(on_smartconfig_event),
            );
            drop(Box::from_raw(arg));
        }
        info!("SmartConfig stopped");
    }
}

impl Drop for SmartConfig {
    fn drop(&mut self) {
        self.stop();
    }
}

unsafe extern "C" fn on_smartconfig_event(
    arg: *mut c_void,
    _base: sys::esp_event_base_t,
    id: i32,
    data: *mut c_void,
) {
    let sender = &*(arg as *const UnboundedSender<ProvisioningEvent>);
    let Ok(id) = u32::try_from(id) else {
        return;
    };

    let event = match id {
        sys::smartconfig_event_t_SC_EVENT_SCAN_DONE => ProvisioningEvent::ScanDone,
        sys::smartconfig_event_t_SC_EVENT_FOUND_CHANNEL => ProvisioningEvent::FoundChannel,
        sys::smartconfig_event_t_SC_EVENT_GOT_SSID_PSWD => {
            if data.is_null() {
                return;
            }
            let got = &*(data as *const sys::smartconfig_event_got_ssid_pswd_t);
            match decode_credential(got) {
                Some(credential) => ProvisioningEvent::CredentialFound(credential),
                None => ProvisioningEvent::DecodeFailed,
            }
        }
        sys::smartconfig_event_t_SC_EVENT_SEND_ACK_DONE => ProvisioningEvent::AckSent,
        _ => return,
    };

    // Listener gone: nothing left to notify
    let _ = sender.send(event);
}

fn decode_credential(got: &sys::smartconfig_event_got_ssid_pswd_t) -> Option<WifiCredential> {
    match WifiCredential::from_blobs(&got.ssid, &got.password) {
        Ok(credential) if got.bssid_set => Some(credential.with_bssid(got.bssid)),
        Ok(credential) => Some(credential),
        Err(e) => {
            warn!("SmartConfig delivered an unusable credential: {}", e);
            None
        }
    }
}
