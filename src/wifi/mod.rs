//! WiFi connectivity.
//!
//! # Components
//!
//! - [`state`] - connection states and the pure transition rules
//! - [`connectivity`] - the state machine task driving a [`crate::network::LinkDriver`]
//! - [`provisioning`] - out-of-band credential listener
//! - [`startup`] - boot sequence tying the two together
//! - [`storage`] - persisted credential and picture counter
//! - `smartconfig` - ESPTouch transport (ESP32 only)

mod backoff;
pub mod connectivity;
pub mod provisioning;
#[cfg(feature = "esp32")]
mod smartconfig;
pub mod startup;
pub mod state;
pub mod storage;

pub use backoff::Backoff;
pub use connectivity::{
    Command, ConnectSettings, Connectivity, ConnectivityError, ConnectivityHandle,
    CredentialAttempt, Outcome,
};
pub use provisioning::{
    HostProvisioning, ProvisioningError, ProvisioningEvent, ProvisioningHandle,
    ProvisioningListener, ProvisioningSummary, ProvisioningTransport,
};
#[cfg(feature = "esp32")]
pub use smartconfig::SmartConfig;
pub use startup::{bring_online, Online, OnlinePath};
pub use state::{ConnectionState, LinkState, Transition, TransitionError};
pub use storage::{
    clear_credential, load_credential, load_picture_number, save_credential,
    save_picture_number, STORAGE_NAMESPACE,
};
