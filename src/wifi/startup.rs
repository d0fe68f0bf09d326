//! Boot sequence: stored credential first, provisioning as the fallback.

use super::connectivity::{
    Connectivity, ConnectivityError, ConnectivityHandle, CredentialAttempt, Outcome,
};
use super::provisioning::{ProvisioningHandle, ProvisioningListener, ProvisioningTransport};
use crate::network::LinkDriver;
use log::{info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How the device got online.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlinePath {
    StoredCredential,
    Provisioned,
}

/// A connected device.
pub struct Online {
    pub handle: ConnectivityHandle,
    /// The state machine task, running until cancelled.
    pub task: JoinHandle<Result<(), ConnectivityError>>,
    pub path: OnlinePath,
    /// Still waiting for the provisioning acknowledgement, if provisioned.
    pub provisioning: Option<ProvisioningHandle>,
}

/// Bring the station online.
///
/// Starts the interface, tries the stored credential and waits for it to
/// settle. Without a credential, or if it fails or times out, provisioning
/// takes over. Returns once the state is Connected; from then on the state
/// machine keeps running on its own task.
pub async fn bring_online<D, T>(
    mut conn: Connectivity<D>,
    listener: &ProvisioningListener<T>,
    cancel: &CancellationToken,
) -> Result<Online, ConnectivityError>
where
    D: LinkDriver + 'static,
    T: ProvisioningTransport + 'static,
{
    conn.initialize()?;

    let connected = match conn.attempt_stored_credential(cancel).await? {
        CredentialAttempt::NotFound => false,
        CredentialAttempt::Issued => {
            let timeout = conn.settings().outcome_timeout;
            match conn.wait_for_outcome(timeout, cancel).await? {
                Outcome::Connected => true,
                outcome => {
                    warn!("Stored credential did not connect ({:?})", outcome);
                    false
                }
            }
        }
    };

    if !connected {
        // The provisioning transport needs a started station
        conn.wait_started(cancel).await?;
    }

    let handle = conn.handle();
    let task = tokio::spawn(conn.run(cancel.clone()));

    if connected {
        return Ok(Online {
            handle,
            task,
            path: OnlinePath::StoredCredential,
            provisioning: None,
        });
    }

    info!("Entering provisioning");
    let provisioning = match listener.start(cancel) {
        Ok(provisioning) => Some(provisioning),
        Err(e) => {
            // The retry loop may still get us online
            warn!("Provisioning unavailable: {}", e);
            None
        }
    };

    handle.wait_connected(cancel).await?;
    info!("Online after provisioning");

    Ok(Online {
        handle,
        task,
        path: OnlinePath::Provisioned,
        provisioning,
    })
}
