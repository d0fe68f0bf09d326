//! Provisioning listener.
//!
//! Credentials for a device without a working network arrive out of band
//! (ESPTouch broadcasts on ESP32). Decoding is left to a
//! [`ProvisioningTransport`]; the listener only reacts to what it reports:
//!
//! - a decoded credential is saved to the store, then handed to the
//!   connectivity state machine,
//! - the acknowledgement ends the listener,
//! - reaching Connected signals completion to whoever waits on it.
//!
//! Saving before reconnecting means a crash in between still leaves the new
//! credential on flash for the next boot.

use super::connectivity::ConnectivityHandle;
use super::state::ConnectionState;
use super::storage::save_credential;
use crate::config::WifiCredential;
use crate::store::{self, SharedStore};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Environment variables read by [`HostProvisioning::from_env`].
pub const PROVISION_SSID_ENV: &str = "CAMSTREAM_PROVISION_SSID";
pub const PROVISION_PASSWORD_ENV: &str = "CAMSTREAM_PROVISION_PASSWORD";

/// Events reported by a provisioning transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningEvent {
    /// Channel scan finished.
    ScanDone,
    /// The channel carrying provisioning traffic was found.
    FoundChannel,
    /// A credential was decoded.
    CredentialFound(WifiCredential),
    /// The phone was told that the device joined.
    AckSent,
    /// A packet could not be decoded. Informational only.
    DecodeFailed,
}

/// Out-of-band credential source.
pub trait ProvisioningTransport: Send {
    /// Start listening. Events are pushed into `events` from any context.
    fn start(&mut self, events: mpsc::UnboundedSender<ProvisioningEvent>)
        -> Result<(), ProvisioningError>;

    /// Stop listening. Stopping twice is harmless.
    fn stop(&mut self);
}

/// Provisioning errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    /// `start` was called while the listener is active.
    AlreadyRunning,
    /// The transport could not be started.
    Transport(String),
}

impl fmt::Display for ProvisioningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "provisioning already running"),
            Self::Transport(msg) => write!(f, "provisioning transport error: {}", msg),
        }
    }
}

impl std::error::Error for ProvisioningError {}

/// What a listener run produced. The credential itself stays in the task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningSummary {
    /// SSID of the last credential received.
    pub ssid: Option<String>,
    /// Whether the acknowledgement went out.
    pub acknowledged: bool,
}

/// State of one listener run.
#[derive(Default)]
struct ProvisioningSession {
    candidate: Option<WifiCredential>,
    ack_sent: bool,
}

impl ProvisioningSession {
    fn summary(&self) -> ProvisioningSummary {
        ProvisioningSummary {
            ssid: self.candidate.as_ref().map(WifiCredential::ssid_lossy),
            acknowledged: self.ack_sent,
        }
    }
}

/// Starts provisioning runs on a transport.
pub struct ProvisioningListener<T> {
    transport: Arc<Mutex<T>>,
    store: SharedStore,
    connectivity: ConnectivityHandle,
    running: Arc<AtomicBool>,
}

impl<T> Clone for ProvisioningListener<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            store: self.store.clone(),
            connectivity: self.connectivity.clone(),
            running: self.running.clone(),
        }
    }
}

impl<T: ProvisioningTransport + 'static> ProvisioningListener<T> {
    pub fn new(transport: T, store: SharedStore, connectivity: ConnectivityHandle) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            store,
            connectivity,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start listening on a new task.
    ///
    /// Must be called inside a tokio runtime. Fails with
    /// [`ProvisioningError::AlreadyRunning`] while a previous run is active.
    pub fn start(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ProvisioningHandle, ProvisioningError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProvisioningError::AlreadyRunning);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let started = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .start(events_tx);
        if let Err(e) = started {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!("Provisioning started");

        let (completed_tx, completed_rx) = watch::channel(false);
        let stop = cancel.child_token();
        let task = ListenerTask {
            transport: self.transport.clone(),
            store: self.store.clone(),
            connectivity: self.connectivity.clone(),
            events: events_rx,
            session: ProvisioningSession::default(),
            completed: completed_tx,
            running: self.running.clone(),
        };
        let join = tokio::spawn(task.run(stop.clone()));

        Ok(ProvisioningHandle {
            completed: completed_rx,
            stop,
            join,
        })
    }
}

/// Handle to a running listener.
pub struct ProvisioningHandle {
    completed: watch::Receiver<bool>,
    stop: CancellationToken,
    join: JoinHandle<ProvisioningSummary>,
}

impl ProvisioningHandle {
    /// Wait until provisioning completed (acknowledged or connected).
    ///
    /// Returns `false` if the listener ended without completing.
    pub async fn completed(&mut self) -> bool {
        self.completed.wait_for(|done| *done).await.is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the listener and wait for its task.
    pub async fn stop(self) -> ProvisioningSummary {
        self.stop.cancel();
        self.join().await
    }

    /// Wait for the listener to end on its own.
    pub async fn join(self) -> ProvisioningSummary {
        match self.join.await {
            Ok(summary) => summary,
            Err(e) => {
                error!("Provisioning task failed: {}", e);
                ProvisioningSummary::default()
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Finish,
}

struct ListenerTask<T> {
    transport: Arc<Mutex<T>>,
    store: SharedStore,
    connectivity: ConnectivityHandle,
    events: mpsc::UnboundedReceiver<ProvisioningEvent>,
    session: ProvisioningSession,
    completed: watch::Sender<bool>,
    running: Arc<AtomicBool>,
}

impl<T: ProvisioningTransport> ListenerTask<T> {
    async fn run(mut self, stop: CancellationToken) -> ProvisioningSummary {
        let mut state = self.connectivity.subscribe();
        if *state.borrow_and_update() == ConnectionState::Connected {
            self.signal_complete();
        }

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("Provisioning stopped");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => {
                        if self.on_event(event) == Flow::Finish {
                            break;
                        }
                    }
                    None => {
                        warn!("Provisioning transport closed");
                        break;
                    }
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        warn!("Connectivity gone, ending provisioning");
                        break;
                    }
                    if *state.borrow_and_update() == ConnectionState::Connected {
                        info!("Connected while provisioning");
                        self.signal_complete();
                    }
                }
            }
        }

        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop();
        self.running.store(false, Ordering::SeqCst);
        self.session.summary()
    }

    fn on_event(&mut self, event: ProvisioningEvent) -> Flow {
        match event {
            ProvisioningEvent::ScanDone => info!("Provisioning scan done"),
            ProvisioningEvent::FoundChannel => info!("Found provisioning channel"),
            ProvisioningEvent::CredentialFound(credential) => self.on_credential(credential),
            ProvisioningEvent::AckSent => {
                info!("Provisioning acknowledged");
                self.session.ack_sent = true;
                self.signal_complete();
                return Flow::Finish;
            }
            ProvisioningEvent::DecodeFailed => debug!("Dropped undecodable provisioning packet"),
        }
        Flow::Continue
    }

    fn on_credential(&mut self, credential: WifiCredential) {
        info!("Provisioned credential for '{}'", credential.ssid_lossy());

        // Save first: a crash before the reconnect must not lose it
        let saved = save_credential(&mut *store::lock(&self.store), &credential);
        if let Err(e) = saved {
            error!("Could not save provisioned credential: {}", e);
        }

        self.session.candidate = Some(credential.clone());
        if let Err(e) = self.connectivity.reconfigure(credential) {
            warn!("Could not hand credential to connectivity: {}", e);
        }
    }

    fn signal_complete(&self) {
        self.completed.send_replace(true);
    }
}

/// Transport that replays a fixed list of events on start, then stays
/// silent until stopped.
///
/// Used on host builds, where the credential comes from the environment, and
/// in tests.
#[derive(Debug, Default)]
pub struct HostProvisioning {
    script: Vec<ProvisioningEvent>,
    stopped: Arc<AtomicBool>,
    /// Held while listening so the listener only ends on ack or stop.
    events: Option<mpsc::UnboundedSender<ProvisioningEvent>>,
}

impl HostProvisioning {
    pub fn new(script: Vec<ProvisioningEvent>) -> Self {
        Self {
            script,
            stopped: Arc::new(AtomicBool::new(false)),
            events: None,
        }
    }

    /// Deliver the credential from `CAMSTREAM_PROVISION_SSID` /
    /// `CAMSTREAM_PROVISION_PASSWORD`. Without them nothing is ever delivered.
    pub fn from_env() -> Self {
        let Ok(ssid) = std::env::var(PROVISION_SSID_ENV) else {
            warn!(
                "{} not set, provisioning will wait until stopped",
                PROVISION_SSID_ENV
            );
            return Self::new(Vec::new());
        };
        let password = std::env::var(PROVISION_PASSWORD_ENV).unwrap_or_default();

        match WifiCredential::new(ssid, password) {
            Ok(credential) => Self::new(vec![
                ProvisioningEvent::ScanDone,
                ProvisioningEvent::FoundChannel,
                ProvisioningEvent::CredentialFound(credential),
            ]),
            Err(e) => {
                warn!("Ignoring provisioning credential from environment: {}", e);
                Self::new(Vec::new())
            }
        }
    }

    /// Shared flag set when the listener stops the transport.
    pub fn stopped_flag(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }
}

impl ProvisioningTransport for HostProvisioning {
    fn start(
        &mut self,
        events: mpsc::UnboundedSender<ProvisioningEvent>,
    ) -> Result<(), ProvisioningError> {
        self.stopped.store(false, Ordering::SeqCst);
        for event in self.script.iter().cloned() {
            events
                .send(event)
                .map_err(|_| ProvisioningError::Transport("listener gone".to_string()))?;
        }
        self.events = Some(events);
        Ok(())
    }

    fn stop(&mut self) {
        self.events = None;
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ScriptedLink;
    use crate::store::{shared, MemoryStore};
    use crate::wifi::connectivity::{ConnectSettings, Connectivity};
    use crate::wifi::storage::load_credential;
    use std::time::Duration;

    fn credential() -> WifiCredential {
        WifiCredential::new("home", "secret123").unwrap()
    }

    fn connectivity(store: SharedStore) -> Connectivity<ScriptedLink> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (link, log) = ScriptedLink::new(tx);
        log.accept("home");
        Connectivity::new(link, rx, store, ConnectSettings::default())
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let store = shared(MemoryStore::new());
        let conn = connectivity(store.clone());
        let listener = ProvisioningListener::new(HostProvisioning::default(), store, conn.handle());
        let cancel = CancellationToken::new();

        let handle = listener.start(&cancel).unwrap();
        assert!(listener.is_running());
        assert_eq!(
            listener.start(&cancel).err(),
            Some(ProvisioningError::AlreadyRunning)
        );

        handle.stop().await;
        assert!(!listener.is_running());
        assert!(listener.start(&cancel).is_ok());
    }

    #[tokio::test]
    async fn test_credential_is_saved_and_forwarded() {
        let store = shared(MemoryStore::new());
        let mut conn = connectivity(store.clone());
        let handle = conn.handle();
        let transport = HostProvisioning::new(vec![
            ProvisioningEvent::DecodeFailed,
            ProvisioningEvent::CredentialFound(credential()),
            ProvisioningEvent::AckSent,
        ]);
        let stopped = transport.stopped_flag();
        let listener = ProvisioningListener::new(transport, store.clone(), handle);

        let mut run = listener.start(&CancellationToken::new()).unwrap();
        assert!(run.completed().await);
        let summary = run.join().await;

        assert_eq!(summary.ssid.as_deref(), Some("home"));
        assert!(summary.acknowledged);
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!listener.is_running());
        assert_eq!(
            load_credential(&*store::lock(&store)).unwrap(),
            Some(credential())
        );

        // The reconfigure command is queued for the state machine
        let cancel = CancellationToken::new();
        conn.initialize().unwrap();
        conn.wait_started(&cancel).await.unwrap();
        conn.step(&cancel).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_connected_completes_without_ack() {
        let store = shared(MemoryStore::new());
        let mut conn = connectivity(store.clone());
        let transport = HostProvisioning::new(vec![ProvisioningEvent::CredentialFound(credential())]);
        let stopped = transport.stopped_flag();
        let listener = ProvisioningListener::new(transport, store, conn.handle());
        let cancel = CancellationToken::new();

        let mut run = listener.start(&cancel).unwrap();
        conn.initialize().unwrap();
        conn.wait_started(&cancel).await.unwrap();
        // Reconfigure -> Connecting, then GotIp -> Connected
        conn.step(&cancel).await.unwrap();
        conn.step(&cancel).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        let completed = tokio::time::timeout(Duration::from_secs(1), run.completed())
            .await
            .expect("completion not signalled");
        assert!(completed);

        // Still listening for the acknowledgement
        tokio::task::yield_now().await;
        assert!(listener.is_running());
        assert!(!run.is_finished());
        assert!(!stopped.load(Ordering::SeqCst));

        let summary = run.stop().await;
        assert_eq!(summary.ssid.as_deref(), Some("home"));
        assert!(!summary.acknowledged);
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_drained_script_keeps_listening() {
        let store = shared(MemoryStore::new());
        let conn = connectivity(store.clone());
        let listener = ProvisioningListener::new(HostProvisioning::default(), store, conn.handle());

        let run = listener.start(&CancellationToken::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(listener.is_running());
        assert!(!run.is_finished());

        let summary = run.stop().await;
        assert_eq!(summary, ProvisioningSummary::default());
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_save_failure_still_reconnects() {
        let mut failing = MemoryStore::new();
        failing.set_fail_writes(true);
        let store = shared(failing);
        let mut conn = connectivity(store.clone());
        let transport = HostProvisioning::new(vec![ProvisioningEvent::CredentialFound(credential())]);
        let listener = ProvisioningListener::new(transport, store, conn.handle());
        let cancel = CancellationToken::new();

        let run = listener.start(&cancel).unwrap();
        conn.initialize().unwrap();
        conn.wait_started(&cancel).await.unwrap();
        conn.step(&cancel).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);

        let summary = run.stop().await;
        assert!(!summary.acknowledged);
    }

    #[tokio::test]
    async fn test_transport_start_failure_releases_listener() {
        struct Broken;
        impl ProvisioningTransport for Broken {
            fn start(
                &mut self,
                _events: mpsc::UnboundedSender<ProvisioningEvent>,
            ) -> Result<(), ProvisioningError> {
                Err(ProvisioningError::Transport("radio busy".to_string()))
            }
            fn stop(&mut self) {}
        }

        let store = shared(MemoryStore::new());
        let conn = connectivity(store.clone());
        let listener = ProvisioningListener::new(Broken, store, conn.handle());

        assert!(matches!(
            listener.start(&CancellationToken::new()),
            Err(ProvisioningError::Transport(_))
        ));
        assert!(!listener.is_running());
    }
}
