//! Connectivity state machine.
//!
//! [`Connectivity`] owns the station driver and is the only writer of the
//! [`ConnectionState`]. Link events and reconfigure commands reach it over
//! channels and are handled one at a time on its own task, so the network
//! stack's callback context never runs application logic.
//!
//! The state is published through a `watch` channel; other tasks observe it
//! with a [`ConnectivityHandle`].

use super::backoff::Backoff;
use super::state::{ConnectionState, LinkState, Transition};
use super::storage::load_credential;
use crate::config::{AppConfig, WifiCredential};
use crate::network::{LinkDriver, LinkEvent, NetworkError};
use crate::store::{self, SharedStore};
use log::{debug, info, warn};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Timing knobs of the state machine.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    /// How long the startup sequence waits for the stored credential to
    /// settle. `None` waits forever.
    pub outcome_timeout: Option<Duration>,
    /// A single attempt that sees neither an address nor a disconnect within
    /// this time is treated as failed.
    pub attempt_timeout: Option<Duration>,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl ConnectSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            outcome_timeout: config.connect_timeout(),
            attempt_timeout: config.connect_timeout(),
            backoff_min: config.backoff_min(),
            backoff_max: config.backoff_max(),
        }
    }
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Requests accepted from other tasks.
#[derive(Debug)]
pub enum Command {
    /// Drop the current association and connect with a new credential.
    Reconfigure(WifiCredential),
}

/// Result of [`Connectivity::attempt_stored_credential`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialAttempt {
    /// Nothing usable in the store; no connect was issued.
    NotFound,
    /// A connect with the stored credential was issued.
    Issued,
}

/// Result of [`Connectivity::wait_for_outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Connected,
    Failed,
    TimedOut,
}

/// Connectivity errors.
#[derive(Debug)]
pub enum ConnectivityError {
    /// The network interface could not be started. Unrecoverable.
    Init(NetworkError),
    /// A wait was cancelled.
    Cancelled,
    /// The state machine is gone (task ended or event source closed).
    Stopped,
}

impl fmt::Display for ConnectivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init(e) => write!(f, "network init failed: {}", e),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Stopped => write!(f, "connectivity task stopped"),
        }
    }
}

impl std::error::Error for ConnectivityError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Init(e) => Some(e),
            _ => None,
        }
    }
}

/// Read side of the state machine plus its command queue.
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    state: watch::Receiver<ConnectionState>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectivityHandle {
    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that sees every future state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Ask the state machine to switch to `credential`.
    pub fn reconfigure(&self, credential: WifiCredential) -> Result<(), ConnectivityError> {
        self.commands
            .send(Command::Reconfigure(credential))
            .map_err(|_| ConnectivityError::Stopped)
    }

    /// Wait until the state is Connected.
    pub async fn wait_connected(&self, cancel: &CancellationToken) -> Result<(), ConnectivityError> {
        let mut state = self.state.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(ConnectivityError::Cancelled),
            reached = state.wait_for(|s| *s == ConnectionState::Connected) => {
                reached.map(|_| ()).map_err(|_| ConnectivityError::Stopped)
            }
        }
    }
}

/// The connectivity state machine.
pub struct Connectivity<D: LinkDriver> {
    driver: D,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    store: SharedStore,
    link: LinkState,
    state_tx: watch::Sender<ConnectionState>,
    backoff: Backoff,
    settings: ConnectSettings,
    /// When the next retry is due (after a failure).
    reconnect_at: Option<Instant>,
    /// Watchdog for the attempt in flight.
    attempt_deadline: Option<Instant>,
    /// Credential received before the station started.
    pending: Option<WifiCredential>,
}

impl<D: LinkDriver> Connectivity<D> {
    /// Create the state machine. `events` must be the receiver paired with the
    /// sender given to the driver.
    pub fn new(
        driver: D,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        store: SharedStore,
        settings: ConnectSettings,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let backoff = Backoff::new(settings.backoff_min, settings.backoff_max);

        Self {
            driver,
            events,
            commands_tx,
            commands_rx,
            store,
            link: LinkState::new(),
            state_tx,
            backoff,
            settings,
            reconnect_at: None,
            attempt_deadline: None,
            pending: None,
        }
    }

    /// Replace the jitter source (deterministic tests).
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn handle(&self) -> ConnectivityHandle {
        ConnectivityHandle {
            state: self.state_tx.subscribe(),
            commands: self.commands_tx.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn settings(&self) -> &ConnectSettings {
        &self.settings
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Start the network interface. The state becomes Starting once the
    /// driver confirms.
    pub fn initialize(&mut self) -> Result<(), ConnectivityError> {
        info!("Starting WiFi station");
        self.driver.start().map_err(ConnectivityError::Init)
    }

    /// Wait for the start confirmation.
    pub async fn wait_started(&mut self, cancel: &CancellationToken) -> Result<(), ConnectivityError> {
        while self.link.state() == ConnectionState::Idle {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectivityError::Cancelled),
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => return Err(ConnectivityError::Stopped),
                },
            }
        }
        Ok(())
    }

    /// Connect with the stored credential, if there is one.
    ///
    /// Without a credential nothing is sent to the driver.
    pub async fn attempt_stored_credential(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<CredentialAttempt, ConnectivityError> {
        let loaded = {
            let store = store::lock(&self.store);
            load_credential(&*store)
        };
        let credential = match loaded {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                info!("No stored WiFi credential");
                return Ok(CredentialAttempt::NotFound);
            }
            Err(e) => {
                warn!("Could not read stored credential: {}", e);
                return Ok(CredentialAttempt::NotFound);
            }
        };

        self.wait_started(cancel).await?;
        info!("Connecting with stored credential for '{}'", credential.ssid_lossy());
        self.connect_with(&credential);
        Ok(CredentialAttempt::Issued)
    }

    /// Wait until the attempt in flight settles.
    pub async fn wait_for_outcome(
        &mut self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Outcome, ConnectivityError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.link.state() {
                ConnectionState::Connected => return Ok(Outcome::Connected),
                ConnectionState::Failed => return Ok(Outcome::Failed),
                _ => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectivityError::Cancelled),
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => return Err(ConnectivityError::Stopped),
                },
                _ = sleep_until(deadline) => {
                    warn!("No connection outcome within {:?}", timeout.unwrap_or_default());
                    return Ok(Outcome::TimedOut);
                }
            }
        }
    }

    /// Handle one event, command or timer.
    pub async fn step(&mut self, cancel: &CancellationToken) -> Result<(), ConnectivityError> {
        let reconnect_at = self.reconnect_at;
        let attempt_deadline = self.attempt_deadline;

        tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectivityError::Cancelled),
            event = self.events.recv() => match event {
                Some(event) => self.handle_event(event),
                None => return Err(ConnectivityError::Stopped),
            },
            Some(command) = self.commands_rx.recv() => self.handle_command(command),
            _ = sleep_until(reconnect_at) => {
                self.reconnect_at = None;
                debug!("Retrying connection (failures: {})", self.backoff.failures());
                self.issue_connect();
            }
            _ = sleep_until(attempt_deadline) => {
                self.attempt_deadline = None;
                warn!("Connection attempt stalled");
                let transition = self.link.expire_attempt();
                self.after_transition(transition);
            }
        }
        Ok(())
    }

    /// Drive the state machine until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ConnectivityError> {
        loop {
            match self.step(&cancel).await {
                Ok(()) => {}
                Err(ConnectivityError::Cancelled) => {
                    info!("Connectivity task stopped");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn handle_event(&mut self, event: LinkEvent) {
        debug!("Link event: {:?}", event);
        let transition = self.link.apply(event);
        self.after_transition(transition);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Reconfigure(credential) => {
                if self.link.state() == ConnectionState::Idle {
                    debug!("Station not started, holding new credential");
                    self.pending = Some(credential);
                    return;
                }
                info!("Switching to '{}'", credential.ssid_lossy());
                let reported = self.disconnect();
                let transition = self.link.drop_association(reported);
                if let Transition::Changed { .. } = transition {
                    self.publish();
                }
                self.configure_and_connect(&credential);
            }
        }
    }

    fn after_transition(&mut self, transition: Transition) {
        match transition {
            Transition::Changed { from, to } => {
                debug!("Connection state {} -> {}", from, to);
                self.publish();
                match to {
                    ConnectionState::Connected => {
                        self.backoff.reset();
                        self.attempt_deadline = None;
                        self.reconnect_at = None;
                        if let Some(address) = self.link.address() {
                            info!("WiFi connected, address {}", address);
                        }
                    }
                    ConnectionState::Starting => {
                        if let Some(credential) = self.pending.take() {
                            self.connect_with(&credential);
                        }
                    }
                    _ => {}
                }
            }
            Transition::Reconnect { from } => {
                self.publish();
                self.attempt_deadline = None;
                let delay = self.backoff.next_delay();
                warn!(
                    "WiFi lost while {}, reconnecting in {} ms",
                    from,
                    delay.as_millis()
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            Transition::Ignored => {}
        }
    }

    /// disconnect + configure + connect.
    fn connect_with(&mut self, credential: &WifiCredential) {
        self.disconnect();
        self.configure_and_connect(credential);
    }

    /// Whether the driver will report a Disconnected for this call.
    fn disconnect(&mut self) -> bool {
        match self.driver.disconnect() {
            Ok(reported) => reported,
            Err(e) => {
                debug!("Disconnect before configure: {}", e);
                false
            }
        }
    }

    fn configure_and_connect(&mut self, credential: &WifiCredential) {
        if let Err(e) = self.driver.configure(credential) {
            warn!(
                "Could not configure station for '{}': {}",
                credential.ssid_lossy(),
                e
            );
        }
        self.issue_connect();
    }

    fn issue_connect(&mut self) {
        match self.link.begin_connect() {
            Ok(transition) => self.after_transition(transition),
            Err(e) => {
                debug!("Connect skipped: {}", e);
                return;
            }
        }
        self.reconnect_at = None;

        match self.driver.connect() {
            Ok(()) => {
                self.attempt_deadline = self.settings.attempt_timeout.map(|t| Instant::now() + t);
            }
            Err(e) => {
                warn!("Connect request rejected: {}", e);
                let transition = self.link.expire_attempt();
                self.after_transition(transition);
            }
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.link.state());
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
