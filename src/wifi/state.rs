//! Connection state and its transition rules.
//!
//! ```text
//!  Idle ──started──▶ Starting ──connect──▶ Connecting ──got ip──▶ Connected
//!                                            ▲   │                   │
//!                                   retry    │   │ disconnected      │ disconnected
//!                                            │   ▼                   │
//!                                           Failed ◀─────────────────┘
//! ```
//!
//! Everything here is pure: [`LinkState`] only records what the station is
//! doing. Issuing driver requests and scheduling retries is the job of
//! [`super::Connectivity`].

use crate::network::LinkEvent;
use std::fmt;
use std::net::IpAddr;

/// Station connection state.
///
/// "connected" and "failed" are variants of one enum, so the two can never
/// hold at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Interface not started yet.
    Idle,
    /// Interface started, no connect issued.
    Starting,
    /// Association in progress.
    Connecting,
    /// Associated with an address.
    Connected,
    /// Last attempt failed or the link dropped. Always followed by a retry
    /// or provisioning.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }

    /// Connected or Failed: the outcome of an attempt is known.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Connected | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effect of applying an event or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The state moved.
    Changed {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// The link dropped: the state is now Failed and a reconnect is due.
    Reconnect { from: ConnectionState },
    /// Nothing to do in the current state.
    Ignored,
}

/// A request that is not allowed in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    /// The interface has not reported Starting yet.
    NotStarted,
    /// The target state cannot be reached from here.
    Invalid {
        from: ConnectionState,
        to: ConnectionState,
    },
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "station not started"),
            Self::Invalid { from, to } => write!(f, "cannot go from {} to {}", from, to),
        }
    }
}

impl std::error::Error for TransitionError {}

/// The station as seen from the event stream.
#[derive(Debug, Clone)]
pub struct LinkState {
    state: ConnectionState,
    address: Option<IpAddr>,
    /// The driver confirmed it dropped an association for us; the matching
    /// Disconnected event must not count as a failure.
    own_disconnect_pending: bool,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkState {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            address: None,
            own_disconnect_pending: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Address while Connected.
    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }

    fn set(&mut self, to: ConnectionState) -> Transition {
        let from = self.state;
        self.state = to;
        if to != ConnectionState::Connected {
            self.address = None;
        }
        Transition::Changed { from, to }
    }

    /// Apply an event from the network stack.
    pub fn apply(&mut self, event: LinkEvent) -> Transition {
        use ConnectionState::*;

        match (self.state, event) {
            (Idle, LinkEvent::StationStarted) => self.set(Starting),
            (_, LinkEvent::StationStarted) => Transition::Ignored,

            (Connecting | Connected, LinkEvent::Disconnected) => {
                if self.own_disconnect_pending {
                    self.own_disconnect_pending = false;
                    return Transition::Ignored;
                }
                let from = self.state;
                self.set(Failed);
                Transition::Reconnect { from }
            }
            (_, LinkEvent::Disconnected) => Transition::Ignored,

            (Connecting, LinkEvent::GotIp(ip)) => {
                self.own_disconnect_pending = false;
                let transition = self.set(Connected);
                self.address = Some(ip);
                transition
            }
            (_, LinkEvent::GotIp(_)) => Transition::Ignored,
        }
    }

    /// A connect request is about to be issued.
    pub fn begin_connect(&mut self) -> Result<Transition, TransitionError> {
        match self.state {
            ConnectionState::Starting | ConnectionState::Failed => {
                Ok(self.set(ConnectionState::Connecting))
            }
            ConnectionState::Idle => Err(TransitionError::NotStarted),
            from => Err(TransitionError::Invalid {
                from,
                to: ConnectionState::Connecting,
            }),
        }
    }

    /// We dropped the association to switch credentials.
    ///
    /// Moves Connecting/Connected to Failed without scheduling a retry.
    /// `reported` is true only when the driver confirmed that a Disconnected
    /// event for the drop will follow; only then is that event swallowed.
    pub fn drop_association(&mut self, reported: bool) -> Transition {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.own_disconnect_pending = reported;
                self.set(ConnectionState::Failed)
            }
            _ => Transition::Ignored,
        }
    }

    /// The current attempt took too long. Treated like a disconnect.
    pub fn expire_attempt(&mut self) -> Transition {
        if self.state != ConnectionState::Connecting {
            return Transition::Ignored;
        }
        self.own_disconnect_pending = false;
        self.set(ConnectionState::Failed);
        Transition::Reconnect {
            from: ConnectionState::Connecting,
        }
    }
}
