//! Connection state machine
//!
//! ```text
//! Disconnected --scan--> Scanning --found--> Connecting --established--> Connected
//! Scanning | Connecting --timeout | not found | link error--> Disconnected
//! Connected --disconnect--> Disconnecting --closed--> Disconnected
//! Connected --link drop--> Disconnected
//! ```
//!
//! The [`ConnectionManager`] is owned by the link worker. Everyone else sees
//! it through a `watch` channel of [`ConnectionSnapshot`]s. Each established
//! session gets a fresh [`SessionId`]; once a session ends its id is never
//! current again, so work captured against it is rejected.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::bridge::{DiscoveredDevice, EstablishedLink};

use super::events::{EventSink, StatusKind};

// ============================================================================
// State
// ============================================================================

/// Connection state of the single device slot.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No device, idle
    #[default]
    Disconnected,
    /// Looking for a device
    Scanning,
    /// Device found, connection in progress
    Connecting,
    /// Ready to accept commands
    Connected,
    /// Operator disconnect in progress
    Disconnecting,
}

impl ConnectionState {
    /// Check if `next` is a legal successor of this state.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Scanning)
                | (Self::Scanning, Self::Connecting | Self::Disconnected)
                | (Self::Connecting, Self::Connected | Self::Disconnected)
                | (Self::Connected, Self::Disconnecting | Self::Disconnected)
                | (Self::Disconnecting, Self::Disconnected)
        )
    }

    /// Check if a connect attempt would collide with this state.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Scanning | Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Scanning => "Scanning",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnecting => "Disconnecting",
        };
        f.write_str(name)
    }
}

/// Identifier of one established session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Raw epoch number.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session #{}", self.0)
    }
}

/// Published view of the connection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    /// Current state
    pub state: ConnectionState,
    /// Current session while connected
    pub session: Option<SessionId>,
    /// Name of the connected (or connecting) device
    pub device: Option<String>,
}

impl ConnectionSnapshot {
    /// Check if commands can be sent right now.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.session.is_some()
    }
}

// ============================================================================
// Connection Manager
// ============================================================================

/// The live session owned by the worker.
#[derive(Debug)]
pub struct ActiveSession<S> {
    /// Epoch of this session
    pub id: SessionId,
    /// Transport handle
    pub session: S,
    /// Unexpected link loss notifications
    pub drops: mpsc::Receiver<String>,
    /// Peer
    pub device: DiscoveredDevice,
}

/// State machine over the single device slot.
pub struct ConnectionManager<S> {
    state: ConnectionState,
    active: Option<ActiveSession<S>>,
    pending_device: Option<String>,
    last_session: u64,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    events: EventSink,
}

impl<S> ConnectionManager<S> {
    /// Create a manager in `Disconnected` and the receiver for its snapshots.
    #[must_use]
    pub fn new(events: EventSink) -> (Self, watch::Receiver<ConnectionSnapshot>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnectionSnapshot::default());
        let manager = Self {
            state: ConnectionState::Disconnected,
            active: None,
            pending_device: None,
            last_session: 0,
            snapshot_tx,
            events,
        };
        (manager, snapshot_rx)
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Id of the live session, if connected.
    pub fn current_session(&self) -> Option<SessionId> {
        self.active.as_ref().map(|a| a.id)
    }

    /// Check if `id` is the live session.
    pub fn is_current(&self, id: SessionId) -> bool {
        self.state == ConnectionState::Connected && self.current_session() == Some(id)
    }

    /// Mutable access to the live session.
    pub fn active_mut(&mut self) -> Option<&mut ActiveSession<S>> {
        self.active.as_mut()
    }

    /// `Disconnected -> Scanning`.
    ///
    /// # Errors
    ///
    /// Returns the current state if it is anything but `Disconnected`.
    pub fn begin_scan(&mut self) -> Result<(), ConnectionState> {
        if self.state != ConnectionState::Disconnected {
            return Err(self.state);
        }
        self.transition(ConnectionState::Scanning);
        Ok(())
    }

    /// `Scanning -> Connecting`.
    pub fn device_found(&mut self, device: &DiscoveredDevice) {
        self.events.emit(StatusKind::DeviceFound {
            name: device.name.clone(),
            id: device.id.clone(),
        });
        self.pending_device = Some(device.name.clone());
        self.transition(ConnectionState::Connecting);
    }

    /// `Connecting -> Connected`. Issues the next session id.
    pub fn established(&mut self, device: DiscoveredDevice, link: EstablishedLink<S>) -> SessionId {
        self.last_session += 1;
        let id = SessionId(self.last_session);
        let name = device.name.clone();

        self.active = Some(ActiveSession {
            id,
            session: link.session,
            drops: link.drops,
            device,
        });
        self.pending_device = None;
        self.transition(ConnectionState::Connected);
        self.events.emit(StatusKind::Connected { device: name });
        tracing::debug!("{id} established");
        id
    }

    /// `Scanning | Connecting -> Disconnected` when an attempt stops short of
    /// a session.
    pub fn attempt_ended(&mut self) {
        self.pending_device = None;
        if matches!(self.state, ConnectionState::Scanning | ConnectionState::Connecting) {
            self.transition(ConnectionState::Disconnected);
        }
    }

    /// `Connected -> Disconnecting`. Hands the session back for closing.
    pub fn begin_disconnect(&mut self) -> Option<ActiveSession<S>> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        let active = self.active.take()?;
        self.pending_device = Some(active.device.name.clone());
        self.transition(ConnectionState::Disconnecting);
        Some(active)
    }

    /// `Disconnecting -> Disconnected`.
    pub fn closed(&mut self) {
        self.pending_device = None;
        if self.state == ConnectionState::Disconnecting {
            self.transition(ConnectionState::Disconnected);
            self.events.emit(StatusKind::Disconnected { reason: None });
        }
    }

    /// `Connected -> Disconnected` on unexpected link loss.
    ///
    /// Returns the dropped session so the caller can release it.
    pub fn link_dropped(&mut self, reason: String) -> Option<ActiveSession<S>> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        let active = self.active.take();
        self.transition(ConnectionState::Disconnected);
        self.events.emit(StatusKind::Disconnected { reason: Some(reason) });
        active
    }

    fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!("Unexpected connection transition {} -> {next}", self.state);
        }
        tracing::debug!("Connection state {} -> {next}", self.state);
        self.state = next;

        let snapshot = ConnectionSnapshot {
            state: next,
            session: self.current_session(),
            device: self
                .active
                .as_ref()
                .map(|a| a.device.name.clone())
                .or_else(|| self.pending_device.clone()),
        };
        self.snapshot_tx.send_replace(snapshot);
        self.events.emit(StatusKind::StateChanged(next));
    }
}
