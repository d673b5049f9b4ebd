//! Status events
//!
//! Every state change and every command outcome is reported twice: as a
//! `tracing` record and as a [`StatusEvent`] on the session's event channel,
//! which the console renders as its log pane.

use std::fmt;

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use chronos_core::CommandPacket;

use super::connection::ConnectionState;

// ============================================================================
// Event Types
// ============================================================================

/// Operation a status event refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Discovery only
    Scan,
    /// Scan and connect
    Connect,
    /// Operator disconnect
    Disconnect,
    /// Stimulation parameters
    SendParameters,
    /// Zero-output stop command
    ForceStop,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Scan => "Scan",
            Self::Connect => "Connect",
            Self::Disconnect => "Disconnect",
            Self::SendParameters => "Send",
            Self::ForceStop => "Stop",
        };
        f.write_str(name)
    }
}

/// What happened.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StatusKind {
    /// Connection state changed
    StateChanged(ConnectionState),
    /// A Chronos device answered the scan
    DeviceFound {
        /// Advertised name
        name: String,
        /// Transport identifier
        id: String,
    },
    /// Session established
    Connected {
        /// Advertised name of the peer
        device: String,
    },
    /// Session ended; `reason` is set when the link was lost
    Disconnected {
        /// Why the link went away, if not requested
        reason: Option<String>,
    },
    /// Stimulation switch toggled
    StimulationEnabled(bool),
    /// A command was acknowledged by the device
    CommandSent {
        /// Which command
        command: CommandKind,
        /// Packet on the wire
        packet: CommandPacket,
    },
    /// A command failed
    CommandFailed {
        /// Which command
        command: CommandKind,
        /// Human-readable cause
        reason: String,
    },
    /// Informational line
    Info(String),
}

impl StatusKind {
    /// Check if this event reports a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::CommandFailed { .. } | Self::Disconnected { reason: Some(_) }
        )
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged(state) => write!(f, "Status: {state}"),
            Self::DeviceFound { name, id } => write!(f, "Found {name}: {id}"),
            Self::Connected { device } => write!(f, "Connected successfully to {device}"),
            Self::Disconnected { reason: None } => f.write_str("Disconnected"),
            Self::Disconnected { reason: Some(reason) } => write!(f, "Connection lost: {reason}"),
            Self::StimulationEnabled(true) => {
                f.write_str("Stimulation ENABLED - DAC will output configured amplitude")
            }
            Self::StimulationEnabled(false) => {
                f.write_str("Stimulation STOPPED - DAC forced to 0V (0x8000)")
            }
            Self::CommandSent { command, packet } => write!(
                f,
                "{command}: data sent successfully (DAC={} ({:+.3} V), Pulse={}µs, Freq={}Hz)",
                packet.dac,
                packet.dac.to_volts(),
                packet.pulse_width_us,
                packet.frequency_hz
            ),
            Self::CommandFailed { command, reason } => write!(f, "{command} failed: {reason}"),
            Self::Info(message) => f.write_str(message),
        }
    }
}

/// A timestamped status event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Microseconds since the Unix epoch
    pub timestamp_us: u64,
    /// Event payload
    pub kind: StatusKind,
}

impl StatusEvent {
    /// Stamp `kind` with the current wall-clock time.
    #[must_use]
    pub fn now(kind: StatusKind) -> Self {
        let timestamp_us = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        Self { timestamp_us, kind }
    }

    /// Timestamp in the host's local time zone.
    pub fn local_time(&self) -> Option<DateTime<Local>> {
        let secs = i64::try_from(self.timestamp_us / 1_000_000).ok()?;
        let nanos = u32::try_from((self.timestamp_us % 1_000_000) * 1_000).ok()?;
        Local.timestamp_opt(secs, nanos).single()
    }
}

impl fmt::Display for StatusEvent {
    /// Renders `[HH:MM:SS] message` in local time.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local_time() {
            Some(time) => write!(f, "[{}] {}", time.format("%H:%M:%S"), self.kind),
            None => write!(f, "[--:--:--] {}", self.kind),
        }
    }
}

// ============================================================================
// Event Sink
// ============================================================================

/// Sending half of the status event channel.
///
/// Emitting never blocks: if the consumer falls behind, events are dropped
/// from the channel but still reach the log.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<StatusEvent>,
}

impl EventSink {
    /// Create a sink and its receiver.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Log and publish an event.
    pub fn emit(&self, kind: StatusKind) {
        if kind.is_failure() {
            tracing::warn!("{kind}");
        } else {
            tracing::info!("{kind}");
        }

        if let Err(e) = self.tx.try_send(StatusEvent::now(kind)) {
            tracing::debug!("Status event not delivered: {e}");
        }
    }
}
