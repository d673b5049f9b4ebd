//! Transport capability used by the link worker.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Failures reported by a BLE transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// No Bluetooth adapter on this host
    #[error("No Bluetooth adapter found")]
    NoAdapter,

    /// Connection attempt failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Peripheral does not expose the characteristic
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    /// Write was rejected by the transport
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// The link went away while an operation was in flight
    #[error("Link lost: {0}")]
    Dropped(String),

    /// Any other transport error
    #[error("BLE error: {0}")]
    Transport(String),
}

// ============================================================================
// Link Types
// ============================================================================

/// A peripheral found during a scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Transport-specific identifier used to connect
    pub id: String,
    /// Advertised local name
    pub name: String,
    /// Signal strength in dBm, if reported
    pub rssi: Option<i16>,
}

/// An established connection.
///
/// `drops` yields a reason string if the link is lost without the host asking
/// for it. A closed `drops` channel is treated the same way.
#[derive(Debug)]
pub struct EstablishedLink<S> {
    /// Handle passed back to `write` and `disconnect`
    pub session: S,
    /// Unexpected link loss notifications
    pub drops: mpsc::Receiver<String>,
}

/// A BLE transport able to reach one Chronos device at a time.
///
/// All methods are driven from a single task; implementations need not be
/// reentrant.
#[async_trait]
pub trait BleLink: Send + 'static {
    /// Per-connection handle
    type Session: Send + Sync + 'static;

    /// Scan for up to `window` and return the first device whose advertised
    /// name contains `name_filter`.
    async fn scan(&mut self, name_filter: &str, window: Duration) -> Result<Option<DiscoveredDevice>, LinkError>;

    /// Connect to a discovered device.
    async fn connect(&mut self, device: &DiscoveredDevice) -> Result<EstablishedLink<Self::Session>, LinkError>;

    /// Write `bytes` to `characteristic`, waiting for the acknowledgment.
    async fn write(&mut self, session: &Self::Session, characteristic: Uuid, bytes: &[u8]) -> Result<(), LinkError>;

    /// Close `session`.
    async fn disconnect(&mut self, session: Self::Session) -> Result<(), LinkError>;
}
