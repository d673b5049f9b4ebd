//! BLE transports for the Chronos stimulator
//!
//! - [`link`]: The [`BleLink`] capability every transport implements
//! - [`gatt`]: Service and characteristic UUIDs of the device
//! - [`simulated`]: In-process virtual Chronos device
//! - [`ble`]: btleplug transport (requires `ble` feature)
//!
//! The session layer only ever talks to a `BleLink`, so the simulated device
//! and the real radio are interchangeable:
//!
//! ```rust,ignore
//! use chronos_native::bridge::SimulatedLink;
//! use chronos_native::{CommandDispatcher, SessionConfig};
//!
//! let (link, device) = SimulatedLink::new();
//! let (dispatcher, mut events) = CommandDispatcher::spawn(link, SessionConfig::default());
//!
//! dispatcher.scan_and_connect().await?;
//! dispatcher.force_stop(500, 100).await?;
//! assert_eq!(device.received().len(), 1);
//! ```

#[cfg(feature = "ble")]
pub mod ble;

pub mod gatt;
pub mod link;
pub mod simulated;

// Re-export key types
pub use gatt::{COMMAND_CHAR_UUID, DEVICE_NAME_FILTER, SERVICE_UUID, TELEMETRY_CHAR_UUID};
pub use link::{BleLink, DiscoveredDevice, EstablishedLink, LinkError};
pub use simulated::{SimulatedDevice, SimulatedLink, SimulatedSession};

#[cfg(feature = "ble")]
pub use ble::{BtleplugLink, BtleplugSession};
