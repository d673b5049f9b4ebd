//! Chronos Native - Host-side BLE session for the Chronos stimulator
//!
//! This crate runs the host half of the stimulator link:
//! - Discovery and connection of a single Chronos peripheral
//! - A connection state machine with session epochs
//! - A single link worker that serializes every BLE operation
//! - Command dispatch with bounded waits and status events
//!
//! # Modules
//!
//! - [`bridge`]: BLE transports (btleplug, simulated device)
//! - [`session`]: Connection state, dispatcher, operator controls, events
//!
//! # Features
//!
//! - `ble`: Real Bluetooth transport through btleplug

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bridge;
pub mod session;

// Re-export key types
pub use bridge::{BleLink, DiscoveredDevice, EstablishedLink, LinkError, SimulatedDevice, SimulatedLink};
pub use session::{
    CommandDispatcher, CommandError, ConnectionSnapshot, ConnectionState, OperatorPanel,
    SessionConfig, SessionId, StatusEvent, StatusKind,
};

#[cfg(feature = "ble")]
pub use bridge::BtleplugLink;
