//! GATT layout of the Chronos device
//!
//! The firmware exposes the Nordic UART Service. Stimulation commands are
//! written to the RX characteristic; the TX characteristic carries
//! notifications the host does not consume.

use uuid::Uuid;

/// Nordic UART Service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// RX characteristic (host writes commands here)
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// TX characteristic (device notifications, unused)
pub const TELEMETRY_CHAR_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Substring matched against the advertised local name
pub const DEVICE_NAME_FILTER: &str = "Chronos";

/// Check if an advertised name belongs to a Chronos device.
#[must_use]
pub fn matches_name(advertised: &str, filter: &str) -> bool {
    advertised.contains(filter)
}
