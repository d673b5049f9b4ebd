//! Error types for the Chronos core
//!
//! Both error families are plain enums with hand-written `Display` so they
//! stay usable without the standard library. Parameter errors come from
//! operator input; protocol errors mean a caller handed the codec something
//! it must never see.

use core::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Parameter Errors
// ============================================================================

/// Stimulation parameters outside their permitted range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterError {
    /// Amplitude beyond ±MAX_CURRENT
    AmplitudeOutOfRange {
        /// Requested current in µA
        requested_ua: i64,
        /// Maximum magnitude in µA
        maximum_ua: i64,
    },
    /// Pulse width outside 0-65535 µs
    PulseWidthOutOfRange {
        /// Requested pulse width in µs
        requested_us: i64,
    },
    /// Frequency outside 0-65535 Hz
    FrequencyOutOfRange {
        /// Requested frequency in Hz
        requested_hz: i64,
    },
}

impl fmt::Display for ParameterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AmplitudeOutOfRange { requested_ua, maximum_ua } => {
                write!(
                    f,
                    "DAC amplitude must be between -{maximum_ua} and {maximum_ua} µA (got {requested_ua})"
                )
            }
            Self::PulseWidthOutOfRange { requested_us } => {
                write!(f, "Pulse width must be 0-65535 µs (got {requested_us})")
            }
            Self::FrequencyOutOfRange { requested_hz } => {
                write!(f, "Frequency must be 0-65535 Hz (got {requested_hz})")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ParameterError {}

// ============================================================================
// Protocol Errors
// ============================================================================

/// Field of the stimulation command packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketField {
    /// DAC code (bytes 0-1)
    DacCode,
    /// Pulse width (bytes 2-3)
    PulseWidth,
    /// Frequency (bytes 4-5)
    Frequency,
}

impl fmt::Display for PacketField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DacCode => "dac_code",
            Self::PulseWidth => "pulse_width_us",
            Self::Frequency => "frequency_hz",
        };
        f.write_str(name)
    }
}

/// Errors in the stimulation command codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolError {
    /// Integer does not fit its 16-bit field
    OutOfRange {
        /// Offending field
        field: PacketField,
        /// Value that was supplied
        value: i64,
    },
    /// Payload is not exactly one packet long
    LengthMismatch {
        /// Bytes received
        received: usize,
        /// Bytes expected
        expected: usize,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { field, value } => {
                write!(f, "Field {field} value {value} does not fit in 16 bits")
            }
            Self::LengthMismatch { received, expected } => {
                write!(f, "Data length mismatch: expected {expected}, got {received}")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ProtocolError {}
