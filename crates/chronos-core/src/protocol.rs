//! Wire format of the stimulation command
//!
//! A command is exactly six bytes, written to the device's RX characteristic
//! with no header, framing or checksum:
//!
//! ```text
//! offset  size  field
//! 0       2     dac_code        (u16, little-endian)
//! 2       2     pulse_width_us  (u16, little-endian)
//! 4       2     frequency_hz    (u16, little-endian)
//! ```
//!
//! The firmware drops any write whose length is not six.

use serde::{Deserialize, Serialize};

use crate::error::{PacketField, ProtocolError};
use crate::types::{DacCode, U16_FIELD_MAX};

// ============================================================================
// Command Packet
// ============================================================================

/// One stimulation command.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandPacket {
    /// DAC output code
    pub dac: DacCode,
    /// Pulse width in µs
    pub pulse_width_us: u16,
    /// Repetition frequency in Hz
    pub frequency_hz: u16,
}

impl CommandPacket {
    /// Packet size in bytes
    pub const SIZE: usize = 6;

    /// Create a new packet.
    #[inline]
    #[must_use]
    pub const fn new(dac: DacCode, pulse_width_us: u16, frequency_hz: u16) -> Self {
        Self { dac, pulse_width_us, frequency_hz }
    }

    /// Create a stop packet: zero output with the given timing.
    #[inline]
    #[must_use]
    pub const fn stop(pulse_width_us: u16, frequency_hz: u16) -> Self {
        Self::new(DacCode::ZERO, pulse_width_us, frequency_hz)
    }

    /// Build a packet from unchecked integers.
    ///
    /// No clamping is done; the caller is expected to have validated already.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::OutOfRange`] naming the first field outside
    /// `0..=65535`.
    pub fn from_fields(dac: i64, pulse_width_us: i64, frequency_hz: i64) -> Result<Self, ProtocolError> {
        let dac = field_u16(PacketField::DacCode, dac)?;
        let pulse_width_us = field_u16(PacketField::PulseWidth, pulse_width_us)?;
        let frequency_hz = field_u16(PacketField::Frequency, frequency_hz)?;

        Ok(Self::new(DacCode::from_raw(dac), pulse_width_us, frequency_hz))
    }

    /// Check if this packet commands zero output.
    #[inline]
    #[must_use]
    pub const fn is_stop(&self) -> bool {
        self.dac.is_zero_output()
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let dac = self.dac.to_raw().to_le_bytes();
        let pw = self.pulse_width_us.to_le_bytes();
        let freq = self.frequency_hz.to_le_bytes();

        [dac[0], dac[1], pw[0], pw[1], freq[0], freq[1]]
    }

    /// Parse wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::LengthMismatch`] unless `bytes` is exactly
    /// [`Self::SIZE`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let &[d0, d1, p0, p1, f0, f1] = bytes else {
            return Err(ProtocolError::LengthMismatch {
                received: bytes.len(),
                expected: Self::SIZE,
            });
        };

        Ok(Self {
            dac: DacCode::from_raw(u16::from_le_bytes([d0, d1])),
            pulse_width_us: u16::from_le_bytes([p0, p1]),
            frequency_hz: u16::from_le_bytes([f0, f1]),
        })
    }
}

fn field_u16(field: PacketField, value: i64) -> Result<u16, ProtocolError> {
    if (0..=U16_FIELD_MAX).contains(&value) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(value as u16)
    } else {
        Err(ProtocolError::OutOfRange { field, value })
    }
}
