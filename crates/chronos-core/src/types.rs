//! Core data types for the Chronos stimulator
//!
//! The analog chain is a DAC8832 in bipolar mode driving an LT1990-10
//! difference amplifier across a sense resistor:
//!
//! ```text
//! I     = 10 * V_DAC / R_SENSE
//! V_DAC = I * R_SENSE / 10
//! ```
//!
//! DAC8832 bipolar transfer function:
//!
//! | Code     | Output                      |
//! |----------|-----------------------------|
//! | `0xFFFF` | `+V_REF * (32767 / 32768)`  |
//! | `0x8001` | `+V_REF * (1 / 32768)`      |
//! | `0x8000` | `0 V`                       |
//! | `0x7FFF` | `-V_REF * (1 / 32768)`      |
//! | `0x0000` | `-V_REF`                    |

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParameterError;

// ============================================================================
// Hardware Constants
// ============================================================================

/// DAC reference voltage in volts
pub const V_REF: f64 = 3.3;

/// Current sense resistor in ohms
pub const R_SENSE_OHMS: f64 = 100.0;

/// Gain of the current sense amplifier (LT1990-10)
pub const SENSE_GAIN: f64 = 10.0;

/// Maximum output current in µA, `floor(V_REF * 10 / R_SENSE * 1e6)`
pub const MAX_CURRENT_UA: i64 = 330_000;

/// Half of the DAC code space; one side of the bipolar range
pub const DAC_HALF_SCALE: f64 = 32768.0;

/// Largest value a 16-bit wire field can carry
pub const U16_FIELD_MAX: i64 = 0xFFFF;

// ============================================================================
// DAC Code
// ============================================================================

/// A 16-bit bipolar DAC code.
///
/// `0x8000` is zero output. Values above it drive positive current, values
/// below it drive negative current.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DacCode(u16);

impl DacCode {
    /// Zero output (0 V). The only code sent while stimulation is disabled.
    pub const ZERO: Self = Self(0x8000);

    /// Most negative output
    pub const MIN: Self = Self(0x0000);

    /// Most positive output
    pub const MAX: Self = Self(0xFFFF);

    /// Wrap a raw code read back from the wire.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw 16-bit value.
    #[inline]
    #[must_use]
    pub const fn to_raw(self) -> u16 {
        self.0
    }

    /// Check if this code produces zero output.
    #[inline]
    #[must_use]
    pub const fn is_zero_output(self) -> bool {
        self.0 == Self::ZERO.0
    }

    /// Nominal DAC output voltage for this code.
    #[must_use]
    pub fn to_volts(self) -> f64 {
        (f64::from(self.0) - DAC_HALF_SCALE) / DAC_HALF_SCALE * V_REF
    }

    /// Nominal output current in µA for this code.
    #[must_use]
    pub fn to_current_ua(self) -> f64 {
        SENSE_GAIN * self.to_volts() / R_SENSE_OHMS * 1_000_000.0
    }
}

impl Default for DacCode {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for DacCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

// ============================================================================
// Stimulation Parameters
// ============================================================================

/// Operator-supplied stimulation parameters.
///
/// Fields hold the raw operator input; call [`validate`](Self::validate)
/// before encoding.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimulationParameters {
    /// Output current in µA (signed, bipolar)
    pub amplitude_ua: i64,
    /// Pulse width in µs (0-65535)
    pub pulse_width_us: i64,
    /// Repetition frequency in Hz (0-65535)
    pub frequency_hz: i64,
}

impl StimulationParameters {
    /// Default amplitude offered to the operator (1 mA)
    pub const DEFAULT_AMPLITUDE_UA: i64 = 1000;

    /// Default pulse width
    pub const DEFAULT_PULSE_WIDTH_US: i64 = 500;

    /// Default frequency
    pub const DEFAULT_FREQUENCY_HZ: i64 = 100;

    /// Create a new parameter set.
    #[inline]
    #[must_use]
    pub const fn new(amplitude_ua: i64, pulse_width_us: i64, frequency_hz: i64) -> Self {
        Self { amplitude_ua, pulse_width_us, frequency_hz }
    }

    /// Check every field against its range.
    ///
    /// # Errors
    ///
    /// Returns the first field found outside its range, checked in the order
    /// amplitude, pulse width, frequency.
    pub fn validate(&self) -> Result<(), ParameterError> {
        if !(-MAX_CURRENT_UA..=MAX_CURRENT_UA).contains(&self.amplitude_ua) {
            return Err(ParameterError::AmplitudeOutOfRange {
                requested_ua: self.amplitude_ua,
                maximum_ua: MAX_CURRENT_UA,
            });
        }
        validate_timing(self.pulse_width_us, self.frequency_hz)
    }
}

impl Default for StimulationParameters {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_AMPLITUDE_UA,
            Self::DEFAULT_PULSE_WIDTH_US,
            Self::DEFAULT_FREQUENCY_HZ,
        )
    }
}

/// Check pulse width and frequency without an amplitude.
///
/// Used by the stop command, which carries timing but never a current.
///
/// # Errors
///
/// Returns [`ParameterError::PulseWidthOutOfRange`] or
/// [`ParameterError::FrequencyOutOfRange`].
pub fn validate_timing(pulse_width_us: i64, frequency_hz: i64) -> Result<(), ParameterError> {
    if !(0..=U16_FIELD_MAX).contains(&pulse_width_us) {
        return Err(ParameterError::PulseWidthOutOfRange { requested_us: pulse_width_us });
    }
    if !(0..=U16_FIELD_MAX).contains(&frequency_hz) {
        return Err(ParameterError::FrequencyOutOfRange { requested_hz: frequency_hz });
    }
    Ok(())
}
