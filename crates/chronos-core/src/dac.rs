//! Microamp to DAC code conversion
//!
//! The conversion runs in a fixed order on `f64` so every host and the
//! reference test vectors agree on the exact code, including the one-LSB
//! cases either side of zero:
//!
//! 1. `V_DAC = (I_uA * R_SENSE / 10) / 1e6`
//! 2. `ratio = V_DAC / V_REF`, saturated to `[-1, 1]`
//! 3. `code = floor((ratio + 1) * 32768)`, saturated to `[0, 65535]`
//!
//! Out-of-range currents saturate; they are never an error here. Range
//! checking of operator input happens before encoding, see
//! [`StimulationParameters::validate`](crate::StimulationParameters::validate).

use crate::types::{DacCode, DAC_HALF_SCALE, R_SENSE_OHMS, SENSE_GAIN, V_REF};

/// Convert a current in µA to its bipolar DAC code.
///
/// NaN maps to [`DacCode::ZERO`].
#[must_use]
pub fn encode(amplitude_ua: f64) -> DacCode {
    if amplitude_ua.is_nan() {
        return DacCode::ZERO;
    }

    let v_dac = (amplitude_ua * R_SENSE_OHMS / SENSE_GAIN) / 1_000_000.0;
    let ratio = (v_dac / V_REF).clamp(-1.0, 1.0);

    // ratio == 1.0 lands on 65536
    let code = libm::floor((ratio + 1.0) * DAC_HALF_SCALE).clamp(0.0, 65535.0);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    DacCode::from_raw(code as u16)
}

/// Convert an integral current in µA to its DAC code.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn encode_ua(amplitude_ua: i64) -> DacCode {
    encode(amplitude_ua as f64)
}

/// Current in µA that corresponds to exactly one DAC LSB.
#[must_use]
pub fn lsb_current_ua() -> f64 {
    (SENSE_GAIN * (V_REF * (1.0 / DAC_HALF_SCALE)) / R_SENSE_OHMS) * 1_000_000.0
}
