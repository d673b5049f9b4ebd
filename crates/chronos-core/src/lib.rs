//! Chronos Core - `no_std` compatible types for the Chronos stimulator
//!
//! This crate holds everything the host and the device firmware must agree on
//! bit-for-bit: the analog front-end constants, the bipolar DAC encoding and
//! the 6-byte stimulation command packet.
//!
//! # Modules
//!
//! - [`types`]: Hardware constants, [`DacCode`] and [`StimulationParameters`]
//! - [`dac`]: Microamp to DAC code conversion
//! - [`protocol`]: Wire format of the stimulation command
//! - [`error`]: Parameter validation and codec errors
//!
//! # Features
//!
//! - `std`: Enable standard library support (on by default)
//!
//! # Example
//!
//! ```rust
//! use chronos_core::{dac, CommandPacket, DacCode};
//!
//! let code = dac::encode(0.0);
//! assert_eq!(code, DacCode::ZERO);
//!
//! let packet = CommandPacket::new(code, 500, 100);
//! assert_eq!(packet.to_bytes(), [0x00, 0x80, 0xF4, 0x01, 0x64, 0x00]);
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[cfg(feature = "std")]
extern crate std;

pub mod dac;
pub mod error;
pub mod protocol;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{PacketField, ParameterError, ProtocolError};
pub use protocol::CommandPacket;
pub use types::{DacCode, StimulationParameters, MAX_CURRENT_UA, R_SENSE_OHMS, V_REF};
