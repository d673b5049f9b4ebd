//! Operator controls
//!
//! [`OperatorPanel`] holds what the operator sees: the three parameter
//! fields as typed and the "enable stimulation" switch. While the switch is
//! off every send carries zero output. Turning it off while connected sends
//! a stop right away.

use chronos_core::StimulationParameters;

use super::dispatcher::{CommandDispatcher, CommandError, CommandResult};
use super::events::{CommandKind, StatusKind};

/// Parameter fields as entered by the operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterForm {
    /// Amplitude in µA
    pub amplitude_ua: String,
    /// Pulse width in µs
    pub pulse_width_us: String,
    /// Frequency in Hz
    pub frequency_hz: String,
}

impl Default for ParameterForm {
    fn default() -> Self {
        Self {
            amplitude_ua: StimulationParameters::DEFAULT_AMPLITUDE_UA.to_string(),
            pulse_width_us: StimulationParameters::DEFAULT_PULSE_WIDTH_US.to_string(),
            frequency_hz: StimulationParameters::DEFAULT_FREQUENCY_HZ.to_string(),
        }
    }
}

fn parse_field(field: &'static str, input: &str) -> CommandResult<i64> {
    input.trim().parse().map_err(|_| CommandError::InvalidInput {
        field,
        input: input.to_string(),
    })
}

/// Digits only; anything else falls back to `default`.
fn digits_or(input: &str, default: i64) -> i64 {
    let input = input.trim();
    if !input.is_empty() && input.bytes().all(|b| b.is_ascii_digit()) {
        input.parse().unwrap_or(default)
    } else {
        default
    }
}

impl ParameterForm {
    /// Parse all three fields.
    ///
    /// Range checks are left to [`StimulationParameters::validate`].
    ///
    /// # Errors
    ///
    /// [`CommandError::InvalidInput`] naming the first field that is not an
    /// integer.
    pub fn parse(&self) -> CommandResult<StimulationParameters> {
        Ok(StimulationParameters::new(
            parse_field("amplitude", &self.amplitude_ua)?,
            parse_field("pulse width", &self.pulse_width_us)?,
            parse_field("frequency", &self.frequency_hz)?,
        ))
    }

    /// Timing for a stop command. Unusable fields default to 500 µs / 100 Hz.
    pub fn stop_timing(&self) -> (i64, i64) {
        (
            digits_or(&self.pulse_width_us, StimulationParameters::DEFAULT_PULSE_WIDTH_US),
            digits_or(&self.frequency_hz, StimulationParameters::DEFAULT_FREQUENCY_HZ),
        )
    }
}

/// Operator state on top of a [`CommandDispatcher`].
#[derive(Debug)]
pub struct OperatorPanel {
    dispatcher: CommandDispatcher,
    enabled: bool,
    /// Parameter fields
    pub form: ParameterForm,
}

impl OperatorPanel {
    /// Create a panel with stimulation disabled and default fields.
    #[must_use]
    pub fn new(dispatcher: CommandDispatcher) -> Self {
        Self {
            dispatcher,
            enabled: false,
            form: ParameterForm::default(),
        }
    }

    /// Underlying dispatcher.
    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Check if stimulation output is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Flip the enable switch.
    ///
    /// Disabling while connected sends a stop and returns its outcome.
    pub async fn set_enabled(&mut self, enabled: bool) -> Option<CommandResult<chronos_core::CommandPacket>> {
        self.enabled = enabled;
        self.dispatcher.events().emit(StatusKind::StimulationEnabled(enabled));

        if !enabled && self.dispatcher.snapshot().is_connected() {
            Some(self.stop().await)
        } else {
            None
        }
    }

    /// Send the form with the current enable state.
    ///
    /// # Errors
    ///
    /// [`CommandError::InvalidInput`] for unparsable fields, otherwise
    /// whatever [`CommandDispatcher::send_parameters`] returns.
    pub async fn send(&self) -> CommandResult<chronos_core::CommandPacket> {
        let params = match self.form.parse() {
            Ok(params) => params,
            Err(e) => {
                self.dispatcher.events().emit(StatusKind::CommandFailed {
                    command: CommandKind::SendParameters,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        self.dispatcher.send_parameters(params, self.enabled).await
    }

    /// Send zero output with the form's timing.
    ///
    /// # Errors
    ///
    /// Whatever [`CommandDispatcher::force_stop`] returns.
    pub async fn stop(&self) -> CommandResult<chronos_core::CommandPacket> {
        let (pulse_width_us, frequency_hz) = self.form.stop_timing();
        self.dispatcher.force_stop(pulse_width_us, frequency_hz).await
    }

    /// Disable stimulation and stop output.
    pub async fn emergency_stop(&mut self) -> Option<CommandResult<chronos_core::CommandPacket>> {
        self.set_enabled(false).await
    }

    /// Tear the session down, stopping output with the form's timing.
    pub async fn shutdown(self) {
        let (pulse_width_us, frequency_hz) = self.form.stop_timing();
        self.dispatcher.shutdown(pulse_width_us, frequency_hz).await;
    }

    /// Enable stimulation and send the form.
    pub async fn quick_start(&mut self) -> Option<CommandResult<chronos_core::CommandPacket>> {
        self.set_enabled(true).await;
        if self.dispatcher.snapshot().is_connected() {
            Some(self.send().await)
        } else {
            None
        }
    }
}
