//! Command dispatcher
//!
//! [`CommandDispatcher`] is the caller-side handle onto the link worker. It
//! checks the published connection state, validates and encodes parameters,
//! queues one request per operation, and waits for the reply with a bound.
//! A timed-out caller gets [`CommandError::Timeout`] right away; the worker
//! finishes the operation anyway and throws the result away.
//!
//! Every failure is returned and also emitted as a status event.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use chronos_core::types::validate_timing;
use chronos_core::{dac, CommandPacket, DacCode, ParameterError, ProtocolError, StimulationParameters};

use crate::bridge::{BleLink, DiscoveredDevice, LinkError};

use super::config::SessionConfig;
use super::connection::{ConnectionSnapshot, ConnectionState, SessionId};
use super::events::{CommandKind, EventSink, StatusEvent, StatusKind};
use super::worker::{LinkRequest, LinkWorker};

// ============================================================================
// Error Types
// ============================================================================

/// Errors returned by dispatcher operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Parameters outside their range
    #[error("Invalid parameter: {0}")]
    InvalidParameter(#[from] ParameterError),

    /// Operator text that is not a number
    #[error("Invalid {field} value: {input:?}")]
    InvalidInput {
        /// Field name
        field: &'static str,
        /// Text as entered
        input: String,
    },

    /// No session to send on
    #[error("Not connected to device")]
    NotConnected,

    /// A scan, connection or session is already in progress
    #[error("Connection already active ({0})")]
    AlreadyActive(ConnectionState),

    /// Scan finished without a matching device
    #[error("Chronos device not found")]
    DeviceNotFound,

    /// Scan did not return in time
    #[error("Scan did not return within {0:?}")]
    ScanTimeout(Duration),

    /// Transport failure
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Bounded wait expired
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out
        operation: CommandKind,
        /// Wait that expired
        after: Duration,
    },

    /// Value does not fit its packet field
    #[error("Packet field out of range: {0}")]
    OutOfRange(#[from] ProtocolError),

    /// The link worker is gone
    #[error("Link worker stopped")]
    WorkerStopped,
}

/// Result type for dispatcher operations.
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Dispatcher
// ============================================================================

/// Handle for issuing commands to the Chronos device.
///
/// Cheap to clone; all clones feed the same worker.
#[derive(Clone, Debug)]
pub struct CommandDispatcher {
    requests: mpsc::Sender<LinkRequest>,
    snapshots: watch::Receiver<ConnectionSnapshot>,
    events: EventSink,
    config: Arc<SessionConfig>,
}

impl CommandDispatcher {
    /// Start a link worker on `link` and return its handle and status events.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn<L: BleLink>(link: L, config: SessionConfig) -> (Self, mpsc::Receiver<StatusEvent>) {
        let (events, event_rx) = EventSink::channel(config.event_capacity);
        let (request_tx, request_rx) = mpsc::channel(config.request_queue_depth.max(1));
        let (worker, snapshots) = LinkWorker::new(link, config.clone(), events.clone(), request_rx);

        tokio::spawn(worker.run());

        let dispatcher = Self {
            requests: request_tx,
            snapshots,
            events,
            config: Arc::new(config),
        };
        (dispatcher, event_rx)
    }

    /// Latest published connection state.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.snapshots.borrow().state
    }

    /// Watch connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshots.clone()
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Event sink shared with the worker.
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Scan for a device without connecting.
    ///
    /// # Errors
    ///
    /// [`CommandError::AlreadyActive`] unless disconnected,
    /// [`CommandError::ScanTimeout`] or [`CommandError::Link`] if the scan
    /// itself fails.
    pub async fn scan(&self) -> CommandResult<Option<DiscoveredDevice>> {
        let result = match self.state() {
            ConnectionState::Disconnected => {
                self.request(CommandKind::Scan, self.config.connect_timeout, |reply| {
                    LinkRequest::Scan { reply }
                })
                .await
            }
            state => Err(CommandError::AlreadyActive(state)),
        };
        self.report(CommandKind::Scan, result)
    }

    /// Scan for the first Chronos device and connect to it.
    ///
    /// # Errors
    ///
    /// [`CommandError::AlreadyActive`] while scanning, connecting or
    /// connected; [`CommandError::DeviceNotFound`],
    /// [`CommandError::ScanTimeout`], [`CommandError::Link`] or
    /// [`CommandError::Timeout`] if the attempt fails.
    pub async fn scan_and_connect(&self) -> CommandResult<SessionId> {
        let state = self.state();
        let result = if state.is_active() {
            Err(CommandError::AlreadyActive(state))
        } else {
            self.request(CommandKind::Connect, self.config.connect_timeout, |reply| {
                LinkRequest::Connect { reply }
            })
            .await
        };
        self.report(CommandKind::Connect, result)
    }

    /// Close the current session.
    ///
    /// # Errors
    ///
    /// [`CommandError::NotConnected`] if there is no session.
    pub async fn disconnect(&self) -> CommandResult<()> {
        let result = if self.snapshot().is_connected() {
            self.request(CommandKind::Disconnect, self.config.disconnect_timeout, |reply| {
                LinkRequest::Disconnect { reply }
            })
            .await
        } else {
            Err(CommandError::NotConnected)
        };
        self.report(CommandKind::Disconnect, result)
    }

    /// Send stimulation parameters.
    ///
    /// With `enabled == false` the amplitude is ignored and zero output is
    /// sent with the given timing.
    ///
    /// # Errors
    ///
    /// [`CommandError::NotConnected`] without a session,
    /// [`CommandError::InvalidParameter`] before anything is encoded,
    /// [`CommandError::Timeout`] or [`CommandError::Link`] from the write.
    pub async fn send_parameters(&self, params: StimulationParameters, enabled: bool) -> CommandResult<CommandPacket> {
        let result = self.send_parameters_inner(params, enabled).await;
        self.report(CommandKind::SendParameters, result)
    }

    async fn send_parameters_inner(&self, params: StimulationParameters, enabled: bool) -> CommandResult<CommandPacket> {
        let session = self.connected_session()?;
        params.validate()?;

        let StimulationParameters { amplitude_ua, pulse_width_us, frequency_hz } = params;
        let dac = if enabled {
            let code = dac::encode_ua(amplitude_ua);
            self.events.emit(StatusKind::Info(format!(
                "Stimulation ENABLED - Sending: DAC={amplitude_ua}µA ({code}), Pulse={pulse_width_us}µs, Freq={frequency_hz}Hz"
            )));
            code
        } else {
            self.events.emit(StatusKind::Info(format!(
                "Stimulation DISABLED - Sending: DAC=0V (overriding {amplitude_ua}µA), Pulse={pulse_width_us}µs, Freq={frequency_hz}Hz"
            )));
            DacCode::ZERO
        };

        let packet = CommandPacket::from_fields(i64::from(dac.to_raw()), pulse_width_us, frequency_hz)?;
        self.write(CommandKind::SendParameters, session, packet).await
    }

    /// Send zero output with the given timing.
    ///
    /// # Errors
    ///
    /// [`CommandError::NotConnected`] without a session,
    /// [`CommandError::InvalidParameter`] for out-of-range timing,
    /// [`CommandError::Timeout`] or [`CommandError::Link`] from the write.
    pub async fn force_stop(&self, pulse_width_us: i64, frequency_hz: i64) -> CommandResult<CommandPacket> {
        let result = self.force_stop_inner(pulse_width_us, frequency_hz).await;
        self.report(CommandKind::ForceStop, result)
    }

    async fn force_stop_inner(&self, pulse_width_us: i64, frequency_hz: i64) -> CommandResult<CommandPacket> {
        let session = self.connected_session()?;
        validate_timing(pulse_width_us, frequency_hz)?;

        let packet = CommandPacket::from_fields(i64::from(DacCode::ZERO.to_raw()), pulse_width_us, frequency_hz)?;
        self.events.emit(StatusKind::Info(format!("Sending STOP command: DAC=0V ({})", packet.dac)));
        self.write(CommandKind::ForceStop, session, packet).await
    }

    /// Stop output, disconnect and stop the worker.
    ///
    /// The stop carries the operator's current timing. Each step is best
    /// effort; failures are logged and the next step runs.
    pub async fn shutdown(self, pulse_width_us: i64, frequency_hz: i64) {
        if self.snapshot().is_connected() {
            let stop = self.force_stop(pulse_width_us, frequency_hz).await;
            if let Err(e) = stop {
                tracing::warn!("Shutdown: stop command failed: {e}");
            }
            if let Err(e) = self.disconnect().await {
                tracing::warn!("Shutdown: disconnect failed: {e}");
            }
        }

        let (reply, done) = oneshot::channel();
        let stop_worker = async {
            self.requests.send(LinkRequest::Shutdown { reply }).await.ok()?;
            done.await.ok()
        };
        match tokio::time::timeout(self.config.disconnect_timeout, stop_worker).await {
            Ok(Some(())) => tracing::debug!("Shutdown complete"),
            Ok(None) => tracing::debug!("Link worker was already stopped"),
            Err(_) => tracing::warn!(
                "Link worker did not stop within {:?}",
                self.config.disconnect_timeout
            ),
        }
    }

    fn connected_session(&self) -> CommandResult<SessionId> {
        let snapshot = self.snapshots.borrow();
        match (snapshot.state, snapshot.session) {
            (ConnectionState::Connected, Some(session)) => Ok(session),
            _ => Err(CommandError::NotConnected),
        }
    }

    async fn write(&self, command: CommandKind, session: SessionId, packet: CommandPacket) -> CommandResult<CommandPacket> {
        self.request(command, self.config.command_timeout, |reply| LinkRequest::Write {
            session,
            command,
            packet,
            reply,
        })
        .await?;

        self.events.emit(StatusKind::CommandSent { command, packet });
        Ok(packet)
    }

    /// Queue one request and wait up to `wait` for its reply.
    async fn request<T>(
        &self,
        command: CommandKind,
        wait: Duration,
        build: impl FnOnce(oneshot::Sender<CommandResult<T>>) -> LinkRequest,
    ) -> CommandResult<T> {
        let (reply, response) = oneshot::channel();
        let request = build(reply);

        let exchange = async {
            self.requests
                .send(request)
                .await
                .map_err(|_| CommandError::WorkerStopped)?;
            response.await.map_err(|_| CommandError::WorkerStopped)?
        };

        tokio::time::timeout(wait, exchange)
            .await
            .unwrap_or(Err(CommandError::Timeout { operation: command, after: wait }))
    }

    fn report<T>(&self, command: CommandKind, result: CommandResult<T>) -> CommandResult<T> {
        if let Err(e) = &result {
            self.events.emit(StatusKind::CommandFailed { command, reason: e.to_string() });
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{EstablishedLink, SimulatedDevice, SimulatedLink};
    use async_trait::async_trait;
    use chronos_core::{PacketField, MAX_CURRENT_UA};
    use uuid::Uuid;

    async fn connected() -> (CommandDispatcher, SimulatedDevice, mpsc::Receiver<StatusEvent>) {
        let (link, device) = SimulatedLink::new();
        let (dispatcher, events) = CommandDispatcher::spawn(link, SessionConfig::default());
        dispatcher.scan_and_connect().await.unwrap();
        (dispatcher, device, events)
    }

    fn drain(rx: &mut mpsc::Receiver<StatusEvent>) -> Vec<StatusKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_connected_sends_nothing() {
        let (link, device) = SimulatedLink::new();
        let (dispatcher, mut events) = CommandDispatcher::spawn(link, SessionConfig::default());

        let send = dispatcher.send_parameters(StimulationParameters::default(), true).await;
        assert_eq!(send, Err(CommandError::NotConnected));

        let stop = dispatcher.force_stop(500, 100).await;
        assert_eq!(stop, Err(CommandError::NotConnected));

        assert_eq!(dispatcher.disconnect().await, Err(CommandError::NotConnected));
        assert_eq!(device.write_count(), 0);

        let kinds = drain(&mut events);
        assert!(kinds.contains(&StatusKind::CommandFailed {
            command: CommandKind::SendParameters,
            reason: "Not connected to device".to_string(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_publishes_session() {
        let (dispatcher, device, mut events) = connected().await;

        let snapshot = dispatcher.snapshot();
        assert!(snapshot.is_connected());
        assert_eq!(snapshot.device.as_deref(), Some("Chronos-SIM"));
        assert!(device.is_connected());

        let kinds = drain(&mut events);
        assert!(kinds.contains(&StatusKind::StateChanged(ConnectionState::Scanning)));
        assert!(kinds.contains(&StatusKind::StateChanged(ConnectionState::Connecting)));
        assert!(kinds.contains(&StatusKind::Connected { device: "Chronos-SIM".to_string() }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_stimulation_sends_zero_code() {
        let (dispatcher, device, mut events) = connected().await;
        drain(&mut events);

        let packet = dispatcher
            .send_parameters(StimulationParameters::new(1000, 500, 100), false)
            .await
            .unwrap();

        assert_eq!(packet, CommandPacket::new(DacCode::ZERO, 500, 100));
        assert_eq!(device.received(), vec![packet]);
        assert_eq!(packet.to_bytes(), [0x00, 0x80, 0xF4, 0x01, 0x64, 0x00]);

        let overriding = drain(&mut events).into_iter().any(|kind| {
            matches!(kind, StatusKind::Info(message) if message.contains("overriding 1000µA"))
        });
        assert!(overriding);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enabled_stimulation_encodes_amplitude() {
        let (dispatcher, device, _events) = connected().await;

        let packet = dispatcher
            .send_parameters(StimulationParameters::new(1000, 200, 50), true)
            .await
            .unwrap();

        assert_eq!(packet.dac.to_raw(), 0x8063);
        assert_eq!(device.output(), Some(CommandPacket::new(DacCode::from_raw(0x8063), 200, 50)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_parameters_never_reach_link() {
        let (dispatcher, device, _events) = connected().await;

        let too_strong = dispatcher
            .send_parameters(StimulationParameters::new(MAX_CURRENT_UA + 1, 500, 100), true)
            .await;
        assert_eq!(
            too_strong,
            Err(CommandError::InvalidParameter(ParameterError::AmplitudeOutOfRange {
                requested_ua: MAX_CURRENT_UA + 1,
                maximum_ua: MAX_CURRENT_UA,
            }))
        );

        // Checked even when the amplitude would be overridden.
        let too_long = dispatcher
            .send_parameters(StimulationParameters::new(0, 65536, 100), false)
            .await;
        assert!(matches!(too_long, Err(CommandError::InvalidParameter(_))));

        let stop = dispatcher.force_stop(500, 70_000).await;
        assert_eq!(
            stop,
            Err(CommandError::InvalidParameter(ParameterError::FrequencyOutOfRange {
                requested_hz: 70_000,
            }))
        );

        assert_eq!(device.write_count(), 0);
        assert!(dispatcher.snapshot().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_leak_late_ack() {
        let (dispatcher, device, _events) = connected().await;

        device.set_write_latency(Duration::from_secs(7));
        let first = dispatcher.force_stop(500, 100).await;
        assert_eq!(
            first,
            Err(CommandError::Timeout {
                operation: CommandKind::ForceStop,
                after: Duration::from_secs(5),
            })
        );
        assert!(dispatcher.snapshot().is_connected());

        // The first write acknowledges at 7 s, while this one is queued.
        device.set_write_latency(Duration::from_millis(20));
        device.fail_next_write("GATT error 0x0E");
        let second = dispatcher.force_stop(400, 100).await;
        assert_eq!(
            second,
            Err(CommandError::Link(LinkError::WriteFailed("GATT error 0x0E".to_string())))
        );

        let third = dispatcher.force_stop(300, 100).await.unwrap();
        assert_eq!(third.pulse_width_us, 300);

        let widths: Vec<u16> = device.received().iter().map(|p| p.pulse_width_us).collect();
        assert_eq!(widths, vec![500, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_fails_in_flight_write() {
        let (dispatcher, device, mut events) = connected().await;
        device.set_write_latency(Duration::from_secs(2));

        let sender = dispatcher.clone();
        let in_flight = tokio::spawn(async move {
            sender
                .send_parameters(StimulationParameters::default(), true)
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(device.drop_link("supervision timeout"));

        let result = in_flight.await.unwrap();
        assert_eq!(
            result,
            Err(CommandError::Link(LinkError::Dropped("supervision timeout".to_string())))
        );
        assert_eq!(device.write_count(), 0);
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);

        let after = dispatcher.force_stop(500, 100).await;
        assert_eq!(after, Err(CommandError::NotConnected));

        let kinds = drain(&mut events);
        assert!(kinds.contains(&StatusKind::Disconnected {
            reason: Some("supervision timeout".to_string()),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_link_drop_is_noticed() {
        let (dispatcher, device, _events) = connected().await;
        let mut snapshots = dispatcher.subscribe();

        device.drop_link("device powered off");
        let snapshot = snapshots
            .wait_for(|s| s.state == ConnectionState::Disconnected)
            .await
            .unwrap()
            .clone();

        assert_eq!(snapshot.session, None);
        assert_eq!(
            dispatcher.send_parameters(StimulationParameters::default(), true).await,
            Err(CommandError::NotConnected)
        );

        // The slot is free again.
        assert!(dispatcher.scan_and_connect().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_rejected_by_worker() {
        let (dispatcher, device, _events) = connected().await;
        let old = dispatcher.snapshot().session.unwrap();

        dispatcher.disconnect().await.unwrap();
        let new = dispatcher.scan_and_connect().await.unwrap();
        assert!(new > old);

        let packet = CommandPacket::stop(500, 100);
        let result = dispatcher
            .request(CommandKind::ForceStop, Duration::from_secs(5), |reply| LinkRequest::Write {
                session: old,
                command: CommandKind::ForceStop,
                packet,
                reply,
            })
            .await;

        assert_eq!(result, Err(CommandError::NotConnected));
        assert_eq!(device.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_active() {
        let (link, device) = SimulatedLink::new();
        device.set_scan_delay(Duration::from_secs(3));
        let (dispatcher, _events) = CommandDispatcher::spawn(link, SessionConfig::default());

        let first = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.scan_and_connect().await }
        });

        let mut snapshots = dispatcher.subscribe();
        snapshots
            .wait_for(|s| s.state == ConnectionState::Scanning)
            .await
            .unwrap();

        assert_eq!(
            dispatcher.scan_and_connect().await,
            Err(CommandError::AlreadyActive(ConnectionState::Scanning))
        );
        assert_eq!(
            dispatcher.scan().await,
            Err(CommandError::AlreadyActive(ConnectionState::Scanning))
        );

        assert!(first.await.unwrap().is_ok());
        assert_eq!(
            dispatcher.scan_and_connect().await,
            Err(CommandError::AlreadyActive(ConnectionState::Connected))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_not_found() {
        let (link, device) = SimulatedLink::new();
        device.set_advertising(false);
        let (dispatcher, _events) = CommandDispatcher::spawn(link, SessionConfig::default());

        assert_eq!(dispatcher.scan_and_connect().await, Err(CommandError::DeviceNotFound));
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
        assert_eq!(dispatcher.scan().await, Ok(None));

        device.set_advertising(true);
        assert!(dispatcher.scan_and_connect().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_timeout() {
        let (link, device) = SimulatedLink::new();
        device.stall_scan(true);
        let (dispatcher, _events) = CommandDispatcher::spawn(link, SessionConfig::default());

        assert_eq!(
            dispatcher.scan_and_connect().await,
            Err(CommandError::ScanTimeout(Duration::from_secs(11)))
        );
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure() {
        let (link, device) = SimulatedLink::new();
        device.fail_next_connect("bonding refused");
        let (dispatcher, _events) = CommandDispatcher::spawn(link, SessionConfig::default());

        assert_eq!(
            dispatcher.scan_and_connect().await,
            Err(CommandError::Link(LinkError::ConnectionFailed("bonding refused".to_string())))
        );
        assert_eq!(dispatcher.snapshot(), ConnectionSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_wait_is_bounded() {
        let (link, device) = SimulatedLink::new();
        device.set_connect_delay(Duration::from_secs(60));
        let (dispatcher, _events) = CommandDispatcher::spawn(link, SessionConfig::default());

        assert_eq!(
            dispatcher.scan_and_connect().await,
            Err(CommandError::Timeout {
                operation: CommandKind::Connect,
                after: Duration::from_secs(15),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_run_in_order() {
        let (dispatcher, device, _events) = connected().await;
        device.set_write_latency(Duration::from_millis(50));

        let (a, b, c) = tokio::join!(
            dispatcher.force_stop(100, 1),
            dispatcher.force_stop(200, 2),
            dispatcher.force_stop(300, 3),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());

        let widths: Vec<u16> = device.received().iter().map(|p| p.pulse_width_us).collect();
        assert_eq!(widths, vec![100, 200, 300]);
        assert_eq!(device.max_concurrent_writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect() {
        let (dispatcher, device, mut events) = connected().await;
        drain(&mut events);

        dispatcher.disconnect().await.unwrap();
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
        assert!(!device.is_connected());

        let kinds = drain(&mut events);
        assert!(kinds.contains(&StatusKind::StateChanged(ConnectionState::Disconnecting)));
        assert!(kinds.contains(&StatusKind::Disconnected { reason: None }));

        assert_eq!(dispatcher.disconnect().await, Err(CommandError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_output_and_worker() {
        let (dispatcher, device, _events) = connected().await;
        dispatcher
            .send_parameters(StimulationParameters::new(2000, 500, 100), true)
            .await
            .unwrap();

        let survivor = dispatcher.clone();
        dispatcher.shutdown(500, 100).await;

        assert_eq!(device.output(), Some(CommandPacket::stop(500, 100)));
        assert!(!device.is_connected());
        assert_eq!(survivor.scan_and_connect().await, Err(CommandError::WorkerStopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_abandoned_in_queue_is_never_sent() {
        let (dispatcher, device, _events) = connected().await;
        device.set_write_latency(Duration::from_secs(12));

        let first = dispatcher.force_stop(500, 100).await;
        assert_eq!(
            first,
            Err(CommandError::Timeout {
                operation: CommandKind::ForceStop,
                after: Duration::from_secs(5),
            })
        );

        // Waits behind the first write until its own deadline passes.
        let second = dispatcher
            .send_parameters(StimulationParameters::new(2000, 500, 100), true)
            .await;
        assert_eq!(
            second,
            Err(CommandError::Timeout {
                operation: CommandKind::SendParameters,
                after: Duration::from_secs(5),
            })
        );

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(device.received(), vec![CommandPacket::stop(500, 100)]);
        assert_eq!(device.write_count(), 1);
        assert!(dispatcher.snapshot().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_abandoned_in_queue_is_never_started() {
        let (link, device) = SimulatedLink::new();
        device.set_scan_delay(Duration::from_secs(3));
        device.set_connect_delay(Duration::from_secs(13));
        device.fail_next_connect("bonding refused");
        let (dispatcher, _events) = CommandDispatcher::spawn(link, SessionConfig::default());

        let (first, second) = tokio::join!(dispatcher.scan_and_connect(), dispatcher.scan_and_connect());
        let timed_out = Err(CommandError::Timeout {
            operation: CommandKind::Connect,
            after: Duration::from_secs(15),
        });
        assert_eq!(first, timed_out);
        assert_eq!(second, timed_out);

        // The first attempt fails at 16 s; the second must not start afterwards.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
        assert!(!device.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_disconnect_frees_the_slot() {
        let (dispatcher, device, _events) = connected().await;
        device.stall_disconnect(true);

        assert_eq!(
            dispatcher.disconnect().await,
            Err(CommandError::Timeout {
                operation: CommandKind::Disconnect,
                after: Duration::from_secs(5),
            })
        );

        let mut snapshots = dispatcher.subscribe();
        snapshots
            .wait_for(|s| s.state == ConnectionState::Disconnected)
            .await
            .unwrap();

        device.stall_disconnect(false);
        assert!(dispatcher.scan_and_connect().await.is_ok());
        assert!(dispatcher.snapshot().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stop_keeps_given_timing() {
        let (dispatcher, device, _events) = connected().await;
        dispatcher
            .send_parameters(StimulationParameters::new(2000, 200, 40), true)
            .await
            .unwrap();

        dispatcher.shutdown(200, 40).await;

        assert_eq!(device.output(), Some(CommandPacket::stop(200, 40)));
        assert!(!device.is_connected());
    }

    /// Link whose acknowledgment arrives together with a link drop.
    #[derive(Default)]
    struct DropWithAck {
        drop_tx: Option<mpsc::Sender<String>>,
    }

    #[async_trait]
    impl BleLink for DropWithAck {
        type Session = ();

        async fn scan(&mut self, _filter: &str, _window: Duration) -> Result<Option<DiscoveredDevice>, LinkError> {
            Ok(Some(DiscoveredDevice {
                id: "AA:BB".to_string(),
                name: "Chronos-1".to_string(),
                rssi: None,
            }))
        }

        async fn connect(&mut self, _device: &DiscoveredDevice) -> Result<EstablishedLink<()>, LinkError> {
            let (drop_tx, drops) = mpsc::channel(1);
            self.drop_tx = Some(drop_tx);
            Ok(EstablishedLink { session: (), drops })
        }

        async fn write(&mut self, _session: &(), _characteristic: Uuid, _bytes: &[u8]) -> Result<(), LinkError> {
            if let Some(tx) = self.drop_tx.take() {
                let _ = tx.send("link lost at ack".to_string()).await;
            }
            tokio::task::yield_now().await;
            Ok(())
        }

        async fn disconnect(&mut self, _session: ()) -> Result<(), LinkError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_wins_over_simultaneous_ack() {
        let (dispatcher, _events) = CommandDispatcher::spawn(DropWithAck::default(), SessionConfig::default());
        dispatcher.scan_and_connect().await.unwrap();

        let result = dispatcher.force_stop(500, 100).await;
        assert_eq!(
            result,
            Err(CommandError::Link(LinkError::Dropped("link lost at ack".to_string())))
        );
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_out_of_range_error_message() {
        let err = CommandError::from(ProtocolError::OutOfRange {
            field: PacketField::PulseWidth,
            value: 65536,
        });
        assert_eq!(
            err.to_string(),
            "Packet field out of range: Field pulse_width_us value 65536 does not fit in 16 bits"
        );
    }
}
