//! Simulated Chronos device
//!
//! [`SimulatedLink`] behaves like a radio with one Chronos peripheral in
//! range. Each write is decoded the way the firmware does it: anything that
//! is not exactly one command packet is logged and ignored, a valid packet
//! becomes the new output. The paired [`SimulatedDevice`] handle inspects
//! what arrived and injects latency, connect failures, write failures and
//! link drops.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use chronos_core::CommandPacket;

use super::gatt::{matches_name, COMMAND_CHAR_UUID};
use super::link::{BleLink, DiscoveredDevice, EstablishedLink, LinkError};

/// Identifier the simulated peripheral advertises under
pub const SIMULATED_DEVICE_ID: &str = "SIM:C4:00:00:00:01";

/// Default advertised name
pub const SIMULATED_DEVICE_NAME: &str = "Chronos-SIM";

/// Connection handle issued by [`SimulatedLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedSession(u64);

#[derive(Debug)]
struct DeviceState {
    name: String,
    advertising: bool,
    scan_stalled: bool,
    disconnect_stalled: bool,
    scan_delay: Duration,
    connect_delay: Duration,
    write_latency: Duration,
    connect_failure: Option<String>,
    write_failure: Option<String>,
    connected: Option<u64>,
    next_session: u64,
    drop_tx: Option<mpsc::Sender<String>>,
    received: Vec<CommandPacket>,
    rejected: usize,
    writes: usize,
    in_flight: usize,
    max_in_flight: usize,
}

impl DeviceState {
    fn new(name: String) -> Self {
        Self {
            name,
            advertising: true,
            scan_stalled: false,
            disconnect_stalled: false,
            scan_delay: Duration::from_millis(300),
            connect_delay: Duration::from_millis(200),
            write_latency: Duration::from_millis(20),
            connect_failure: None,
            write_failure: None,
            connected: None,
            next_session: 0,
            drop_tx: None,
            received: Vec::new(),
            rejected: 0,
            writes: 0,
            in_flight: 0,
            max_in_flight: 0,
        }
    }

    /// Firmware receive path.
    fn process_received_data(&mut self, data: &[u8]) {
        self.writes += 1;

        match CommandPacket::from_bytes(data) {
            Ok(packet) => {
                tracing::debug!(
                    "Chronos firmware: DAC={}, PW={}µs, F={}Hz",
                    packet.dac,
                    packet.pulse_width_us,
                    packet.frequency_hz
                );
                self.received.push(packet);
            }
            Err(e) => {
                tracing::warn!("Chronos firmware ignored write: {e}");
                self.rejected += 1;
            }
        }
    }
}

/// Counts a write as in flight until dropped.
struct InFlight(Arc<Mutex<DeviceState>>);

impl InFlight {
    fn start(state: &Arc<Mutex<DeviceState>>) -> Self {
        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.in_flight += 1;
        guard.max_in_flight = guard.max_in_flight.max(guard.in_flight);
        Self(Arc::clone(state))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        guard.in_flight -= 1;
    }
}

// ============================================================================
// Device Handle
// ============================================================================

/// Test and demo handle onto the simulated peripheral.
#[derive(Clone, Debug)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advertised name.
    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    /// Make the device visible or invisible to scans.
    pub fn set_advertising(&self, advertising: bool) {
        self.lock().advertising = advertising;
    }

    /// Make scans hang without ever returning.
    pub fn stall_scan(&self, stalled: bool) {
        self.lock().scan_stalled = stalled;
    }

    /// Make disconnects drop the radio link but never acknowledge.
    pub fn stall_disconnect(&self, stalled: bool) {
        self.lock().disconnect_stalled = stalled;
    }

    /// Time a scan takes to see the device.
    pub fn set_scan_delay(&self, delay: Duration) {
        self.lock().scan_delay = delay;
    }

    /// Time a connection attempt takes.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// Time between a write and its acknowledgment.
    pub fn set_write_latency(&self, latency: Duration) {
        self.lock().write_latency = latency;
    }

    /// Fail the next connection attempt with `reason`.
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.lock().connect_failure = Some(reason.into());
    }

    /// Fail the next write with `reason`.
    pub fn fail_next_write(&self, reason: impl Into<String>) {
        self.lock().write_failure = Some(reason.into());
    }

    /// Drop the current link as if the device went out of range.
    ///
    /// Returns `false` if nothing was connected.
    pub fn drop_link(&self, reason: impl Into<String>) -> bool {
        let mut state = self.lock();
        if state.connected.take().is_none() {
            return false;
        }
        if let Some(tx) = state.drop_tx.take() {
            let _ = tx.try_send(reason.into());
        }
        true
    }

    /// Check if a host is connected.
    pub fn is_connected(&self) -> bool {
        self.lock().connected.is_some()
    }

    /// Every valid packet applied so far, oldest first.
    pub fn received(&self) -> Vec<CommandPacket> {
        self.lock().received.clone()
    }

    /// Packet currently driving the output, if any.
    pub fn output(&self) -> Option<CommandPacket> {
        self.lock().received.last().copied()
    }

    /// Number of completed writes, valid or not.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Number of writes ignored for having the wrong length.
    pub fn rejected_count(&self) -> usize {
        self.lock().rejected
    }

    /// Most writes ever outstanding at the same time.
    pub fn max_concurrent_writes(&self) -> usize {
        self.lock().max_in_flight
    }
}

// ============================================================================
// Simulated Link
// ============================================================================

/// [`BleLink`] backed by an in-process virtual device.
#[derive(Debug)]
pub struct SimulatedLink {
    device: SimulatedDevice,
}

impl SimulatedLink {
    /// Create a link with one device advertising as `Chronos-SIM`.
    #[must_use]
    pub fn new() -> (Self, SimulatedDevice) {
        Self::with_name(SIMULATED_DEVICE_NAME)
    }

    /// Create a link whose device advertises `name`.
    #[must_use]
    pub fn with_name(name: impl Into<String>) -> (Self, SimulatedDevice) {
        let device = SimulatedDevice {
            state: Arc::new(Mutex::new(DeviceState::new(name.into()))),
        };
        (Self { device: device.clone() }, device)
    }
}

#[async_trait]
impl BleLink for SimulatedLink {
    type Session = SimulatedSession;

    async fn scan(&mut self, name_filter: &str, window: Duration) -> Result<Option<DiscoveredDevice>, LinkError> {
        let (stalled, delay, found) = {
            let state = self.device.lock();
            let found = (state.advertising && matches_name(&state.name, name_filter))
                .then(|| state.name.clone());
            (state.scan_stalled, state.scan_delay, found)
        };

        if stalled {
            std::future::pending::<()>().await;
        }

        let Some(name) = found.filter(|_| delay <= window) else {
            tokio::time::sleep(window).await;
            return Ok(None);
        };

        tokio::time::sleep(delay).await;
        Ok(Some(DiscoveredDevice {
            id: SIMULATED_DEVICE_ID.to_string(),
            name,
            rssi: Some(-42),
        }))
    }

    async fn connect(&mut self, device: &DiscoveredDevice) -> Result<EstablishedLink<Self::Session>, LinkError> {
        let delay = self.device.lock().connect_delay;
        tokio::time::sleep(delay).await;

        let mut state = self.device.lock();
        if let Some(reason) = state.connect_failure.take() {
            return Err(LinkError::ConnectionFailed(reason));
        }
        if device.id != SIMULATED_DEVICE_ID {
            return Err(LinkError::ConnectionFailed(format!("Unknown device: {}", device.id)));
        }
        if state.connected.is_some() {
            return Err(LinkError::ConnectionFailed("Device already connected".to_string()));
        }

        state.next_session += 1;
        let session = state.next_session;
        let (drop_tx, drops) = mpsc::channel(4);
        state.connected = Some(session);
        state.drop_tx = Some(drop_tx);

        Ok(EstablishedLink { session: SimulatedSession(session), drops })
    }

    async fn write(&mut self, session: &Self::Session, characteristic: Uuid, bytes: &[u8]) -> Result<(), LinkError> {
        let latency = {
            let mut state = self.device.lock();
            if state.connected != Some(session.0) {
                return Err(LinkError::Dropped("Not connected".to_string()));
            }
            if characteristic != COMMAND_CHAR_UUID {
                return Err(LinkError::CharacteristicNotFound(characteristic));
            }
            if let Some(reason) = state.write_failure.take() {
                return Err(LinkError::WriteFailed(reason));
            }
            state.write_latency
        };

        let _in_flight = InFlight::start(&self.device.state);
        tokio::time::sleep(latency).await;

        let mut state = self.device.lock();
        if state.connected != Some(session.0) {
            return Err(LinkError::Dropped("Link lost before acknowledgment".to_string()));
        }
        state.process_received_data(bytes);
        Ok(())
    }

    async fn disconnect(&mut self, session: Self::Session) -> Result<(), LinkError> {
        let stalled = {
            let mut state = self.device.lock();
            if state.connected == Some(session.0) {
                state.connected = None;
                state.drop_tx = None;
            }
            state.disconnect_stalled
        };

        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::gatt::{DEVICE_NAME_FILTER, TELEMETRY_CHAR_UUID};
    use chronos_core::DacCode;

    async fn connected() -> (SimulatedLink, SimulatedDevice, EstablishedLink<SimulatedSession>) {
        let (mut link, device) = SimulatedLink::new();
        let found = link
            .scan(DEVICE_NAME_FILTER, Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        let established = link.connect(&found).await.unwrap();
        (link, device, established)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_finds_device() {
        let (mut link, _device) = SimulatedLink::new();
        let found = link.scan("Chronos", Duration::from_secs(10)).await.unwrap();

        let found = found.unwrap();
        assert_eq!(found.name, SIMULATED_DEVICE_NAME);
        assert_eq!(found.id, SIMULATED_DEVICE_ID);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_waits_full_window_when_absent() {
        let (mut link, device) = SimulatedLink::new();
        device.set_advertising(false);

        let started = tokio::time::Instant::now();
        let found = link.scan("Chronos", Duration::from_secs(10)).await.unwrap();

        assert!(found.is_none());
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_name_must_match() {
        let (mut link, _device) = SimulatedLink::with_name("Nordic_UART");
        let found = link.scan("Chronos", Duration::from_secs(2)).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_decodes_like_firmware() {
        let (mut link, device, established) = connected().await;

        let packet = CommandPacket::new(DacCode::from_raw(0x8063), 500, 100);
        link.write(&established.session, COMMAND_CHAR_UUID, &packet.to_bytes())
            .await
            .unwrap();
        link.write(&established.session, COMMAND_CHAR_UUID, &[0x00, 0x80, 0xF4])
            .await
            .unwrap();

        assert_eq!(device.received(), vec![packet]);
        assert_eq!(device.output(), Some(packet));
        assert_eq!(device.write_count(), 2);
        assert_eq!(device.rejected_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_wrong_characteristic() {
        let (mut link, device, established) = connected().await;

        let result = link
            .write(&established.session, TELEMETRY_CHAR_UUID, &CommandPacket::stop(500, 100).to_bytes())
            .await;

        assert_eq!(result, Err(LinkError::CharacteristicNotFound(TELEMETRY_CHAR_UUID)));
        assert_eq!(device.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_notifies_and_fails_writes() {
        let (mut link, device, mut established) = connected().await;

        assert!(device.drop_link("out of range"));
        assert_eq!(established.drops.recv().await.as_deref(), Some("out of range"));
        assert!(!device.is_connected());

        let result = link
            .write(&established.session, COMMAND_CHAR_UUID, &CommandPacket::stop(500, 100).to_bytes())
            .await;
        assert!(matches!(result, Err(LinkError::Dropped(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_connect_failure_is_one_shot() {
        let (mut link, device) = SimulatedLink::new();
        let found = link.scan("Chronos", Duration::from_secs(10)).await.unwrap().unwrap();

        device.fail_next_connect("bonding refused");
        let first = link.connect(&found).await;
        assert_eq!(first.err(), Some(LinkError::ConnectionFailed("bonding refused".to_string())));

        assert!(link.connect(&found).await.is_ok());
        assert!(device.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_clears_session() {
        let (mut link, device, established) = connected().await;
        let session = established.session;

        link.disconnect(session).await.unwrap();
        assert!(!device.is_connected());

        let result = link.write(&session, COMMAND_CHAR_UUID, &[0; 6]).await;
        assert!(matches!(result, Err(LinkError::Dropped(_))));
    }
}
