//! BLE transport for the Chronos device
//!
//! Talks to the first Bluetooth adapter on the host through btleplug. The
//! device is found by advertised name, the RX characteristic of the Nordic
//! UART Service is resolved after service discovery, and adapter
//! `DeviceDisconnected` events are forwarded as link drops.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use uuid::Uuid;

use super::gatt::{matches_name, COMMAND_CHAR_UUID};
use super::link::{BleLink, DiscoveredDevice, EstablishedLink, LinkError};

/// Interval between peripheral list polls while scanning
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn transport(e: btleplug::Error) -> LinkError {
    LinkError::Transport(e.to_string())
}

/// Await `poll`, then `stop` whatever the outcome of `poll`.
async fn stop_after<T>(
    poll: impl Future<Output = Result<T, LinkError>>,
    stop: impl Future<Output = Result<(), LinkError>>,
) -> Result<T, LinkError> {
    let result = poll.await;
    if let Err(e) = stop.await {
        tracing::debug!("stop_scan failed: {e}");
    }
    result
}

/// Active btleplug connection
pub struct BtleplugSession {
    peripheral: Peripheral,
    command_char: Characteristic,
    watcher: JoinHandle<()>,
}

/// [`BleLink`] over the host Bluetooth stack.
pub struct BtleplugLink {
    adapter: Adapter,
}

impl BtleplugLink {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NoAdapter`] if the host has none.
    pub async fn new() -> Result<Self, LinkError> {
        let manager = Manager::new().await.map_err(transport)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(transport)?
            .into_iter()
            .next()
            .ok_or(LinkError::NoAdapter)?;

        Ok(Self { adapter })
    }

    async fn find_named(&self, name_filter: &str) -> Result<Option<(Peripheral, String, Option<i16>)>, LinkError> {
        for peripheral in self.adapter.peripherals().await.map_err(transport)? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            if let Some(name) = props.local_name {
                if matches_name(&name, name_filter) {
                    return Ok(Some((peripheral, name, props.rssi)));
                }
            }
        }
        Ok(None)
    }

    async fn poll_until_found(
        &self,
        name_filter: &str,
        window: Duration,
    ) -> Result<Option<(Peripheral, String, Option<i16>)>, LinkError> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            if let Some(found) = self.find_named(name_filter).await? {
                return Ok(Some(found));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        }
    }

    async fn peripheral_by_id(&self, id: &str) -> Result<Peripheral, LinkError> {
        self.adapter
            .peripherals()
            .await
            .map_err(transport)?
            .into_iter()
            .find(|p| p.id().to_string() == id)
            .ok_or_else(|| LinkError::ConnectionFailed(format!("Device not found: {id}")))
    }

    /// Forward adapter disconnect events for `peripheral` into `drops`.
    async fn spawn_disconnect_watcher(
        &self,
        peripheral: &Peripheral,
        drops: mpsc::Sender<String>,
    ) -> Result<JoinHandle<()>, LinkError> {
        let mut events = self.adapter.events().await.map_err(transport)?;
        let peripheral_id = peripheral.id();

        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        tracing::info!("Disconnect watcher: device {id:?} disconnected");
                        let _ = drops.send("Device disconnected".to_string()).await;
                        return;
                    }
                }
            }
            let _ = drops.send("Adapter event stream ended".to_string()).await;
        }))
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    type Session = BtleplugSession;

    async fn scan(&mut self, name_filter: &str, window: Duration) -> Result<Option<DiscoveredDevice>, LinkError> {
        tracing::info!("Starting BLE scan for '{name_filter}' ({} s)", window.as_secs());
        self.adapter.start_scan(ScanFilter::default()).await.map_err(transport)?;

        let stop = async { self.adapter.stop_scan().await.map_err(transport) };
        let found = stop_after(self.poll_until_found(name_filter, window), stop).await?;

        Ok(found.map(|(peripheral, name, rssi)| {
            let id = peripheral.id().to_string();
            tracing::info!("Found {name} id={id}");
            DiscoveredDevice { id, name, rssi }
        }))
    }

    async fn connect(&mut self, device: &DiscoveredDevice) -> Result<EstablishedLink<Self::Session>, LinkError> {
        tracing::info!("Connecting to BLE device: {}", device.id);
        let peripheral = self.peripheral_by_id(&device.id).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| LinkError::ConnectionFailed(e.to_string()))?;
        peripheral.discover_services().await.map_err(transport)?;

        let Some(command_char) = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == COMMAND_CHAR_UUID)
        else {
            let _ = peripheral.disconnect().await;
            return Err(LinkError::CharacteristicNotFound(COMMAND_CHAR_UUID));
        };

        let (drop_tx, drops) = mpsc::channel(4);
        let watcher = match self.spawn_disconnect_watcher(&peripheral, drop_tx).await {
            Ok(watcher) => watcher,
            Err(e) => {
                let _ = peripheral.disconnect().await;
                return Err(e);
            }
        };

        tracing::info!("Connected to {}", device.name);
        Ok(EstablishedLink {
            session: BtleplugSession { peripheral, command_char, watcher },
            drops,
        })
    }

    async fn write(&mut self, session: &Self::Session, characteristic: Uuid, bytes: &[u8]) -> Result<(), LinkError> {
        let target = if characteristic == session.command_char.uuid {
            session.command_char.clone()
        } else {
            session
                .peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == characteristic)
                .ok_or(LinkError::CharacteristicNotFound(characteristic))?
        };

        session
            .peripheral
            .write(&target, bytes, WriteType::WithResponse)
            .await
            .map_err(|e| LinkError::WriteFailed(e.to_string()))
    }

    async fn disconnect(&mut self, session: Self::Session) -> Result<(), LinkError> {
        session.watcher.abort();
        session.peripheral.disconnect().await.map_err(transport)?;
        tracing::info!("Disconnected from {}", session.peripheral.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_scan_stopped_after_failed_poll() {
        let stopped = Cell::new(false);
        let result: Result<Option<u8>, LinkError> = stop_after(
            async { Err(LinkError::Transport("adapter removed".to_string())) },
            async {
                stopped.set(true);
                Ok(())
            },
        )
        .await;

        assert_eq!(result, Err(LinkError::Transport("adapter removed".to_string())));
        assert!(stopped.get());
    }

    #[tokio::test]
    async fn test_stop_failure_keeps_scan_result() {
        let result = stop_after(
            async { Ok(Some(7_u8)) },
            async { Err(LinkError::Transport("not scanning".to_string())) },
        )
        .await;
        assert_eq!(result, Ok(Some(7)));
    }
}
