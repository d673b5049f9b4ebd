//! Link worker
//!
//! One task owns the [`BleLink`] and the [`ConnectionManager`]. Requests
//! arrive through a FIFO and run to completion one at a time, so writes to
//! the characteristic never interleave. Each request carries its own reply
//! slot. A scan, connect or write whose caller stopped waiting before it
//! reached the front of the queue is skipped; one already running finishes
//! and its result is dropped here. Disconnects always run.

use std::fmt;

use tokio::sync::{mpsc, oneshot, watch};

use chronos_core::CommandPacket;

use crate::bridge::{BleLink, DiscoveredDevice, LinkError, COMMAND_CHAR_UUID};

use super::config::SessionConfig;
use super::connection::{ActiveSession, ConnectionManager, ConnectionSnapshot, SessionId};
use super::dispatcher::{CommandError, CommandResult};
use super::events::{CommandKind, EventSink, StatusKind};

/// Work item for the link worker.
pub(crate) enum LinkRequest {
    Scan {
        reply: oneshot::Sender<CommandResult<Option<DiscoveredDevice>>>,
    },
    Connect {
        reply: oneshot::Sender<CommandResult<SessionId>>,
    },
    Write {
        session: SessionId,
        command: CommandKind,
        packet: CommandPacket,
        reply: oneshot::Sender<CommandResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<CommandResult<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Wakeup {
    Request(Option<LinkRequest>),
    Dropped(String),
}

enum WriteOutcome {
    Done(Result<(), LinkError>),
    Dropped(String),
}

async fn next_drop<S>(active: Option<&mut ActiveSession<S>>) -> String {
    match active {
        Some(active) => active
            .drops
            .recv()
            .await
            .unwrap_or_else(|| "Link closed".to_string()),
        None => std::future::pending().await,
    }
}

fn deliver<T: fmt::Debug>(reply: oneshot::Sender<CommandResult<T>>, command: CommandKind, result: CommandResult<T>) {
    if let Err(unclaimed) = reply.send(result) {
        tracing::debug!("{command}: caller stopped waiting, discarding {unclaimed:?}");
    }
}

/// A request whose caller already gave up is never started.
fn abandoned<T>(reply: &oneshot::Sender<CommandResult<T>>, command: CommandKind) -> bool {
    let closed = reply.is_closed();
    if closed {
        tracing::debug!("{command}: caller stopped waiting before start, skipping");
    }
    closed
}

pub(crate) struct LinkWorker<L: BleLink> {
    link: L,
    config: SessionConfig,
    manager: ConnectionManager<L::Session>,
    requests: mpsc::Receiver<LinkRequest>,
    events: EventSink,
}

impl<L: BleLink> LinkWorker<L> {
    pub(crate) fn new(
        link: L,
        config: SessionConfig,
        events: EventSink,
        requests: mpsc::Receiver<LinkRequest>,
    ) -> (Self, watch::Receiver<ConnectionSnapshot>) {
        let (manager, snapshots) = ConnectionManager::new(events.clone());
        let worker = Self { link, config, manager, requests, events };
        (worker, snapshots)
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!("Link worker started");

        loop {
            let wakeup = tokio::select! {
                request = self.requests.recv() => Wakeup::Request(request),
                reason = next_drop(self.manager.active_mut()) => Wakeup::Dropped(reason),
            };

            match wakeup {
                Wakeup::Request(Some(LinkRequest::Shutdown { reply })) => {
                    self.release().await;
                    let _ = reply.send(());
                    break;
                }
                Wakeup::Request(Some(request)) => self.handle(request).await,
                Wakeup::Request(None) => {
                    self.release().await;
                    break;
                }
                Wakeup::Dropped(reason) => self.on_link_dropped(reason).await,
            }
        }

        tracing::debug!("Link worker stopped");
    }

    async fn handle(&mut self, request: LinkRequest) {
        match request {
            LinkRequest::Scan { reply } => {
                if abandoned(&reply, CommandKind::Scan) {
                    return;
                }
                let result = self.scan_only().await;
                deliver(reply, CommandKind::Scan, result);
            }
            LinkRequest::Connect { reply } => {
                if abandoned(&reply, CommandKind::Connect) {
                    return;
                }
                let result = self.connect().await;
                deliver(reply, CommandKind::Connect, result);
            }
            LinkRequest::Write { session, command, packet, reply } => {
                if abandoned(&reply, command) {
                    return;
                }
                let result = self.write(session, packet).await;
                deliver(reply, command, result);
            }
            LinkRequest::Disconnect { reply } => {
                let result = self.disconnect().await;
                deliver(reply, CommandKind::Disconnect, result);
            }
            LinkRequest::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn run_scan(&mut self) -> CommandResult<Option<DiscoveredDevice>> {
        let deadline = self.config.scan_deadline();
        let scan = self.link.scan(&self.config.name_filter, self.config.scan_window);

        match tokio::time::timeout(deadline, scan).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CommandError::ScanTimeout(deadline)),
        }
    }

    async fn scan_only(&mut self) -> CommandResult<Option<DiscoveredDevice>> {
        self.manager.begin_scan().map_err(CommandError::AlreadyActive)?;
        let result = self.run_scan().await;
        self.manager.attempt_ended();

        if let Ok(Some(device)) = &result {
            self.events.emit(StatusKind::DeviceFound {
                name: device.name.clone(),
                id: device.id.clone(),
            });
        }
        result
    }

    async fn connect(&mut self) -> CommandResult<SessionId> {
        self.manager.begin_scan().map_err(CommandError::AlreadyActive)?;
        self.events.emit(StatusKind::Info(format!(
            "Scanning for {} device...",
            self.config.name_filter
        )));

        let result = self.scan_and_connect().await;
        if result.is_err() {
            self.manager.attempt_ended();
        }
        result
    }

    async fn scan_and_connect(&mut self) -> CommandResult<SessionId> {
        let device = self.run_scan().await?.ok_or(CommandError::DeviceNotFound)?;
        self.manager.device_found(&device);

        let timeout = self.config.connect_timeout;
        let link = tokio::time::timeout(timeout, self.link.connect(&device))
            .await
            .map_err(|_| CommandError::Timeout { operation: CommandKind::Connect, after: timeout })??;

        Ok(self.manager.established(device, link))
    }

    async fn write(&mut self, session: SessionId, packet: CommandPacket) -> CommandResult<()> {
        if !self.manager.is_current(session) {
            tracing::debug!("Rejecting write for stale {session}");
            return Err(CommandError::NotConnected);
        }
        let Some(active) = self.manager.active_mut() else {
            return Err(CommandError::NotConnected);
        };

        let bytes = packet.to_bytes();
        let outcome = tokio::select! {
            biased;
            reason = active.drops.recv() => {
                WriteOutcome::Dropped(reason.unwrap_or_else(|| "Link closed".to_string()))
            }
            result = self.link.write(&active.session, COMMAND_CHAR_UUID, &bytes) => WriteOutcome::Done(result),
        };

        match outcome {
            WriteOutcome::Done(result) => Ok(result?),
            WriteOutcome::Dropped(reason) => {
                self.on_link_dropped(reason.clone()).await;
                Err(CommandError::Link(LinkError::Dropped(reason)))
            }
        }
    }

    async fn disconnect(&mut self) -> CommandResult<()> {
        let Some(active) = self.manager.begin_disconnect() else {
            return Err(CommandError::NotConnected);
        };

        let limit = self.config.disconnect_timeout;
        let result = tokio::time::timeout(limit, self.link.disconnect(active.session)).await;
        self.manager.closed();

        match result {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!("Disconnect did not complete within {limit:?}, slot released");
                Err(CommandError::Timeout { operation: CommandKind::Disconnect, after: limit })
            }
        }
    }

    async fn on_link_dropped(&mut self, reason: String) {
        let Some(dropped) = self.manager.link_dropped(reason) else {
            return;
        };
        self.close_quietly(dropped.session, "dropped link").await;
    }

    /// Close whatever is still open before the worker exits.
    async fn release(&mut self) {
        if let Some(active) = self.manager.begin_disconnect() {
            self.close_quietly(active.session, "session at shutdown").await;
            self.manager.closed();
        }
    }

    async fn close_quietly(&mut self, session: L::Session, what: &str) {
        let limit = self.config.disconnect_timeout;
        match tokio::time::timeout(limit, self.link.disconnect(session)).await {
            Ok(Ok(())) => tracing::debug!("Released {what}"),
            Ok(Err(e)) => tracing::debug!("Releasing {what} failed: {e}"),
            Err(_) => tracing::warn!("Releasing {what} timed out after {limit:?}"),
        }
    }
}
