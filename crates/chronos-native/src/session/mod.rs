//! Session layer for one Chronos device
//!
//! - [`connection`]: Connection state machine and session epochs
//! - [`dispatcher`]: Caller-side command API with bounded waits
//! - [`worker`]: The single task that owns the BLE link
//! - [`operator`]: Enable switch and operator shortcuts
//! - [`events`]: Timestamped status events
//! - [`config`]: Timeouts and discovery settings
//!
//! # Example
//!
//! ```rust,ignore
//! use chronos_core::StimulationParameters;
//! use chronos_native::{CommandDispatcher, SessionConfig, SimulatedLink};
//!
//! let (link, _device) = SimulatedLink::new();
//! let (dispatcher, mut events) = CommandDispatcher::spawn(link, SessionConfig::default());
//!
//! dispatcher.scan_and_connect().await?;
//! dispatcher.send_parameters(StimulationParameters::default(), true).await?;
//!
//! while let Ok(event) = events.try_recv() {
//!     println!("{event}");
//! }
//! dispatcher.shutdown(500, 100).await;
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod events;
pub mod operator;
pub mod worker;

// Re-export key types
pub use config::SessionConfig;
pub use connection::{ConnectionManager, ConnectionSnapshot, ConnectionState, SessionId};
pub use dispatcher::{CommandDispatcher, CommandError, CommandResult};
pub use events::{CommandKind, EventSink, StatusEvent, StatusKind};
pub use operator::{OperatorPanel, ParameterForm};
