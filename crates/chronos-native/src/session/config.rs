//! Session configuration.

use std::time::Duration;

use crate::bridge::gatt::DEVICE_NAME_FILTER;

/// Timeouts and discovery settings for a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Substring the advertised name must contain
    pub name_filter: String,

    /// How long to scan before giving up
    pub scan_window: Duration,

    /// Extra time granted to the scan primitive past `scan_window`
    pub scan_grace: Duration,

    /// Bounded wait for scan and connect together
    pub connect_timeout: Duration,

    /// Bounded wait for sending one command
    pub command_timeout: Duration,

    /// Bounded wait for a disconnect
    pub disconnect_timeout: Duration,

    /// Pending requests the link worker queues before callers wait
    pub request_queue_depth: usize,

    /// Status events buffered for the consumer
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name_filter: DEVICE_NAME_FILTER.to_string(),
            scan_window: Duration::from_secs(10),
            scan_grace: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(5),
            request_queue_depth: 32,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Longest the worker lets a scan run.
    #[must_use]
    pub fn scan_deadline(&self) -> Duration {
        self.scan_window + self.scan_grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let config = SessionConfig::default();
        assert_eq!(config.name_filter, "Chronos");
        assert_eq!(config.scan_window, Duration::from_secs(10));
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.command_timeout, Duration::from_secs(5));
        assert_eq!(config.scan_deadline(), Duration::from_secs(11));
    }

    #[test]
    fn test_config_override() {
        let config = SessionConfig {
            command_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(config.command_timeout, Duration::from_millis(500));
        assert_eq!(config.disconnect_timeout, Duration::from_secs(5));
    }
}
