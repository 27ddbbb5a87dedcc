//! Configuration for sessions, adapters, and the local engine.
//!
//! All structs have working defaults; builder methods override single
//! fields. [`SessionConfig::validate`] rejects values that would make an
//! adapter block the engine thread.

use crate::error::{Error, Result};
use std::time::Duration;

/// Largest pull timeout accepted. Longer waits would stall the streaming thread.
pub const MAX_PULL_TIMEOUT: Duration = Duration::from_secs(1);

/// Packet source adapter configuration.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// How long a pull waits on the transport before returning zero bytes.
    pub pull_timeout: Duration,
    /// Divert RTCP arriving on the media transport to the RTCP tap.
    pub demux_rtcp: bool,
    /// RTCP packets the tap holds before further ones are dropped.
    pub rtcp_tap_capacity: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            pull_timeout: Duration::from_millis(20),
            demux_rtcp: false,
            rtcp_tap_capacity: 64,
        }
    }
}

impl SourceConfig {
    /// Set the pull timeout.
    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    /// Enable RTP/RTCP demultiplexing.
    pub fn with_rtcp_demux(mut self, enabled: bool) -> Self {
        self.demux_rtcp = enabled;
        self
    }

    /// Set the RTCP tap capacity.
    pub fn with_rtcp_tap_capacity(mut self, capacity: usize) -> Self {
        self.rtcp_tap_capacity = capacity;
        self
    }
}

/// Feedback sink configuration.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Redelivery attempts for the unaccepted tail of a packet.
    pub max_retries: u32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl SinkConfig {
    /// Set the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Lifecycle monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sleep between bus polls in async helpers.
    pub poll_interval: Duration,
    /// How long teardown waits for the graph to reach NULL.
    pub teardown_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            teardown_timeout: Duration::from_secs(5),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session name used in logs and metrics.
    pub name: String,
    /// Packet source adapter settings.
    pub source: SourceConfig,
    /// Feedback sink settings.
    pub sink: SinkConfig,
    /// Lifecycle monitor settings.
    pub monitor: MonitorConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "session".to_string(),
            source: SourceConfig::default(),
            sink: SinkConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Create a config with the given session name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set source adapter settings.
    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.source = source;
        self
    }

    /// Set feedback sink settings.
    pub fn with_sink(mut self, sink: SinkConfig) -> Self {
        self.sink = sink;
        self
    }

    /// Set monitor settings.
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Check for values that would block the engine.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("session name is empty".into()));
        }
        if self.source.pull_timeout > MAX_PULL_TIMEOUT {
            return Err(Error::Config(format!(
                "pull timeout {:?} exceeds {:?}",
                self.source.pull_timeout, MAX_PULL_TIMEOUT
            )));
        }
        if self.source.demux_rtcp && self.source.rtcp_tap_capacity == 0 {
            return Err(Error::Config("RTCP tap capacity is zero".into()));
        }
        if self.monitor.poll_interval.is_zero() {
            return Err(Error::Config("monitor poll interval is zero".into()));
        }
        Ok(())
    }
}

/// Local engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Buffer size lent to pull callbacks.
    pub max_packet_size: usize,
    /// Sleep when a pass over all chains moved no data.
    pub idle_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 1500,
            idle_backoff: Duration::from_millis(1),
        }
    }
}

impl EngineConfig {
    /// Set the pull buffer size.
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set the idle backoff.
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(SessionConfig::default().validate().is_ok());
        assert_eq!(SessionConfig::new("call-1").name, "call-1");
    }

    #[test]
    fn test_rejects_blocking_timeouts() {
        let config = SessionConfig::default()
            .with_source(SourceConfig::default().with_pull_timeout(Duration::from_secs(5)));
        assert!(config.validate().is_err());
        assert!(SessionConfig::new("").validate().is_err());
    }

    #[test]
    fn test_rejects_empty_rtcp_tap() {
        let source = SourceConfig::default()
            .with_rtcp_demux(true)
            .with_rtcp_tap_capacity(0);
        assert!(SessionConfig::default().with_source(source).validate().is_err());
        let source = SourceConfig::default().with_rtcp_tap_capacity(0);
        assert!(SessionConfig::default().with_source(source).validate().is_ok());
    }
}
