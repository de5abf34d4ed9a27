//! Configuration types for the locker-broker crate
//!
//! This module defines the configuration that controls command deadlines,
//! liveness detection, event routing and notification delivery.

use std::time::Duration;

use mqtt_transport::TransportConfig;

use crate::error::{BrokerError, Result};

/// Longest accepted command acknowledgment timeout.
pub const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(3600);

/// Configuration for the LockerBroker
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// MQTT connection settings
    pub transport: TransportConfig,

    /// First topic level of every device topic (`{prefix}/{id}/status`)
    /// Default: "device"
    pub topic_prefix: String,

    /// Deadline used by `dispatch_command`
    /// Default: 10 seconds
    pub command_timeout: Duration,

    /// Interval of the shared pending-command timeout sweep
    /// Default: 5 seconds
    pub timeout_sweep_interval: Duration,

    /// A device with no heartbeat for this long is marked offline
    /// Default: 90 seconds
    pub stale_after: Duration,

    /// Interval of the liveness sweep
    /// Default: 15 seconds
    pub liveness_check_interval: Duration,

    /// Notifications buffered per alert stream before the oldest is dropped
    /// Default: 32
    pub subscriber_queue_capacity: usize,

    /// Number of event router workers; events for one device always share a worker
    /// Default: 8
    pub router_partitions: usize,

    /// Attempts made to publish a command before giving up
    /// Default: 3
    pub publish_retry_attempts: u32,

    /// Delay before the first publish retry, doubling after each failure
    /// Default: 200 milliseconds
    pub publish_retry_backoff: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            topic_prefix: "device".to_string(),
            command_timeout: Duration::from_secs(10),
            timeout_sweep_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(90),
            liveness_check_interval: Duration::from_secs(15),
            subscriber_queue_capacity: 32,
            router_partitions: 8,
            publish_retry_attempts: 3,
            publish_retry_backoff: Duration::from_millis(200),
        }
    }
}

impl BrokerConfig {
    /// Create a new BrokerConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a BrokerConfig with short deadlines, for kiosks and tests
    pub fn fast_timeouts() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            timeout_sweep_interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(30),
            liveness_check_interval: Duration::from_secs(5),
            publish_retry_backoff: Duration::from_millis(50),
            ..Default::default()
        }
    }

    /// Create a BrokerConfig optimized for resource efficiency
    pub fn resource_efficient() -> Self {
        Self {
            timeout_sweep_interval: Duration::from_secs(10),
            liveness_check_interval: Duration::from_secs(30),
            subscriber_queue_capacity: 8,
            router_partitions: 2,
            ..Default::default()
        }
    }

    /// Build a config from the environment.
    ///
    /// MQTT settings come from [`TransportConfig::from_env`]; broker settings from
    /// `LOCKER_COMMAND_TIMEOUT_SECS`, `LOCKER_STALE_AFTER_SECS` and `LOCKER_TOPIC_PREFIX`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            transport: TransportConfig::from_env()?,
            ..Default::default()
        };

        if let Some(secs) = env_secs("LOCKER_COMMAND_TIMEOUT_SECS")? {
            config.command_timeout = secs;
        }

        if let Some(secs) = env_secs("LOCKER_STALE_AFTER_SECS")? {
            config.stale_after = secs;
        }

        if let Ok(prefix) = std::env::var("LOCKER_TOPIC_PREFIX") {
            config.topic_prefix = prefix;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;

        if self.topic_prefix.is_empty()
            || self.topic_prefix.contains(['+', '#'])
            || self.topic_prefix.starts_with('/')
            || self.topic_prefix.ends_with('/')
        {
            return Err(BrokerError::Configuration(format!(
                "Invalid topic prefix: {:?}",
                self.topic_prefix
            )));
        }

        if self.command_timeout.is_zero() || self.command_timeout > MAX_COMMAND_TIMEOUT {
            return Err(BrokerError::Configuration(format!(
                "Command timeout must be between 0 and {:?}",
                MAX_COMMAND_TIMEOUT
            )));
        }

        if self.timeout_sweep_interval.is_zero() || self.liveness_check_interval.is_zero() {
            return Err(BrokerError::Configuration(
                "Sweep intervals must be greater than 0".to_string(),
            ));
        }

        if self.liveness_check_interval > self.stale_after {
            return Err(BrokerError::Configuration(
                "Liveness check interval must not exceed the stale threshold".to_string(),
            ));
        }

        if self.subscriber_queue_capacity == 0 {
            return Err(BrokerError::Configuration(
                "Subscriber queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.router_partitions == 0 {
            return Err(BrokerError::Configuration(
                "Router partitions must be greater than 0".to_string(),
            ));
        }

        if self.publish_retry_attempts == 0 {
            return Err(BrokerError::Configuration(
                "Publish retry attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_timeout_sweep_interval(mut self, interval: Duration) -> Self {
        self.timeout_sweep_interval = interval;
        self
    }

    pub fn with_liveness(mut self, stale_after: Duration, check_interval: Duration) -> Self {
        self.stale_after = stale_after;
        self.liveness_check_interval = check_interval;
        self
    }

    pub fn with_subscriber_queue_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_queue_capacity = capacity;
        self
    }

    pub fn with_router_partitions(mut self, partitions: usize) -> Self {
        self.router_partitions = partitions;
        self
    }

    pub fn with_publish_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.publish_retry_attempts = attempts;
        self.publish_retry_backoff = backoff;
        self
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| BrokerError::Configuration(format!("Invalid {name}: {value}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.topic_prefix, "device");
        assert_eq!(config.timeout_sweep_interval, Duration::from_secs(5));
        assert_eq!(config.stale_after, Duration::from_secs(90));
        assert_eq!(config.router_partitions, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let invalid = BrokerConfig::default().with_topic_prefix("device/#");
        assert!(invalid.validate().is_err());

        let invalid = BrokerConfig::default()
            .with_liveness(Duration::from_secs(10), Duration::from_secs(60));
        assert!(invalid.validate().is_err());

        let invalid = BrokerConfig::default().with_subscriber_queue_capacity(0);
        assert!(invalid.validate().is_err());

        let invalid = BrokerConfig::default().with_publish_retry(0, Duration::from_millis(10));
        assert!(invalid.validate().is_err());

        let invalid = BrokerConfig::default().with_command_timeout(Duration::from_secs(u64::MAX));
        assert!(invalid.validate().is_err());

        let longest = BrokerConfig::default().with_command_timeout(MAX_COMMAND_TIMEOUT);
        assert!(longest.validate().is_ok());
    }

    #[test]
    fn test_config_presets() {
        let fast = BrokerConfig::fast_timeouts();
        assert_eq!(fast.command_timeout, Duration::from_secs(5));
        assert!(fast.validate().is_ok());

        let efficient = BrokerConfig::resource_efficient();
        assert_eq!(efficient.router_partitions, 2);
        assert!(efficient.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = BrokerConfig::new()
            .with_topic_prefix("cabinet")
            .with_command_timeout(Duration::from_secs(3))
            .with_router_partitions(4)
            .with_subscriber_queue_capacity(4);

        assert_eq!(config.topic_prefix, "cabinet");
        assert_eq!(config.command_timeout, Duration::from_secs(3));
        assert_eq!(config.router_partitions, 4);
        assert!(config.validate().is_ok());
    }
}
