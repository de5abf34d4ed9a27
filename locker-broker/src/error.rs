//! Error types for the locker-broker crate.

use mqtt_transport::TransportError;

use crate::types::{ConsumerId, CorrelationId, DeviceId};

/// Errors that can occur in the locker broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The transport failed to connect or to publish
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The device is offline, or has never been seen, so the command was not sent
    #[error("Device {device_id} is offline{}", never_seen_suffix(.registered))]
    DeviceOffline {
        /// The target device
        device_id: DeviceId,
        /// Whether the device is known to the registry at all
        registered: bool,
    },

    /// No state has been recorded for this device
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// Another command for this device is still awaiting acknowledgment
    #[error("Command {in_flight} already in flight for device {device_id}")]
    CommandInFlight {
        /// The target device
        device_id: DeviceId,
        /// Correlation id of the outstanding command
        in_flight: CorrelationId,
    },

    /// No acknowledgment arrived before the deadline; device state is unchanged
    #[error("Command {correlation_id} to device {device_id} timed out")]
    CommandTimeout {
        device_id: DeviceId,
        correlation_id: CorrelationId,
    },

    /// The device acknowledged the command with a contradicting result
    #[error("Command {correlation_id} to device {device_id} failed: {reason}")]
    CommandFailed {
        device_id: DeviceId,
        correlation_id: CorrelationId,
        reason: String,
    },

    /// The command was cancelled before it resolved
    #[error("Command {0} was cancelled")]
    CommandCancelled(CorrelationId),

    /// An inbound payload could not be decoded
    #[error("Malformed event on {topic}: {reason}")]
    MalformedEvent {
        /// Topic the payload arrived on
        topic: String,
        /// Why decoding failed
        reason: String,
    },

    /// A slow consumer's queue overflowed and the oldest notifications were dropped
    #[error("Dropped {dropped} notification(s) for consumer {consumer_id}")]
    DroppedNotification {
        consumer_id: ConsumerId,
        dropped: u64,
    },

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An error occurred during shutdown
    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

impl BrokerError {
    /// Whether the request was rejected before anything was sent to the device.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BrokerError::DeviceOffline { .. }
                | BrokerError::DeviceNotFound(_)
                | BrokerError::CommandInFlight { .. }
        )
    }

    /// Whether repeating the request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::Transport(e) => e.is_transient(),
            BrokerError::CommandInFlight { .. } | BrokerError::CommandTimeout { .. } => true,
            _ => false,
        }
    }
}

fn never_seen_suffix(registered: &bool) -> &'static str {
    if *registered {
        ""
    } else {
        " (never seen)"
    }
}

/// Convenience type alias for Results using BrokerError.
pub type Result<T> = std::result::Result<T, BrokerError>;
