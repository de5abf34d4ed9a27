//! Error types for the mqtt-transport crate.

use thiserror::Error;

/// Errors that can occur in the transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker could not be reached, rejected the credentials, or the
    /// handshake did not complete in time
    #[error("Connection error: {0}")]
    Connection(String),

    /// A publish could not be handed to the broker
    #[error("Publish to {topic} failed: {reason}")]
    Publish {
        /// Topic the message was destined for
        topic: String,
        /// Underlying failure
        reason: String,
    },

    /// A subscription request could not be sent
    #[error("Subscribe to {filter} failed: {reason}")]
    Subscribe {
        /// Topic filter that was being subscribed
        filter: String,
        /// Underlying failure
        reason: String,
    },

    /// The adapter is not connected; the caller may retry once it is
    #[error("Transport not connected")]
    NotConnected,

    /// The topic filter is not a valid MQTT filter
    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    /// Reconnection gave up after the configured number of attempts
    #[error("Reconnect attempts exhausted after {0} tries")]
    RetriesExhausted(u32),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An error occurred during shutdown
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

impl TransportError {
    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Publish { .. }
                | TransportError::Subscribe { .. }
                | TransportError::NotConnected
        )
    }
}

impl From<rumqttc::ClientError> for TransportError {
    fn from(err: rumqttc::ClientError) -> Self {
        match err {
            rumqttc::ClientError::Request(req) => TransportError::Publish {
                topic: request_topic(&req),
                reason: "request channel closed".to_string(),
            },
            rumqttc::ClientError::TryRequest(req) => TransportError::Publish {
                topic: request_topic(&req),
                reason: "request channel full".to_string(),
            },
        }
    }
}

fn request_topic(req: &rumqttc::Request) -> String {
    match req {
        rumqttc::Request::Publish(publish) => publish.topic.clone(),
        _ => String::new(),
    }
}

/// Convenience type alias for Results using TransportError.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let error = TransportError::Connection("connection refused".to_string());
        assert_eq!(error.to_string(), "Connection error: connection refused");

        let error = TransportError::Publish {
            topic: "device/CAB001/command".to_string(),
            reason: "request channel full".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Publish to device/CAB001/command failed: request channel full"
        );

        let error = TransportError::RetriesExhausted(5);
        assert_eq!(error.to_string(), "Reconnect attempts exhausted after 5 tries");

        assert_eq!(TransportError::NotConnected.to_string(), "Transport not connected");
    }

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::NotConnected.is_transient());
        assert!(TransportError::Publish {
            topic: "t".to_string(),
            reason: "r".to_string()
        }
        .is_transient());
        assert!(!TransportError::Connection("bad credentials".to_string()).is_transient());
        assert!(!TransportError::RetriesExhausted(3).is_transient());
    }
}
