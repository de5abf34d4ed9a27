//! Connection state reported by the transport.
//!
//! State transitions are published on a `tokio::sync::watch` channel so health
//! reporting can observe them without polling:
//!
//! ```text
//! Connecting -> Connected -> Disconnected -> Reconnecting -> Connecting -> ...
//! ```

use std::fmt;
use std::time::Duration;

/// Current state of the broker connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Handshake in progress
    Connecting,
    /// Connected and every registered subscription re-established
    Connected,
    /// Connection lost or closed; the reason is kept for diagnostics
    Disconnected(String),
    /// Waiting before the next reconnect attempt
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
}

impl ConnectionState {
    /// Short static name for logs and health output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected(_) => "disconnected",
            ConnectionState::Reconnecting { .. } => "reconnecting",
        }
    }

    /// Whether publishes can currently be accepted.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({reason})"),
            ConnectionState::Reconnecting { attempt, delay } => write!(
                f,
                "reconnecting (attempt {attempt} in {:.1}s)",
                delay.as_secs_f64()
            ),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Disconnected("broker closed".into()).to_string(),
            "disconnected (broker closed)"
        );
        assert_eq!(
            ConnectionState::Reconnecting {
                attempt: 2,
                delay: Duration::from_secs(2)
            }
            .to_string(),
            "reconnecting (attempt 2 in 2.0s)"
        );
    }

    #[test]
    fn test_is_connected() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Disconnected(String::new()).is_connected());
    }
}
