//! # mqtt-transport
//!
//! Publish/subscribe transport for the smart locker broker.
//!
//! This crate knows nothing about lockers. It owns the MQTT connection,
//! routes inbound messages to handlers by topic filter (`+` and `#`
//! wildcards), reconnects with exponential backoff and re-establishes every
//! subscription after a reconnect. Handler errors and panics are contained
//! in the router and never stop the connection loop.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mqtt_transport::{InboundMessage, MqttTransport, Qos, Transport, TransportConfig};
//!
//! # async fn example() -> mqtt_transport::Result<()> {
//! let transport = MqttTransport::connect(TransportConfig::from_env()?).await?;
//! transport
//!     .subscribe(
//!         "device/+/status",
//!         Qos::AtLeastOnce,
//!         Arc::new(|msg: &InboundMessage| -> mqtt_transport::HandlerResult {
//!             println!("{}: {:?}", msg.topic, msg.payload_str());
//!             Ok(())
//!         }),
//!     )
//!     .await?;
//! transport
//!     .publish("device/CAB001/command", br#"{"action":"unlock"}"#.to_vec(), Qos::AtLeastOnce)
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod config;
mod error;
mod message;
mod mqtt;
mod router;
mod state;
mod topic;
mod transport;

#[cfg(any(test, feature = "test-support"))]
mod memory;

pub use backoff::Backoff;
pub use config::{TlsConfig, TransportConfig};
pub use error::{Result, TransportError};
pub use message::{InboundMessage, OutboundMessage, Qos};
pub use mqtt::MqttTransport;
pub use router::{HandlerError, HandlerResult, HandlerRouter, MessageHandler, Route};
pub use state::ConnectionState;
pub use topic::{matches_filter, TopicFilter};
pub use transport::Transport;

#[cfg(any(test, feature = "test-support"))]
pub use memory::InMemoryTransport;
