//! The transport seam used by the broker.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::message::Qos;
use crate::router::MessageHandler;
use crate::state::ConnectionState;

/// Publish/subscribe connection to a message broker.
///
/// Implementations must invoke each subscribed handler once per inbound
/// message whose topic matches the filter, and must re-establish every
/// subscription after a reconnect before reporting [`ConnectionState::Connected`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload.
    ///
    /// Fails with `NotConnected` while the connection is down and with
    /// `Publish` when the message could not be handed to the broker. A
    /// message is never dropped silently.
    ///
    /// `Ok` means the message was accepted for delivery at `qos`, not that
    /// the broker has acknowledged it. Callers that need proof of delivery
    /// wait for a reply from the receiving device.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<()>;

    /// Register `handler` for every message matching `filter`.
    ///
    /// The subscription is remembered and survives reconnects.
    async fn subscribe(
        &self,
        filter: &str,
        qos: Qos,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;

    /// Watch channel carrying the current connection state.
    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Snapshot of the current connection state.
    fn current_state(&self) -> ConnectionState {
        self.state().borrow().clone()
    }

    /// Close the connection and stop background work.
    async fn shutdown(&self) -> Result<()>;
}
