//! In-process transport for tests.
//!
//! `InMemoryTransport` routes injected messages through the same
//! [`HandlerRouter`] as the real transport, records every publish, and can
//! simulate disconnection and publish failures.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use crate::error::{Result, TransportError};
use crate::message::{InboundMessage, OutboundMessage, Qos};
use crate::router::{HandlerRouter, MessageHandler};
use crate::state::ConnectionState;
use crate::topic::TopicFilter;
use crate::transport::Transport;

/// A [`Transport`] with no network underneath.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

struct Inner {
    router: HandlerRouter,
    published: Mutex<Vec<OutboundMessage>>,
    publish_notify: Notify,
    failing_publishes: AtomicU32,
    state_tx: watch::Sender<ConnectionState>,
}

impl InMemoryTransport {
    /// Create a transport that starts out connected.
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        Self {
            inner: Arc::new(Inner {
                router: HandlerRouter::new(),
                published: Mutex::new(Vec::new()),
                publish_notify: Notify::new(),
                failing_publishes: AtomicU32::new(0),
                state_tx,
            }),
        }
    }

    /// Deliver a message as if it arrived from the broker.
    ///
    /// Returns the number of handlers that accepted it.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        self.inner.router.route(&InboundMessage::new(topic, payload))
    }

    /// Everything published so far.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.inner.published.lock().clone()
    }

    /// Messages published to `topic`.
    pub fn published_to(&self, topic: &str) -> Vec<OutboundMessage> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Wait until at least `count` messages have been published.
    pub async fn wait_for_publishes(&self, count: usize) -> Vec<OutboundMessage> {
        loop {
            let notified = self.inner.publish_notify.notified();
            {
                let published = self.inner.published.lock();
                if published.len() >= count {
                    return published.clone();
                }
            }
            notified.await;
        }
    }

    /// Forget recorded publishes.
    pub fn clear_published(&self) {
        self.inner.published.lock().clear();
    }

    /// Simulate the connection going up or down.
    pub fn set_connected(&self, connected: bool) {
        let state = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected("simulated disconnect".to_string())
        };
        self.inner.state_tx.send_replace(state);
    }

    /// Make the next `count` publishes fail with a `Publish` error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Topic filters currently subscribed.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner
            .router
            .filters()
            .into_iter()
            .map(|(filter, _)| filter.to_string())
            .collect()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<()> {
        if !self.inner.state_tx.borrow().is_connected() {
            return Err(TransportError::NotConnected);
        }

        let failed = self
            .inner
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "simulated failure".to_string(),
            });
        }

        self.inner.published.lock().push(OutboundMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        self.inner.publish_notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: Qos,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let filter = TopicFilter::new(filter)?;
        self.inner.router.register(filter, qos, handler);
        Ok(())
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    async fn shutdown(&self) -> Result<()> {
        self.set_connected(false);
        Ok(())
    }
}
