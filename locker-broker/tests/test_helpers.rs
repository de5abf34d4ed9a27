//! Shared fixtures for broker integration tests.
//!
//! Brokers run on an [`InMemoryTransport`]; tests inject device messages and
//! inspect what the broker published. Most tests run with paused time, so
//! [`settle`] lets router workers drain without real waiting.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use locker_broker::{
    AlertStream, BrokerConfig, CommandMessage, DeviceEvent, EventKind, LockerBroker,
    LockerBrokerBuilder, OwnershipLookup,
};
use mqtt_transport::InMemoryTransport;

pub struct Harness {
    pub broker: LockerBroker,
    pub transport: InMemoryTransport,
}

impl Harness {
    pub async fn start() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: BrokerConfig) -> Self {
        Self::build(config, None).await
    }

    pub async fn with_ownership(config: BrokerConfig, ownership: Arc<dyn OwnershipLookup>) -> Self {
        Self::build(config, Some(ownership)).await
    }

    async fn build(config: BrokerConfig, ownership: Option<Arc<dyn OwnershipLookup>>) -> Self {
        let transport = InMemoryTransport::new();
        let mut builder = LockerBrokerBuilder::new()
            .with_config(config)
            .with_transport(Arc::new(transport.clone()));
        if let Some(ownership) = ownership {
            builder = builder.with_ownership(ownership);
        }

        let broker = builder.build().await.expect("broker should build");
        Self { broker, transport }
    }

    pub fn status(&self, device: &str, lock: &str, online: &str) {
        self.inject(
            &format!("device/{device}/status"),
            format!(r#"{{"deviceId":"{device}","lockState":"{lock}","onlineState":"{online}"}}"#),
        );
    }

    pub fn ack(&self, device: &str, lock: &str, correlation_id: &str) {
        self.inject(
            &format!("device/{device}/status"),
            format!(
                r#"{{"deviceId":"{device}","lockState":"{lock}","correlationId":"{correlation_id}"}}"#
            ),
        );
    }

    pub fn heartbeat(&self, device: &str) {
        self.inject(
            &format!("device/{device}/heartbeat"),
            format!(r#"{{"deviceId":"{device}","timestamp":1700000000000}}"#),
        );
    }

    pub fn inject(&self, topic: &str, payload: String) {
        self.transport.inject(topic, payload.into_bytes());
    }

    /// Report `device` online with the given lock state and wait for it to apply.
    pub async fn bring_online(&self, device: &str, lock: &str) {
        self.status(device, lock, "online");
        settle().await;
    }

    /// The most recent command published to `device`.
    pub fn last_command(&self, device: &str) -> CommandMessage {
        let published = self
            .transport
            .published_to(&format!("device/{device}/command"));
        let last = published.last().expect("a command should have been published");
        serde_json::from_slice(&last.payload).expect("command payload should be valid JSON")
    }

    pub async fn shutdown(self) {
        self.broker.shutdown().await.expect("shutdown should succeed");
    }
}

/// Defaults with a 5 second command timeout and a 1 second sweep.
pub fn test_config() -> BrokerConfig {
    BrokerConfig::default()
        .with_command_timeout(Duration::from_secs(5))
        .with_timeout_sweep_interval(Duration::from_secs(1))
        .with_publish_retry(3, Duration::from_millis(50))
}

/// Let router workers drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Everything currently queued on `stream`, dropped-notification markers skipped.
pub fn drain(stream: &mut AlertStream) -> Vec<DeviceEvent> {
    std::iter::from_fn(|| stream.try_recv())
        .filter_map(|item| item.ok())
        .collect()
}

pub fn kinds(events: &[DeviceEvent]) -> Vec<EventKind> {
    events.iter().map(|event| event.kind.clone()).collect()
}
