//! The broker facade.
//!
//! `LockerBroker` wires the transport, registry, dispatcher, router, fan-out
//! and background tasks together and is the only type most applications
//! need.
//!
//! # Example
//!
//! ```rust,no_run
//! use locker_broker::{BrokerConfig, CommandKind, ConsumerId, DeviceId, LockerBroker};
//!
//! # async fn example() -> locker_broker::Result<()> {
//! let broker = LockerBroker::connect(BrokerConfig::from_env()?).await?;
//!
//! let mut alerts = broker.subscribe_alerts(ConsumerId::new("admin"));
//! let receipt = broker
//!     .dispatch_command(&DeviceId::new("CAB001"), CommandKind::Unlock)
//!     .await?;
//! println!("unlocked, correlation {}", receipt.correlation_id);
//!
//! while let Some(event) = alerts.recv().await {
//!     println!("{:?}", event?);
//! }
//! broker.shutdown().await
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mqtt_transport::{ConnectionState, MessageHandler, MqttTransport, Transport};
use parking_lot::Mutex;

use crate::config::BrokerConfig;
use crate::dispatcher::{CommandDispatcher, CommandHandle, CommandReceipt, TimeoutSweep};
use crate::error::{BrokerError, Result};
use crate::event::TopicLayout;
use crate::fanout::{AlertStream, AllDevices, NotificationFanout, OwnershipLookup};
use crate::liveness::LivenessMonitor;
use crate::registry::DeviceRegistry;
use crate::router::{EventProcessor, EventRouter};
use crate::sink::{AccessLogStream, EventSink};
use crate::types::{CommandKind, ConsumerId, DeviceId, DeviceState};

/// Builder for [`LockerBroker`].
///
/// Without an explicit transport, `build()` connects an [`MqttTransport`]
/// using `config.transport`. Without an ownership lookup every consumer
/// receives notifications for every device.
pub struct LockerBrokerBuilder {
    config: BrokerConfig,
    transport: Option<Arc<dyn Transport>>,
    ownership: Option<Arc<dyn OwnershipLookup>>,
}

impl LockerBrokerBuilder {
    pub fn new() -> Self {
        Self {
            config: BrokerConfig::default(),
            transport: None,
            ownership: None,
        }
    }

    pub fn with_config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an already connected transport.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Decide which consumers see which devices.
    pub fn with_ownership(mut self, ownership: Arc<dyn OwnershipLookup>) -> Self {
        self.ownership = Some(ownership);
        self
    }

    /// Validate the configuration, subscribe to device topics and start
    /// background tasks.
    pub async fn build(self) -> Result<LockerBroker> {
        let config = self.config;
        config.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(MqttTransport::connect(config.transport.clone()).await?),
        };

        let ownership = self.ownership.unwrap_or_else(|| Arc::new(AllDevices));
        let fanout = NotificationFanout::new(ownership, config.subscriber_queue_capacity);
        let (sink, access_log) = EventSink::new(fanout.clone());
        let registry = DeviceRegistry::new();
        let dispatcher =
            CommandDispatcher::new(Arc::clone(&transport), registry.clone(), sink.clone(), &config);

        let topics = TopicLayout::new(config.topic_prefix.clone());
        let router = Arc::new(EventRouter::start(
            topics.clone(),
            config.router_partitions,
            EventProcessor::new(registry.clone(), dispatcher.clone(), sink.clone()),
        ));

        for (filter, qos) in topics.inbound_filters() {
            let handler: Arc<dyn MessageHandler> = router.clone();
            if let Err(e) = transport.subscribe(&filter, qos, handler).await {
                tracing::error!("Failed to subscribe to {}: {}", filter, e);
                let _ = router.shutdown().await;
                return Err(e.into());
            }
        }

        let sweep = TimeoutSweep::start(dispatcher.clone(), config.timeout_sweep_interval);
        let liveness = LivenessMonitor::start(
            registry.clone(),
            sink,
            config.stale_after,
            config.liveness_check_interval,
        );

        tracing::info!(
            "Locker broker started (prefix {:?}, command timeout {:?}, stale after {:?})",
            topics.prefix(),
            config.command_timeout,
            config.stale_after
        );

        Ok(LockerBroker {
            config,
            transport,
            registry,
            dispatcher,
            fanout,
            router,
            sweep,
            liveness,
            access_log: Mutex::new(Some(access_log)),
        })
    }
}

impl Default for LockerBrokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Command/event broker for a fleet of smart lockers.
pub struct LockerBroker {
    config: BrokerConfig,
    transport: Arc<dyn Transport>,
    registry: DeviceRegistry,
    dispatcher: CommandDispatcher,
    fanout: NotificationFanout,
    router: Arc<EventRouter>,
    sweep: TimeoutSweep,
    liveness: LivenessMonitor,
    /// Taken by the first `access_log_stream()` call
    access_log: Mutex<Option<AccessLogStream>>,
}

impl LockerBroker {
    pub fn builder() -> LockerBrokerBuilder {
        LockerBrokerBuilder::new()
    }

    /// Connect to the MQTT broker described by `config` and start.
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        LockerBrokerBuilder::new().with_config(config).build().await
    }

    /// Send a command and wait for the device to acknowledge it.
    ///
    /// Uses the configured command timeout.
    pub async fn dispatch_command(
        &self,
        device_id: &DeviceId,
        kind: CommandKind,
    ) -> Result<CommandReceipt> {
        self.dispatch(device_id, kind, self.config.command_timeout)
            .await?
            .await
    }

    /// Send a command and return a handle that resolves on acknowledgment.
    ///
    /// Dropping the handle before it resolves cancels the command.
    pub async fn dispatch(
        &self,
        device_id: &DeviceId,
        kind: CommandKind,
        timeout: Duration,
    ) -> Result<CommandHandle> {
        self.dispatcher.dispatch(device_id, kind, timeout).await
    }

    /// Last known state of a device.
    pub fn get_device_state(&self, device_id: &DeviceId) -> Result<DeviceState> {
        self.registry
            .get(device_id)
            .ok_or_else(|| BrokerError::DeviceNotFound(device_id.clone()))
    }

    /// Make a device known before it has reported anything.
    pub fn register_device(&self, device_id: &DeviceId, owner: Option<String>) -> DeviceState {
        self.registry.register(device_id, owner)
    }

    pub fn devices(&self) -> Vec<DeviceState> {
        self.registry.snapshot()
    }

    pub fn subscribe_alerts(&self, consumer_id: ConsumerId) -> AlertStream {
        self.fanout.subscribe(consumer_id)
    }

    /// Close every stream held by `consumer_id`.
    pub fn unsubscribe_alerts(&self, consumer_id: &ConsumerId) -> bool {
        self.fanout.unsubscribe(consumer_id)
    }

    /// Take the access-log stream. Only the first call succeeds.
    pub fn access_log_stream(&self) -> Result<AccessLogStream> {
        self.access_log
            .lock()
            .take()
            .ok_or_else(|| BrokerError::Configuration("Access log stream already taken".to_string()))
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.current_state()
    }

    pub fn health(&self) -> BrokerHealth {
        BrokerHealth {
            connection: self.transport.current_state(),
            devices: self.registry.len(),
            online_devices: self.registry.online_count(),
            pending_commands: self.dispatcher.pending_count(),
            subscribers: self.fanout.subscriber_count(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Stop background tasks, drain the router and close the transport.
    ///
    /// Every component is stopped even if an earlier one fails; the first
    /// error is returned.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Shutting down locker broker");
        let mut first_error: Option<BrokerError> = None;

        let results = [
            self.sweep.shutdown().await,
            self.liveness.shutdown().await,
            self.router.shutdown().await,
            self.transport.shutdown().await.map_err(BrokerError::from),
        ];

        for result in results {
            if let Err(e) = result {
                tracing::error!("Error during shutdown: {}", e);
                first_error.get_or_insert(e);
            }
        }

        let abandoned = self.dispatcher.pending_count();
        if abandoned > 0 {
            tracing::warn!("{} command(s) still pending at shutdown", abandoned);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("Locker broker stopped");
                Ok(())
            }
        }
    }
}

/// Point-in-time broker health.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerHealth {
    pub connection: ConnectionState,
    pub devices: usize,
    pub online_devices: usize,
    pub pending_commands: usize,
    pub subscribers: usize,
}

impl BrokerHealth {
    pub fn is_healthy(&self) -> bool {
        self.connection.is_connected()
    }
}

impl fmt::Display for BrokerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connection={} devices={} online={} pending={} subscribers={}",
            self.connection.as_str(),
            self.devices,
            self.online_devices,
            self.pending_commands,
            self.subscribers
        )
    }
}
