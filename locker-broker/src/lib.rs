//! # locker-broker
//!
//! Command/event broker for a fleet of smart locker cabinets.
//!
//! Devices talk MQTT. The broker keeps the last known state of every
//! device, sends lock/unlock commands and matches the devices'
//! acknowledgments to them by correlation id, and turns the raw device
//! traffic into notifications for connected consumers and access-log
//! records for persistence.
//!
//! - [`DeviceRegistry`]: last known lock and online state per device
//! - [`CommandDispatcher`]: one outstanding command per device, each
//!   resolved exactly once (acknowledged, failed, timed out or cancelled)
//! - [`EventRouter`]: decodes inbound topics, preserving per-device order
//! - [`NotificationFanout`]: bounded per-consumer queues, oldest dropped first
//! - [`LivenessMonitor`]: marks devices offline after missed heartbeats
//!
//! [`LockerBroker`] wires these together; see its docs for an example.

mod broker;
mod config;
mod dispatcher;
mod error;
mod event;
mod fanout;
mod liveness;
pub mod logging;
mod record;
mod registry;
mod router;
mod sink;
mod task;
mod types;

pub use broker::{BrokerHealth, LockerBroker, LockerBrokerBuilder};
pub use config::{BrokerConfig, MAX_COMMAND_TIMEOUT};
pub use dispatcher::{CommandDispatcher, CommandHandle, CommandReceipt, TimeoutSweep};
pub use error::{BrokerError, Result};
pub use event::{CommandMessage, DeviceAlertKind, InboundEvent, MessageClass, TopicLayout};
pub use fanout::{AlertStream, AllDevices, NotificationFanout, OwnerMap, OwnershipLookup};
pub use liveness::LivenessMonitor;
pub use record::{
    AccessLogRecord, AccessOutcome, AccessType, AlertType, DeviceEvent, EventKind,
};
pub use registry::{DeviceRegistry, Transition};
pub use router::{EventProcessor, EventRouter};
pub use sink::{AccessLogStream, EventSink};
pub use types::{
    CommandKind, CommandOutcome, ConsumerId, CorrelationId, DeviceId, DevicePatch, DeviceState,
    LockState, OnlineState,
};

pub use mqtt_transport::{
    ConnectionState, Qos, TlsConfig, Transport, TransportConfig, TransportError,
};
