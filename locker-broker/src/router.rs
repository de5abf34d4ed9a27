//! Inbound event routing.
//!
//! The router is registered with the transport as the handler for every
//! inbound device topic. It never does real work on the transport's receive
//! loop: each message is tagged with its receive time and pushed onto one of
//! N partition queues, chosen by hashing the device id. One worker per
//! partition drains its queue in order, so events from the same device are
//! applied in arrival order while different devices proceed concurrently.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use mqtt_transport::{HandlerResult, InboundMessage, MessageHandler};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::dispatcher::CommandDispatcher;
use crate::error::{BrokerError, Result};
use crate::event::{DeviceAlertKind, InboundEvent, MessageClass, TopicLayout};
use crate::record::{AccessLogRecord, AccessOutcome, AccessType, AlertType, DeviceEvent, EventKind};
use crate::registry::{DeviceRegistry, Transition};
use crate::sink::EventSink;
use crate::task::BackgroundTask;
use crate::types::{DeviceId, DevicePatch, OnlineState};

#[derive(Debug)]
struct RoutedMessage {
    topic: String,
    device_id: DeviceId,
    class: MessageClass,
    payload: Bytes,
    received_at: Instant,
}

/// Applies decoded device events to the registry, dispatcher and sinks.
#[derive(Clone)]
pub struct EventProcessor {
    registry: DeviceRegistry,
    dispatcher: CommandDispatcher,
    sink: EventSink,
}

impl EventProcessor {
    pub fn new(registry: DeviceRegistry, dispatcher: CommandDispatcher, sink: EventSink) -> Self {
        Self {
            registry,
            dispatcher,
            sink,
        }
    }

    fn process(&self, message: RoutedMessage) {
        match InboundEvent::decode(
            &message.topic,
            &message.device_id,
            message.class,
            &message.payload,
        ) {
            Ok(event) => self.apply(event, message.received_at),
            Err(e) => tracing::warn!("Dropping event: {}", e),
        }
    }

    /// Apply one event received at `received_at`.
    pub fn apply(&self, event: InboundEvent, received_at: Instant) {
        tracing::trace!("Applying {} event from {}", event.class().as_str(), event.device_id());

        match &event {
            InboundEvent::StatusUpdate {
                device_id,
                lock_state,
                online_state,
                correlation_id,
            } => {
                let mut patch = DevicePatch::new()
                    .lock_state(*lock_state)
                    .online_state(*online_state);
                if *online_state == Some(OnlineState::Online) {
                    patch = patch.heartbeat(received_at);
                }

                let transition = self.registry.upsert(device_id, patch);
                self.notify_transition(&transition);

                if correlation_id.is_some() {
                    self.dispatcher.resolve(&event);
                }
            }
            InboundEvent::Heartbeat {
                device_id,
                timestamp,
            } => {
                let transition = self.registry.upsert(
                    device_id,
                    DevicePatch::new()
                        .online_state(OnlineState::Online)
                        .heartbeat(received_at)
                        .reported_at(*timestamp),
                );
                self.notify_transition(&transition);
            }
            InboundEvent::VerifyResult {
                device_id,
                correlation_id,
                success,
                subject_identity,
            } => {
                if correlation_id.is_some() {
                    self.dispatcher.resolve(&event);
                } else {
                    let (outcome, alert) = if *success {
                        (AccessOutcome::Granted, AlertType::None)
                    } else {
                        (AccessOutcome::Denied, AlertType::Unauthorized)
                    };
                    self.sink.record(
                        AccessLogRecord::new(device_id.clone(), outcome, AccessType::Face)
                            .with_subject(subject_identity.clone())
                            .with_alert(alert),
                    );
                }

                let kind = if *success {
                    EventKind::AccessGranted {
                        subject_identity: subject_identity.clone(),
                    }
                } else {
                    EventKind::UnauthorizedAccess {
                        subject_identity: subject_identity.clone(),
                    }
                };
                self.sink.notify(DeviceEvent::new(device_id.clone(), kind));
            }
            InboundEvent::Alert { device_id, kind } => {
                tracing::warn!("Device {} raised {:?} alert", device_id, kind);
                let (event_kind, access_type, alert) = match kind {
                    DeviceAlertKind::Tamper => {
                        (EventKind::Tamper, AccessType::Physical, AlertType::Tamper)
                    }
                    DeviceAlertKind::Unauthorized => (
                        EventKind::UnauthorizedAccess {
                            subject_identity: None,
                        },
                        AccessType::Face,
                        AlertType::Unauthorized,
                    ),
                };
                self.sink.record(
                    AccessLogRecord::new(device_id.clone(), AccessOutcome::Denied, access_type)
                        .with_alert(alert),
                );
                self.sink.notify(DeviceEvent::new(device_id.clone(), event_kind));
            }
        }
    }

    /// Coming online is reported before a lock change, going offline after it.
    fn notify_transition(&self, transition: &Transition) {
        let device_id = &transition.current.device_id;
        let online_change = transition.online_change();

        if online_change == Some(OnlineState::Online) {
            tracing::info!("Device {} is online", device_id);
            self.sink
                .notify(DeviceEvent::new(device_id.clone(), EventKind::DeviceOnline));
        }

        if let Some((from, to)) = transition.lock_change() {
            tracing::info!("Device {} lock state {} -> {}", device_id, from, to);
            self.sink.notify(DeviceEvent::new(
                device_id.clone(),
                EventKind::LockStateChanged { from, to },
            ));
        }

        if online_change == Some(OnlineState::Offline) {
            tracing::info!("Device {} is offline", device_id);
            self.sink
                .notify(DeviceEvent::new(device_id.clone(), EventKind::DeviceOffline));
        }
    }
}

/// Transport handler that fans inbound messages out to partition workers.
pub struct EventRouter {
    topics: TopicLayout,
    partitions: RwLock<Vec<mpsc::UnboundedSender<RoutedMessage>>>,
    workers: Mutex<Vec<BackgroundTask>>,
}

impl EventRouter {
    /// Spawn `partitions` workers sharing `processor`.
    pub fn start(topics: TopicLayout, partitions: usize, processor: EventProcessor) -> Self {
        let partitions = partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let mut workers = Vec::with_capacity(partitions);

        for _ in 0..partitions {
            let (tx, mut rx) = mpsc::unbounded_channel::<RoutedMessage>();
            let processor = processor.clone();

            workers.push(BackgroundTask::spawn(
                "router partition",
                move |mut shutdown_rx| async move {
                    loop {
                        tokio::select! {
                            message = rx.recv() => match message {
                                Some(message) => processor.process(message),
                                None => break,
                            },
                            _ = shutdown_rx.recv() => {
                                while let Ok(message) = rx.try_recv() {
                                    processor.process(message);
                                }
                                break;
                            }
                        }
                    }
                },
            ));
            senders.push(tx);
        }

        tracing::info!("Event router started with {} partition(s)", partitions);

        Self {
            topics,
            partitions: RwLock::new(senders),
            workers: Mutex::new(workers),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.read().len()
    }

    /// Stop accepting messages, drain what is queued and join the workers.
    pub async fn shutdown(&self) -> Result<()> {
        self.partitions.write().clear();
        let workers = std::mem::take(&mut *self.workers.lock());

        let mut first_error = None;
        for worker in workers {
            if let Err(e) = worker.shutdown().await {
                tracing::error!("{}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("Event router stopped");
                Ok(())
            }
        }
    }
}

impl MessageHandler for EventRouter {
    fn on_message(&self, message: &InboundMessage) -> HandlerResult {
        let Some((device_id, class)) = self.topics.parse(&message.topic) else {
            tracing::debug!("Ignoring message on unrecognized topic {}", message.topic);
            return Ok(());
        };

        let partitions = self.partitions.read();
        if partitions.is_empty() {
            return Err(BrokerError::ShutdownError("event router is stopped".to_string()).into());
        }

        let index = partition_for(&device_id, partitions.len());
        let routed = RoutedMessage {
            topic: message.topic.clone(),
            device_id,
            class,
            payload: message.payload.clone(),
            received_at: Instant::now(),
        };

        partitions[index].send(routed).map_err(|_| {
            BrokerError::ShutdownError(format!("router partition {index} has stopped")).into()
        })
    }
}

fn partition_for(device_id: &DeviceId, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    device_id.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}
