//! Notification fan-out to per-consumer alert streams.
//!
//! `publish` never waits on a consumer. Each [`AlertStream`] owns a bounded
//! queue; when it is full the oldest notification is discarded and the
//! stream reports a `DroppedNotification` error before the next event it
//! yields.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::error::{BrokerError, Result};
use crate::record::DeviceEvent;
use crate::types::{ConsumerId, DeviceId};

/// Decides which consumers hear about which devices.
#[cfg_attr(test, mockall::automock)]
pub trait OwnershipLookup: Send + Sync {
    /// Whether `consumer` should receive events for `device`.
    fn is_interested(&self, consumer: &ConsumerId, device: &DeviceId) -> bool;
}

/// Every consumer receives every device's events.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllDevices;

impl OwnershipLookup for AllDevices {
    fn is_interested(&self, _consumer: &ConsumerId, _device: &DeviceId) -> bool {
        true
    }
}

/// Explicit consumer-to-devices assignments.
#[derive(Debug, Default)]
pub struct OwnerMap {
    assignments: RwLock<HashMap<ConsumerId, HashSet<DeviceId>>>,
}

impl OwnerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `consumer` access to `device`'s events.
    pub fn assign(&self, consumer: ConsumerId, device: DeviceId) {
        self.assignments.write().entry(consumer).or_default().insert(device);
    }

    /// Returns whether the assignment existed.
    pub fn revoke(&self, consumer: &ConsumerId, device: &DeviceId) -> bool {
        let mut assignments = self.assignments.write();
        let Some(devices) = assignments.get_mut(consumer) else {
            return false;
        };
        let removed = devices.remove(device);
        if devices.is_empty() {
            assignments.remove(consumer);
        }
        removed
    }

    pub fn devices_of(&self, consumer: &ConsumerId) -> Vec<DeviceId> {
        self.assignments
            .read()
            .get(consumer)
            .map(|devices| devices.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl OwnershipLookup for OwnerMap {
    fn is_interested(&self, consumer: &ConsumerId, device: &DeviceId) -> bool {
        self.assignments
            .read()
            .get(consumer)
            .is_some_and(|devices| devices.contains(device))
    }
}

/// Bounded drop-oldest queue behind one alert stream.
struct Channel {
    id: u64,
    consumer_id: ConsumerId,
    capacity: usize,
    slot: Mutex<Slot>,
    notify: Notify,
    total_dropped: AtomicU64,
}

#[derive(Default)]
struct Slot {
    events: VecDeque<DeviceEvent>,
    /// Drops not yet reported to the reader
    unreported_drops: u64,
    closed: bool,
}

impl Channel {
    /// Enqueue without blocking. Returns true if an older event was dropped.
    fn push(&self, event: DeviceEvent) -> bool {
        let dropped = {
            let mut slot = self.slot.lock();
            if slot.closed {
                return false;
            }
            let dropped = if slot.events.len() >= self.capacity {
                slot.events.pop_front();
                slot.unreported_drops += 1;
                true
            } else {
                false
            };
            slot.events.push_back(event);
            dropped
        };

        if dropped {
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    fn close(&self) {
        self.slot.lock().closed = true;
        self.notify.notify_one();
    }

    fn poll_item(&self) -> Option<Option<Result<DeviceEvent>>> {
        let mut slot = self.slot.lock();
        if slot.unreported_drops > 0 {
            let dropped = std::mem::take(&mut slot.unreported_drops);
            return Some(Some(Err(BrokerError::DroppedNotification {
                consumer_id: self.consumer_id.clone(),
                dropped,
            })));
        }
        if let Some(event) = slot.events.pop_front() {
            return Some(Some(Ok(event)));
        }
        if slot.closed {
            return Some(None);
        }
        None
    }
}

struct FanoutInner {
    subscribers: DashMap<ConsumerId, Vec<Arc<Channel>>>,
    ownership: Arc<dyn OwnershipLookup>,
    capacity: usize,
    next_channel_id: AtomicU64,
}

/// Distributes device events to interested consumers.
#[derive(Clone)]
pub struct NotificationFanout {
    inner: Arc<FanoutInner>,
}

impl NotificationFanout {
    /// Create a fan-out with `capacity` notifications buffered per stream.
    pub fn new(ownership: Arc<dyn OwnershipLookup>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(FanoutInner {
                subscribers: DashMap::new(),
                ownership,
                capacity: capacity.max(1),
                next_channel_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new alert stream for `consumer_id`.
    ///
    /// A consumer may hold several streams (one per open connection); each
    /// receives every notification meant for the consumer.
    pub fn subscribe(&self, consumer_id: ConsumerId) -> AlertStream {
        let channel = Arc::new(Channel {
            id: self.inner.next_channel_id.fetch_add(1, Ordering::Relaxed),
            consumer_id: consumer_id.clone(),
            capacity: self.inner.capacity,
            slot: Mutex::new(Slot::default()),
            notify: Notify::new(),
            total_dropped: AtomicU64::new(0),
        });

        self.inner
            .subscribers
            .entry(consumer_id.clone())
            .or_default()
            .push(channel.clone());

        tracing::debug!("Consumer {} subscribed to alerts", consumer_id);
        AlertStream {
            channel,
            fanout: Arc::downgrade(&self.inner),
        }
    }

    /// Close every stream of `consumer_id`.
    ///
    /// Open streams yield what is already queued and then end. Returns
    /// whether the consumer had any streams.
    pub fn unsubscribe(&self, consumer_id: &ConsumerId) -> bool {
        match self.inner.subscribers.remove(consumer_id) {
            Some((_, channels)) => {
                for channel in channels {
                    channel.close();
                }
                tracing::debug!("Consumer {} unsubscribed from alerts", consumer_id);
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to every interested consumer without blocking.
    ///
    /// Returns the number of streams the event was queued on.
    pub fn publish(&self, event: DeviceEvent) -> usize {
        let mut delivered = 0;

        for entry in self.inner.subscribers.iter() {
            let consumer_id = entry.key();
            if !self.inner.ownership.is_interested(consumer_id, &event.device_id) {
                continue;
            }
            for channel in entry.value() {
                if channel.push(event.clone()) {
                    tracing::warn!(
                        "Alert queue full for consumer {}, dropped oldest notification",
                        consumer_id
                    );
                }
                delivered += 1;
            }
        }

        tracing::trace!(
            "Published {} for {} to {} stream(s)",
            event.kind.name(),
            event.device_id,
            delivered
        );
        delivered
    }

    /// Number of consumers with at least one open stream.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Total notifications dropped across the consumer's open streams.
    pub fn dropped_count(&self, consumer_id: &ConsumerId) -> u64 {
        self.inner
            .subscribers
            .get(consumer_id)
            .map(|channels| {
                channels
                    .iter()
                    .map(|c| c.total_dropped.load(Ordering::Relaxed))
                    .sum()
            })
            .unwrap_or(0)
    }
}

impl FanoutInner {
    fn detach(&self, consumer_id: &ConsumerId, channel_id: u64) {
        let now_empty = match self.subscribers.get_mut(consumer_id) {
            Some(mut channels) => {
                channels.retain(|c| c.id != channel_id);
                channels.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.subscribers
                .remove_if(consumer_id, |_, channels| channels.is_empty());
        }
    }
}

/// A consumer's stream of notifications.
///
/// Yields `Err(DroppedNotification)` when older notifications were discarded
/// because the stream fell behind. Dropping the stream unsubscribes it.
pub struct AlertStream {
    channel: Arc<Channel>,
    fanout: Weak<FanoutInner>,
}

impl AlertStream {
    pub fn consumer_id(&self) -> &ConsumerId {
        &self.channel.consumer_id
    }

    /// Wait for the next notification. `None` once the stream is closed and drained.
    pub async fn recv(&mut self) -> Option<Result<DeviceEvent>> {
        loop {
            if let Some(item) = self.channel.poll_item() {
                return item;
            }
            self.channel.notify.notified().await;
        }
    }

    /// Next notification if one is queued.
    pub fn try_recv(&mut self) -> Option<Result<DeviceEvent>> {
        self.channel.poll_item().flatten()
    }

    /// Notifications dropped from this stream since it was opened.
    pub fn dropped(&self) -> u64 {
        self.channel.total_dropped.load(Ordering::Relaxed)
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<DeviceEvent>> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.recv().await.map(|item| (item, stream))
        })
    }
}

impl Drop for AlertStream {
    fn drop(&mut self) {
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.detach(&self.channel.consumer_id, self.channel.id);
        }
    }
}
