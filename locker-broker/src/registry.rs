//! Last-known device state, keyed by device id
//!
//! The registry is a sharded concurrent map. Every mutation of a device goes
//! through that device's shard lock, so writes to one key are serialized while
//! writes to other devices and snapshot reads proceed concurrently. Devices
//! are never removed: an id missing from the registry is *unknown*, which is
//! distinct from *offline*.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::types::{DeviceId, DevicePatch, DeviceState, LockState, OnlineState};

/// Before/after view of a single upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// State before the upsert; `None` if the device was created by it
    pub previous: Option<DeviceState>,
    pub current: DeviceState,
}

impl Transition {
    /// `Some((from, to))` if the lock state changed.
    ///
    /// A newly created device counts as changing from `Unknown`.
    pub fn lock_change(&self) -> Option<(LockState, LockState)> {
        let from = self
            .previous
            .as_ref()
            .map_or(LockState::Unknown, |p| p.lock_state);
        (from != self.current.lock_state).then_some((from, self.current.lock_state))
    }

    /// `Some(new_state)` if the device went online or offline.
    ///
    /// A newly created device starts offline, so creating it online is a change.
    pub fn online_change(&self) -> Option<OnlineState> {
        let from = self
            .previous
            .as_ref()
            .map_or(OnlineState::Offline, |p| p.online_state);
        (from != self.current.online_state).then_some(self.current.online_state)
    }

    pub fn is_new(&self) -> bool {
        self.previous.is_none()
    }
}

/// Concurrent map of device id to last-known state.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<DashMap<DeviceId, DeviceState>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `patch` into the device's state, creating the device if needed.
    pub fn upsert(&self, device_id: &DeviceId, patch: DevicePatch) -> Transition {
        match self.devices.entry(device_id.clone()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get().clone();
                entry.get_mut().apply(&patch);
                Transition {
                    previous: Some(previous),
                    current: entry.get().clone(),
                }
            }
            Entry::Vacant(entry) => {
                let mut state = DeviceState::new(device_id.clone());
                state.apply(&patch);
                tracing::debug!("Device {} first seen", device_id);
                Transition {
                    previous: None,
                    current: entry.insert(state).clone(),
                }
            }
        }
    }

    /// Snapshot of a device's state; `None` means unknown.
    pub fn get(&self, device_id: &DeviceId) -> Option<DeviceState> {
        self.devices.get(device_id).map(|state| state.clone())
    }

    /// Register a device explicitly.
    ///
    /// Idempotent; observed state of an existing device is kept, only the
    /// owner is updated when one is given.
    pub fn register(&self, device_id: &DeviceId, owner: Option<String>) -> DeviceState {
        let mut patch = DevicePatch::new();
        if let Some(owner) = owner {
            patch = patch.owner(owner);
        }

        match self.devices.entry(device_id.clone()) {
            Entry::Occupied(mut entry) => {
                if patch.owner.is_some() {
                    entry.get_mut().apply(&patch);
                }
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let mut state = DeviceState::new(device_id.clone());
                state.apply(&patch);
                tracing::info!("Registered device {}", device_id);
                entry.insert(state).clone()
            }
        }
    }

    /// Flip online devices whose last heartbeat is older than `stale_after` to offline.
    ///
    /// Returns exactly the devices that transitioned on this call. Devices that
    /// are already offline are untouched, so each online-to-offline transition
    /// is reported once.
    pub fn mark_offline_if_stale(&self, now: Instant, stale_after: Duration) -> Vec<DeviceId> {
        let mut transitioned = Vec::new();

        for mut entry in self.devices.iter_mut() {
            let state = entry.value_mut();
            if state.online_state != OnlineState::Online {
                continue;
            }

            let stale = match state.last_heartbeat {
                Some(heartbeat) => now.saturating_duration_since(heartbeat) > stale_after,
                None => true,
            };

            if stale {
                state.apply(&DevicePatch::new().online_state(OnlineState::Offline));
                transitioned.push(state.device_id.clone());
            }
        }

        if !transitioned.is_empty() {
            tracing::info!("Marked {} stale device(s) offline", transitioned.len());
        }
        transitioned
    }

    /// Snapshot of every device.
    pub fn snapshot(&self) -> Vec<DeviceState> {
        self.devices.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.devices.iter().filter(|entry| entry.is_online()).count()
    }
}
