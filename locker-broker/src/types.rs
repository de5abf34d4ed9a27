//! Core domain types for the locker broker.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Unique identifier of a locker device (e.g. `CAB001`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new DeviceId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the device ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of an alert consumer, typically a user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(String);

impl ConsumerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsumerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Token linking an outbound command to its acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh random (UUID v4) correlation id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an id received from a device.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Physical lock state as last reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    Locked,
    Unlocked,
    Unknown,
}

impl LockState {
    /// Parse a wire value, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "locked" | "lock" => Some(LockState::Locked),
            "unlocked" | "unlock" => Some(LockState::Unlocked),
            "unknown" => Some(LockState::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Locked => "locked",
            LockState::Unlocked => "unlocked",
            LockState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reachability of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineState {
    Online,
    Offline,
}

impl OnlineState {
    /// Parse a wire value, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "online" => Some(OnlineState::Online),
            "offline" => Some(OnlineState::Offline),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OnlineState::Online => "online",
            OnlineState::Offline => "offline",
        }
    }
}

impl fmt::Display for OnlineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command that can be sent to a locker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Lock,
    Unlock,
}

impl CommandKind {
    /// Wire name used in the `action` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Lock => "lock",
            CommandKind::Unlock => "unlock",
        }
    }

    /// Lock state a successful execution leaves the device in.
    pub fn expected_lock_state(&self) -> LockState {
        match self {
            CommandKind::Lock => LockState::Locked,
            CommandKind::Unlock => LockState::Unlocked,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last-known state of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub device_id: DeviceId,
    pub lock_state: LockState,
    pub online_state: OnlineState,
    /// Broker receive time of the last sign of life
    pub last_heartbeat: Option<Instant>,
    /// Informational owner reference
    pub owner: Option<String>,
    /// Device-reported time of the last heartbeat, if it sent one
    pub last_reported_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceState {
    /// A device nothing has been heard from yet.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            lock_state: LockState::Unknown,
            online_state: OnlineState::Offline,
            last_heartbeat: None,
            owner: None,
            last_reported_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online_state == OnlineState::Online
    }

    /// Merge the fields present in `patch`.
    pub(crate) fn apply(&mut self, patch: &DevicePatch) {
        if let Some(lock_state) = patch.lock_state {
            self.lock_state = lock_state;
        }
        if let Some(online_state) = patch.online_state {
            self.online_state = online_state;
        }
        if let Some(heartbeat) = patch.heartbeat_at {
            self.last_heartbeat = Some(heartbeat);
        }
        if let Some(reported) = patch.reported_at {
            self.last_reported_at = Some(reported);
        }
        if let Some(owner) = &patch.owner {
            self.owner = Some(owner.clone());
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update for a [`DeviceState`]; absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DevicePatch {
    pub lock_state: Option<LockState>,
    pub online_state: Option<OnlineState>,
    pub heartbeat_at: Option<Instant>,
    pub reported_at: Option<DateTime<Utc>>,
    pub owner: Option<String>,
}

impl DevicePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_state(mut self, lock_state: impl Into<Option<LockState>>) -> Self {
        self.lock_state = lock_state.into();
        self
    }

    pub fn online_state(mut self, online_state: impl Into<Option<OnlineState>>) -> Self {
        self.online_state = online_state.into();
        self
    }

    /// Record a sign of life received at `at`.
    pub fn heartbeat(mut self, at: Instant) -> Self {
        self.heartbeat_at = Some(at);
        self
    }

    pub fn reported_at(mut self, reported_at: impl Into<Option<DateTime<Utc>>>) -> Self {
        self.reported_at = reported_at.into();
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Terminal result of a dispatched command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// The device acknowledged the command
    Succeeded { subject_identity: Option<String> },
    /// The device answered but contradicted or rejected the command
    Failed { reason: String },
    /// No acknowledgment before the deadline
    TimedOut,
    /// The caller abandoned the command
    Cancelled,
}

impl CommandOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandOutcome::Succeeded { .. } => "succeeded",
            CommandOutcome::Failed { .. } => "failed",
            CommandOutcome::TimedOut => "timed_out",
            CommandOutcome::Cancelled => "cancelled",
        }
    }
}
