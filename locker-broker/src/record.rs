//! Outbound records: alert notifications and access-log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CommandKind, CorrelationId, DeviceId, LockState};

/// Notification delivered to alert subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub device_id: DeviceId,
    #[serde(flatten)]
    pub kind: EventKind,
    pub at: DateTime<Utc>,
}

impl DeviceEvent {
    pub fn new(device_id: DeviceId, kind: EventKind) -> Self {
        Self {
            device_id,
            kind,
            at: Utc::now(),
        }
    }
}

/// What happened to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    LockStateChanged { from: LockState, to: LockState },
    DeviceOnline,
    DeviceOffline,
    AccessGranted { subject_identity: Option<String> },
    UnauthorizedAccess { subject_identity: Option<String> },
    Tamper,
    CommandSucceeded { correlation_id: CorrelationId, command: CommandKind },
    CommandFailed { correlation_id: CorrelationId, command: CommandKind, reason: String },
    CommandTimedOut { correlation_id: CorrelationId, command: CommandKind },
    CommandCancelled { correlation_id: CorrelationId, command: CommandKind },
}

impl EventKind {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::LockStateChanged { .. } => "lock_state_changed",
            EventKind::DeviceOnline => "device_online",
            EventKind::DeviceOffline => "device_offline",
            EventKind::AccessGranted { .. } => "access_granted",
            EventKind::UnauthorizedAccess { .. } => "unauthorized_access",
            EventKind::Tamper => "tamper",
            EventKind::CommandSucceeded { .. } => "command_succeeded",
            EventKind::CommandFailed { .. } => "command_failed",
            EventKind::CommandTimedOut { .. } => "command_timed_out",
            EventKind::CommandCancelled { .. } => "command_cancelled",
        }
    }

    /// Whether this is a security alert rather than routine state.
    pub fn is_alert(&self) -> bool {
        matches!(self, EventKind::UnauthorizedAccess { .. } | EventKind::Tamper)
    }
}

/// Result of an access attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessOutcome {
    Granted,
    Denied,
    TimedOut,
    Cancelled,
}

impl AccessOutcome {
    /// The `success` column of the access log.
    pub fn is_success(&self) -> bool {
        matches!(self, AccessOutcome::Granted)
    }
}

/// How access was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    /// Command issued through the broker
    Remote,
    /// Face verification at the cabinet
    Face,
    /// Physical interaction with the cabinet, e.g. forcing the door
    Physical,
}

/// Security alert attached to an access-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    None,
    Unauthorized,
    Tamper,
}

/// Durable record of an access attempt, handed to the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogRecord {
    pub device_id: DeviceId,
    pub subject_identity: Option<String>,
    pub outcome: AccessOutcome,
    pub access_type: AccessType,
    pub alert: AlertType,
    pub correlation_id: Option<CorrelationId>,
    pub timestamp: DateTime<Utc>,
}

impl AccessLogRecord {
    pub fn new(device_id: DeviceId, outcome: AccessOutcome, access_type: AccessType) -> Self {
        Self {
            device_id,
            subject_identity: None,
            outcome,
            access_type,
            alert: AlertType::None,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_subject(mut self, subject_identity: Option<String>) -> Self {
        self.subject_identity = subject_identity;
        self
    }

    pub fn with_alert(mut self, alert: AlertType) -> Self {
        self.alert = alert;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}
