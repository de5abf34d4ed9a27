//! Inbound device events and the wire formats they arrive in.
//!
//! Devices publish JSON on `{prefix}/{id}/{class}`. This module maps a topic
//! to a device id and message class and decodes the payload into a typed
//! [`InboundEvent`]. Field names are camelCase; the snake_case names used by
//! older firmware (`lock_status`, `status`, `user_id`, ...) are accepted as
//! aliases. Anything that does not decode is a `MalformedEvent`.

use chrono::{DateTime, TimeZone, Utc};
use mqtt_transport::Qos;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};
use crate::types::{CommandKind, CorrelationId, DeviceId, LockState, OnlineState};

/// Kind of message, taken from the last topic level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Status,
    Heartbeat,
    VerifyResult,
    Alert,
}

impl MessageClass {
    pub const ALL: [MessageClass; 4] = [
        MessageClass::Status,
        MessageClass::Heartbeat,
        MessageClass::VerifyResult,
        MessageClass::Alert,
    ];

    /// Topic level naming this class.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageClass::Status => "status",
            MessageClass::Heartbeat => "heartbeat",
            MessageClass::VerifyResult => "verify-result",
            MessageClass::Alert => "alert",
        }
    }

    fn from_level(level: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.as_str() == level)
    }

    /// QoS to subscribe with. Heartbeats are periodic, so losing one is harmless.
    pub fn qos(&self) -> Qos {
        match self {
            MessageClass::Heartbeat => Qos::AtMostOnce,
            _ => Qos::AtLeastOnce,
        }
    }
}

/// Topic naming for one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    prefix: String,
}

impl TopicLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Topic commands for `device_id` are published on.
    pub fn command_topic(&self, device_id: &DeviceId) -> String {
        format!("{}/{}/command", self.prefix, device_id)
    }

    /// Filters the router subscribes to, one per message class.
    pub fn inbound_filters(&self) -> Vec<(String, Qos)> {
        MessageClass::ALL
            .iter()
            .map(|class| (format!("{}/+/{}", self.prefix, class.as_str()), class.qos()))
            .collect()
    }

    /// Split a topic into device id and message class.
    ///
    /// Returns `None` for topics outside this layout, which are ignored.
    pub fn parse(&self, topic: &str) -> Option<(DeviceId, MessageClass)> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let (device, class) = rest.split_once('/')?;
        if device.is_empty() || device == "+" || device == "#" {
            return None;
        }
        let class = MessageClass::from_level(class)?;
        Some((DeviceId::new(device), class))
    }
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self::new("device")
    }
}

/// Type of alert raised by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAlertKind {
    /// Enclosure opened or forced
    Tamper,
    /// Access attempted by someone not recognized
    Unauthorized,
}

impl DeviceAlertKind {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "tamper" => Some(DeviceAlertKind::Tamper),
            "unauthorized" | "unauthorized_access" => Some(DeviceAlertKind::Unauthorized),
            _ => None,
        }
    }
}

/// A decoded device message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    StatusUpdate {
        device_id: DeviceId,
        lock_state: Option<LockState>,
        online_state: Option<OnlineState>,
        correlation_id: Option<CorrelationId>,
    },
    Heartbeat {
        device_id: DeviceId,
        /// Device clock, informational only
        timestamp: Option<DateTime<Utc>>,
    },
    VerifyResult {
        device_id: DeviceId,
        correlation_id: Option<CorrelationId>,
        success: bool,
        subject_identity: Option<String>,
    },
    Alert {
        device_id: DeviceId,
        kind: DeviceAlertKind,
    },
}

impl InboundEvent {
    /// Decode a payload received on a topic already split by [`TopicLayout::parse`].
    ///
    /// The payload's `deviceId` must name the same device as the topic.
    pub fn decode(
        topic: &str,
        device_id: &DeviceId,
        class: MessageClass,
        payload: &[u8],
    ) -> Result<Self> {
        let malformed = |reason: String| BrokerError::MalformedEvent {
            topic: topic.to_string(),
            reason,
        };

        let event = match class {
            MessageClass::Status => {
                let wire: StatusPayload = parse_json(payload).map_err(malformed)?;
                check_device(device_id, &wire.device_id).map_err(malformed)?;
                let lock_state = match wire.lock_state.as_deref() {
                    Some(value) => Some(
                        LockState::parse(value)
                            .ok_or_else(|| malformed(format!("unknown lock state {value:?}")))?,
                    ),
                    None => None,
                };
                let online_state = match wire.online_state.as_deref() {
                    Some(value) => Some(
                        OnlineState::parse(value)
                            .ok_or_else(|| malformed(format!("unknown online state {value:?}")))?,
                    ),
                    None => None,
                };
                InboundEvent::StatusUpdate {
                    device_id: device_id.clone(),
                    lock_state,
                    online_state,
                    correlation_id: non_empty(wire.correlation_id).map(CorrelationId::new),
                }
            }
            MessageClass::Heartbeat => {
                let wire: HeartbeatPayload = parse_json(payload).map_err(malformed)?;
                check_device(device_id, &wire.device_id).map_err(malformed)?;
                let timestamp = match wire.timestamp {
                    Some(ts) => Some(ts.to_datetime().map_err(malformed)?),
                    None => None,
                };
                InboundEvent::Heartbeat {
                    device_id: device_id.clone(),
                    timestamp,
                }
            }
            MessageClass::VerifyResult => {
                let wire: VerifyPayload = parse_json(payload).map_err(malformed)?;
                check_device(device_id, &wire.device_id).map_err(malformed)?;
                InboundEvent::VerifyResult {
                    device_id: device_id.clone(),
                    correlation_id: non_empty(wire.correlation_id).map(CorrelationId::new),
                    success: wire.success,
                    subject_identity: non_empty(wire.subject_identity.map(WireId::into_string)),
                }
            }
            MessageClass::Alert => {
                let wire: AlertPayload = parse_json(payload).map_err(malformed)?;
                check_device(device_id, &wire.device_id).map_err(malformed)?;
                let kind = DeviceAlertKind::parse(&wire.kind)
                    .ok_or_else(|| malformed(format!("unknown alert type {:?}", wire.kind)))?;
                InboundEvent::Alert {
                    device_id: device_id.clone(),
                    kind,
                }
            }
        };

        Ok(event)
    }

    pub fn device_id(&self) -> &DeviceId {
        match self {
            InboundEvent::StatusUpdate { device_id, .. }
            | InboundEvent::Heartbeat { device_id, .. }
            | InboundEvent::VerifyResult { device_id, .. }
            | InboundEvent::Alert { device_id, .. } => device_id,
        }
    }

    /// Correlation id linking this event to a dispatched command, if any.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            InboundEvent::StatusUpdate { correlation_id, .. }
            | InboundEvent::VerifyResult { correlation_id, .. } => correlation_id.as_ref(),
            _ => None,
        }
    }

    pub fn class(&self) -> MessageClass {
        match self {
            InboundEvent::StatusUpdate { .. } => MessageClass::Status,
            InboundEvent::Heartbeat { .. } => MessageClass::Heartbeat,
            InboundEvent::VerifyResult { .. } => MessageClass::VerifyResult,
            InboundEvent::Alert { .. } => MessageClass::Alert,
        }
    }
}

/// Command published to `{prefix}/{id}/command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    pub correlation_id: CorrelationId,
    pub device_id: DeviceId,
    pub action: CommandKind,
    /// Epoch milliseconds
    pub issued_at: i64,
}

impl CommandMessage {
    pub fn new(
        correlation_id: CorrelationId,
        device_id: DeviceId,
        action: CommandKind,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id,
            device_id,
            action,
            issued_at: issued_at.timestamp_millis(),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            BrokerError::Configuration(format!("command could not be serialized: {e}"))
        })
    }
}

/// Device ids and subject ids arrive as strings or bare numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(serde_json::Number),
}

impl WireId {
    fn into_string(self) -> String {
        match self {
            WireId::Text(text) => text,
            WireId::Number(number) => number.to_string(),
        }
    }
}

/// Epoch milliseconds or an RFC 3339 string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Millis(i64),
    Text(String),
}

impl WireTimestamp {
    fn to_datetime(&self) -> std::result::Result<DateTime<Utc>, String> {
        match self {
            WireTimestamp::Millis(ms) => Utc
                .timestamp_millis_opt(*ms)
                .single()
                .ok_or_else(|| format!("timestamp out of range: {ms}")),
            WireTimestamp::Text(text) => DateTime::parse_from_rfc3339(text)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| format!("invalid timestamp {text:?}: {e}")),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    #[serde(alias = "device_id")]
    device_id: WireId,
    #[serde(default, alias = "lock_state", alias = "lock_status", alias = "lockStatus")]
    lock_state: Option<String>,
    #[serde(default, alias = "online_state", alias = "status")]
    online_state: Option<String>,
    #[serde(default, alias = "correlation_id")]
    correlation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatPayload {
    #[serde(alias = "device_id")]
    device_id: WireId,
    #[serde(default)]
    timestamp: Option<WireTimestamp>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyPayload {
    #[serde(alias = "device_id")]
    device_id: WireId,
    #[serde(default, alias = "correlation_id")]
    correlation_id: Option<String>,
    success: bool,
    #[serde(default, alias = "subject_identity", alias = "user_id", alias = "username")]
    subject_identity: Option<WireId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertPayload {
    #[serde(alias = "device_id")]
    device_id: WireId,
    #[serde(rename = "type", alias = "alert_type", alias = "alertType")]
    kind: String,
}

fn parse_json<T: serde::de::DeserializeOwned>(payload: &[u8]) -> std::result::Result<T, String> {
    serde_json::from_slice(payload).map_err(|e| e.to_string())
}

fn check_device(expected: &DeviceId, found: &WireId) -> std::result::Result<(), String> {
    let found = match found {
        WireId::Text(text) => text.clone(),
        WireId::Number(number) => number.to_string(),
    };
    if found == expected.as_str() {
        Ok(())
    } else {
        Err(format!("payload deviceId {found:?} does not match topic device {expected}"))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn decode(topic: &str, payload: &str) -> Result<InboundEvent> {
        let layout = TopicLayout::default();
        let (device_id, class) = layout.parse(topic).expect("topic in layout");
        InboundEvent::decode(topic, &device_id, class, payload.as_bytes())
    }

    #[rstest]
    #[case("device/CAB001/status", Some(("CAB001", MessageClass::Status)))]
    #[case("device/CAB001/heartbeat", Some(("CAB001", MessageClass::Heartbeat)))]
    #[case("device/CAB001/verify-result", Some(("CAB001", MessageClass::VerifyResult)))]
    #[case("device/CAB001/alert", Some(("CAB001", MessageClass::Alert)))]
    #[case("device/CAB001/command", None)]
    #[case("device/CAB001/status/extra", None)]
    #[case("device//status", None)]
    #[case("cabinet/CAB001/status", None)]
    #[case("devices/CAB001/status", None)]
    fn test_parse_topic(#[case] topic: &str, #[case] expected: Option<(&str, MessageClass)>) {
        let parsed = TopicLayout::default().parse(topic);
        assert_eq!(parsed, expected.map(|(id, class)| (DeviceId::new(id), class)));
    }

    #[test]
    fn test_custom_prefix() {
        let layout = TopicLayout::new("site-a/lockers");
        assert_eq!(
            layout.parse("site-a/lockers/CAB9/heartbeat"),
            Some((DeviceId::new("CAB9"), MessageClass::Heartbeat))
        );
        assert_eq!(layout.command_topic(&DeviceId::new("CAB9")), "site-a/lockers/CAB9/command");
        assert_eq!(layout.inbound_filters().len(), 4);
        assert_eq!(layout.inbound_filters()[0].0, "site-a/lockers/+/status");
    }

    #[test]
    fn test_decode_status() {
        let event = decode(
            "device/CAB001/status",
            r#"{"deviceId":"CAB001","lockState":"unlocked","onlineState":"online","correlationId":"c-1"}"#,
        )
        .unwrap();

        assert_eq!(
            event,
            InboundEvent::StatusUpdate {
                device_id: DeviceId::new("CAB001"),
                lock_state: Some(LockState::Unlocked),
                online_state: Some(OnlineState::Online),
                correlation_id: Some(CorrelationId::new("c-1")),
            }
        );
        assert_eq!(event.correlation_id().map(|c| c.as_str()), Some("c-1"));
    }

    #[test]
    fn test_decode_status_with_firmware_field_names() {
        let event = decode(
            "device/7/status",
            r#"{"device_id":7,"status":"offline","lock_status":"locked"}"#,
        )
        .unwrap();

        assert_eq!(
            event,
            InboundEvent::StatusUpdate {
                device_id: DeviceId::new("7"),
                lock_state: Some(LockState::Locked),
                online_state: Some(OnlineState::Offline),
                correlation_id: None,
            }
        );
    }

    #[test]
    fn test_decode_heartbeat_timestamps() {
        let event = decode(
            "device/CAB001/heartbeat",
            r#"{"deviceId":"CAB001","timestamp":1700000000000}"#,
        )
        .unwrap();
        match event {
            InboundEvent::Heartbeat { timestamp, .. } => {
                assert_eq!(timestamp.unwrap().timestamp(), 1_700_000_000);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let event = decode(
            "device/CAB001/heartbeat",
            r#"{"deviceId":"CAB001","timestamp":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(event, InboundEvent::Heartbeat { timestamp: Some(_), .. }));

        let event = decode("device/CAB001/heartbeat", r#"{"deviceId":"CAB001"}"#).unwrap();
        assert!(matches!(event, InboundEvent::Heartbeat { timestamp: None, .. }));
    }

    #[test]
    fn test_decode_verify_result() {
        let event = decode(
            "device/CAB001/verify-result",
            r#"{"deviceId":"CAB001","success":true,"user_id":42}"#,
        )
        .unwrap();

        assert_eq!(
            event,
            InboundEvent::VerifyResult {
                device_id: DeviceId::new("CAB001"),
                correlation_id: None,
                success: true,
                subject_identity: Some("42".to_string()),
            }
        );
    }

    #[test]
    fn test_decode_alert() {
        let event = decode(
            "device/CAB001/alert",
            r#"{"deviceId":"CAB001","alert_type":"unauthorized_access"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            InboundEvent::Alert {
                device_id: DeviceId::new("CAB001"),
                kind: DeviceAlertKind::Unauthorized,
            }
        );
    }

    #[rstest]
    #[case("device/CAB001/status", "not json")]
    #[case("device/CAB001/status", "[1,2,3]")]
    #[case("device/CAB001/status", r#"{"lockState":"locked"}"#)]
    #[case("device/CAB001/status", r#"{"deviceId":"CAB002","lockState":"locked"}"#)]
    #[case("device/CAB001/status", r#"{"deviceId":"CAB001","lockState":"ajar"}"#)]
    #[case("device/CAB001/heartbeat", r#"{"deviceId":"CAB001","timestamp":"yesterday"}"#)]
    #[case("device/CAB001/verify-result", r#"{"deviceId":"CAB001"}"#)]
    #[case("device/CAB001/alert", r#"{"deviceId":"CAB001","type":"fire"}"#)]
    fn test_malformed_payloads(#[case] topic: &str, #[case] payload: &str) {
        assert!(matches!(
            decode(topic, payload),
            Err(BrokerError::MalformedEvent { .. })
        ));
    }

    #[test]
    fn test_command_message_wire_format() {
        let issued_at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let message = CommandMessage::new(
            CorrelationId::new("c-1"),
            DeviceId::new("CAB001"),
            CommandKind::Unlock,
            issued_at,
        );

        let json: serde_json::Value = serde_json::from_slice(&message.to_payload().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "correlationId": "c-1",
                "deviceId": "CAB001",
                "action": "unlock",
                "issuedAt": 1_700_000_000_123i64,
            })
        );
    }
}
