//! Message types exchanged with the transport.

use bytes::Bytes;

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qos {
    /// Fire and forget
    AtMostOnce,
    /// Delivered at least once; duplicates possible
    AtLeastOnce,
    /// Delivered exactly once
    ExactlyOnce,
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// A message received from the broker.
///
/// Carries only the topic and raw payload; decoding is left to the handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Topic the message was published on
    pub topic: String,
    /// Raw payload bytes
    pub payload: Bytes,
}

impl InboundMessage {
    /// Create a new inbound message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload interpreted as UTF-8, if valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// A message handed to the transport for publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination topic
    pub topic: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Requested delivery guarantee
    pub qos: Qos,
}
