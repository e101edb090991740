//! Common data types for pullsub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod validation;

/// Attribute key used to expose the delivery attempt to the user.
pub const DELIVERY_ATTEMPT_ATTRIBUTE: &str = "googclient_deliveryattempt";

/// Server-issued handle identifying one delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AckId(pub String);

impl AckId {
    /// Create an ack id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        AckId(id.into())
    }

    /// Borrow the raw ack id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AckId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AckId {
    fn from(s: &str) -> Self {
        AckId(s.to_string())
    }
}

/// A message as published to a topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PubsubMessage {
    /// Message payload.
    pub data: Vec<u8>,
    /// Message attributes.
    pub attributes: HashMap<String, String>,
    /// Service assigned message id.
    pub message_id: String,
    /// Time the service accepted the message.
    pub publish_time: Option<DateTime<Utc>>,
    /// Ordering key, empty when the message is unordered.
    pub ordering_key: String,
}

impl PubsubMessage {
    /// Create a message with the given payload.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Size in bytes counted against flow control.
    pub fn serialized_size(&self) -> usize {
        let attributes: usize = self
            .attributes
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        self.data.len() + attributes + self.message_id.len() + self.ordering_key.len()
    }

    /// Delivery attempt recorded on this message, if any.
    ///
    /// Returns `None` when the attribute is absent or not a number.
    pub fn delivery_attempt(&self) -> Option<i32> {
        self.attributes
            .get(DELIVERY_ATTEMPT_ATTRIBUTE)
            .and_then(|v| v.parse().ok())
    }
}

/// A message delivered on a subscription, together with its ack id.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// Ack id for this delivery.
    pub ack_id: AckId,
    /// The delivered message.
    pub message: PubsubMessage,
    /// Delivery attempt; 0 when the subscription has no dead letter policy.
    pub delivery_attempt: i32,
}

/// Delivery metadata kept alongside every pending ack request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryMetadata {
    /// Service assigned message id.
    pub message_id: String,
    /// Ordering key of the message.
    pub ordering_key: String,
    /// Delivery attempt, when known.
    pub delivery_attempt: Option<i32>,
    /// Bytes reserved in flow control for this message.
    pub serialized_size: usize,
}

impl DeliveryMetadata {
    /// Extract the metadata of a received message.
    pub fn from_received(received: &ReceivedMessage) -> Self {
        Self {
            message_id: received.message.message_id.clone(),
            ordering_key: received.message.ordering_key.clone(),
            delivery_attempt: (received.delivery_attempt > 0).then_some(received.delivery_attempt),
            serialized_size: received.message.serialized_size(),
        }
    }
}

/// First request sent on a streaming pull stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamingPullRequest {
    /// Full subscription name.
    pub subscription: String,
    /// Ack deadline applied by the service to messages on this stream.
    pub stream_ack_deadline_seconds: i32,
    /// Client id, stable across reconnects of one connection.
    pub client_id: String,
    /// Service side flow control limit on messages, 0 for none.
    pub max_outstanding_messages: i64,
    /// Service side flow control limit on bytes, 0 for none.
    pub max_outstanding_bytes: i64,
}

/// Subscription properties echoed by the service on every response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionProperties {
    /// Exactly once delivery is enabled on the subscription.
    pub exactly_once_delivery_enabled: bool,
    /// Message ordering is enabled on the subscription.
    pub message_ordering_enabled: bool,
}

/// One batch of messages received on a stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamingPullResponse {
    /// Delivered messages.
    pub received_messages: Vec<ReceivedMessage>,
    /// Current subscription properties.
    pub subscription_properties: SubscriptionProperties,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_size_counts_all_fields() {
        let mut message = PubsubMessage::new("hello");
        message.message_id = "42".to_string();
        message.ordering_key = "k".to_string();
        message.attributes.insert("a".to_string(), "bc".to_string());
        assert_eq!(message.serialized_size(), 5 + 3 + 2 + 1);
    }

    #[test]
    fn test_delivery_attempt_attribute() {
        let mut message = PubsubMessage::new("x");
        assert_eq!(message.delivery_attempt(), None);

        message
            .attributes
            .insert(DELIVERY_ATTEMPT_ATTRIBUTE.to_string(), "3".to_string());
        assert_eq!(message.delivery_attempt(), Some(3));

        message
            .attributes
            .insert(DELIVERY_ATTEMPT_ATTRIBUTE.to_string(), "three".to_string());
        assert_eq!(message.delivery_attempt(), None);
    }

    #[test]
    fn test_metadata_hides_unknown_delivery_attempt() {
        let received = ReceivedMessage {
            ack_id: AckId::new("a"),
            message: PubsubMessage::new("x"),
            delivery_attempt: 0,
        };
        assert_eq!(DeliveryMetadata::from_received(&received).delivery_attempt, None);
    }
}
