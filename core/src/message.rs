//! Integration messages, the wire envelope and topic routing.
//!
//! Two kinds of message cross the service boundary:
//!
//! - **Commands** ([`IntegrationCommand`]) are point-to-point: sent to one
//!   named queue, handled by exactly one consumer group.
//! - **Events** ([`IntegrationEvent`]) are topic-routed: published to an
//!   exchange and fanned out to every queue bound with a matching key.
//!
//! Both travel as an [`Envelope`]: broker metadata plus a camelCase JSON body.
//! Dispatch on the receiving side is by [`Envelope::message_type`], the
//! PascalCase type name of the message (`PointsDeductedEvent`).
//!
//! # Routing keys
//!
//! An event's routing key is derived from its type name: drop the trailing
//! `Event`, split on PascalCase word boundaries, lowercase, join with dots.
//!
//! ```
//! use loyalty_core::message::routing_key;
//!
//! assert_eq!(routing_key("PointsDeductedEvent"), "points.deducted");
//! assert_eq!(routing_key("PointsDeductionFailedEvent"), "points.deduction.failed");
//! assert_eq!(routing_key("OrderPlacedEvent"), "order.placed");
//! ```

use crate::ids::TenantId;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while encoding or decoding messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Failed to serialize a message body.
    #[error("Failed to serialize {message_type}: {reason}")]
    Serialization {
        /// Declared type of the message
        message_type: String,
        /// Underlying serde error
        reason: String,
    },

    /// Failed to deserialize a message body.
    #[error("Failed to deserialize {message_type}: {reason}")]
    Deserialization {
        /// Declared type of the message
        message_type: String,
        /// Underlying serde error
        reason: String,
    },

    /// The envelope declares a different type than the one requested.
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Type the caller asked for
        expected: String,
        /// Type carried by the envelope
        actual: String,
    },

    /// No route or handler is registered for this type tag.
    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

/// A message that crosses the service boundary.
///
/// `MESSAGE_TYPE` is the stable PascalCase type tag stored in the outbox and
/// carried in the envelope; it must never change once messages are in flight.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type tag used for dispatch.
    const MESSAGE_TYPE: &'static str;

    /// Unique id of this message instance (`commandId` / `eventId`).
    fn message_id(&self) -> Uuid;

    /// Tenant the message belongs to.
    fn tenant_id(&self) -> TenantId;

    /// When the message was created.
    fn created_at(&self) -> DateTime<Utc>;

    /// Correlation id carried in metadata, if any.
    fn correlation_id(&self) -> Option<String> {
        None
    }
}

/// A point-to-point command.
pub trait IntegrationCommand: Message {}

/// A topic-routed event.
pub trait IntegrationEvent: Message {
    /// Routing key derived from [`Message::MESSAGE_TYPE`].
    #[must_use]
    fn routing_key() -> String {
        routing_key(Self::MESSAGE_TYPE)
    }
}

/// Derive the topic routing key of an event type name.
#[must_use]
pub fn routing_key(message_type: &str) -> String {
    let name = message_type.strip_suffix("Event").unwrap_or(message_type);
    let mut key = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                key.push('.');
            }
            key.extend(ch.to_lowercase());
        } else {
            key.push(ch);
        }
    }
    key
}

/// Topic-exchange matching of a routing key against a binding key.
///
/// Both keys are dot-separated words. In the binding key `*` matches exactly
/// one word and `#` matches zero or more words.
///
/// ```
/// use loyalty_core::message::binding_matches;
///
/// assert!(binding_matches("points.*", "points.deducted"));
/// assert!(binding_matches("points.#", "points.deduction.failed"));
/// assert!(!binding_matches("points.*", "points.deduction.failed"));
/// ```
#[must_use]
pub fn binding_matches(binding_key: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = binding_key.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &words)
}

fn match_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| match_words(rest, &words[skip..])),
        Some((&head, rest)) => match words.split_first() {
            Some((&word, remaining)) if head == "*" || head == word => {
                match_words(rest, remaining)
            },
            _ => false,
        },
    }
}

/// A message as it travels through the broker.
///
/// The metadata fields map to broker headers; `payload` is the JSON body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// `commandId` / `eventId` of the carried message.
    pub message_id: Uuid,
    /// Declared type tag.
    pub message_type: String,
    /// Tenant the message belongs to.
    pub tenant_id: TenantId,
    /// Correlation id, if any.
    pub correlation_id: Option<String>,
    /// Creation time of the carried message.
    pub created_at: DateTime<Utc>,
    /// camelCase JSON body.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wrap a typed message.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Serialization`] if the body cannot be encoded.
    pub fn from_message<M: Message>(message: &M) -> Result<Self, MessageError> {
        let payload = serde_json::to_vec(message).map_err(|e| MessageError::Serialization {
            message_type: M::MESSAGE_TYPE.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            message_id: message.message_id(),
            message_type: M::MESSAGE_TYPE.to_string(),
            tenant_id: message.tenant_id(),
            correlation_id: message.correlation_id(),
            created_at: message.created_at(),
            payload,
        })
    }

    /// Decode the body as `M`.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::TypeMismatch`] if the envelope carries another
    /// type, or [`MessageError::Deserialization`] if the body is malformed.
    pub fn decode<M: Message>(&self) -> Result<M, MessageError> {
        if self.message_type != M::MESSAGE_TYPE {
            return Err(MessageError::TypeMismatch {
                expected: M::MESSAGE_TYPE.to_string(),
                actual: self.message_type.clone(),
            });
        }
        serde_json::from_slice(&self.payload).map_err(|e| MessageError::Deserialization {
            message_type: self.message_type.clone(),
            reason: e.to_string(),
        })
    }

    /// Routing key for this envelope when published as an event.
    #[must_use]
    pub fn routing_key(&self) -> String {
        routing_key(&self.message_type)
    }
}
