//! Envelope metadata carried as Kafka record headers.

use chrono::{DateTime, Utc};
use loyalty_core::bus::BusError;
use loyalty_core::ids::TenantId;
use loyalty_core::message::Envelope;
use rdkafka::message::{Header, Headers, OwnedHeaders};
use uuid::Uuid;

/// `PascalCase` type tag.
pub const MESSAGE_TYPE: &str = "message-type";
/// Tenant id.
pub const TENANT_ID: &str = "tenant-id";
/// `commandId` / `eventId`.
pub const MESSAGE_ID: &str = "message-id";
/// Optional correlation id.
pub const CORRELATION_ID: &str = "correlation-id";
/// RFC 3339 creation time.
pub const CREATED_AT: &str = "created-at";
/// 1-based delivery attempt, incremented on every requeue.
pub const DELIVERY_ATTEMPT: &str = "delivery-attempt";
/// Reason recorded on dead-lettered records.
pub const DEAD_LETTER_REASON: &str = "dead-letter-reason";

/// Headers for publishing `envelope` as delivery `attempt`.
#[must_use]
pub fn encode(envelope: &Envelope, attempt: u32) -> OwnedHeaders {
    let tenant = envelope.tenant_id.to_string();
    let id = envelope.message_id.to_string();
    let created = envelope.created_at.to_rfc3339();
    let attempt = attempt.to_string();

    let headers = OwnedHeaders::new()
        .insert(header(MESSAGE_TYPE, &envelope.message_type))
        .insert(header(TENANT_ID, &tenant))
        .insert(header(MESSAGE_ID, &id))
        .insert(header(CREATED_AT, &created))
        .insert(header(DELIVERY_ATTEMPT, &attempt));

    match &envelope.correlation_id {
        Some(correlation) => headers.insert(header(CORRELATION_ID, correlation)),
        None => headers,
    }
}

/// Rebuild the envelope and delivery attempt of a received record.
///
/// # Errors
///
/// Returns [`BusError::MalformedDelivery`] when a mandatory header is
/// missing or unparsable, or the record has no payload.
pub fn decode(
    headers: Option<&OwnedHeaders>,
    payload: Option<&[u8]>,
) -> Result<(Envelope, u32), BusError> {
    let headers = headers.ok_or_else(|| malformed("record has no headers"))?;
    let payload = payload.ok_or_else(|| malformed("record has no payload"))?;

    let message_type = required(headers, MESSAGE_TYPE)?.to_string();
    let tenant_id: TenantId = required(headers, TENANT_ID)?
        .parse()
        .map_err(|_| malformed("invalid tenant-id"))?;
    let message_id: Uuid = required(headers, MESSAGE_ID)?
        .parse()
        .map_err(|_| malformed("invalid message-id"))?;
    let created_at = DateTime::parse_from_rfc3339(required(headers, CREATED_AT)?)
        .map_err(|_| malformed("invalid created-at"))?
        .with_timezone(&Utc);
    let attempt = match find(headers, DELIVERY_ATTEMPT) {
        Some(text) => text
            .parse::<u32>()
            .map_err(|_| malformed("invalid delivery-attempt"))?
            .max(1),
        None => 1,
    };

    Ok((
        Envelope {
            message_id,
            message_type,
            tenant_id,
            correlation_id: find(headers, CORRELATION_ID).map(str::to_string),
            created_at,
            payload: payload.to_vec(),
        },
        attempt,
    ))
}

fn header<'a>(key: &'a str, value: &'a str) -> Header<'a, &'a str> {
    Header {
        key,
        value: Some(value),
    }
}

fn find<'h>(headers: &'h OwnedHeaders, key: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|h| h.key == key)
        .and_then(|h| h.value)
        .and_then(|v| std::str::from_utf8(v).ok())
}

fn required<'h>(headers: &'h OwnedHeaders, key: &str) -> Result<&'h str, BusError> {
    find(headers, key).ok_or_else(|| malformed(&format!("missing {key} header")))
}

fn malformed(reason: &str) -> BusError {
    BusError::MalformedDelivery(reason.to_string())
}
