//! Transactional outbox: records and the dispatch port.
//!
//! An [`OutboxMessage`] is written by the domain transaction that produced
//! it (see [`LedgerTransaction::add_outbox`](crate::ledger::LedgerTransaction::add_outbox)
//! and [`RedemptionTransaction::add_outbox`](crate::redemption::RedemptionTransaction::add_outbox)).
//! After that only the publisher touches it, through an [`OutboxDispatch`].

use crate::ids::TenantId;
use crate::message::{Message, MessageError};
use crate::store::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One outbound message awaiting (or past) publication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxMessage {
    /// Outbox row id.
    pub id: Uuid,
    /// Type tag of the carried message (`PointsDeductedEvent`, ...).
    pub event_type: String,
    /// camelCase JSON body.
    pub payload: String,
    /// Tenant the message belongs to.
    pub tenant_id: TenantId,
    /// Correlation id of the carried message.
    pub correlation_id: Option<String>,
    /// Insertion time; publication order.
    pub created_at: DateTime<Utc>,
    /// Set once published (or dead-lettered).
    pub processed_at: Option<DateTime<Utc>>,
    /// Failed publication attempts so far.
    pub retry_count: u32,
    /// Error of the most recent failed attempt.
    pub last_error: Option<String>,
    /// Earliest time of the next attempt after a failure.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Serialize a typed message into a fresh, unprocessed outbox row.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Serialization`] if the body cannot be encoded.
    pub fn from_message<M: Message>(
        id: Uuid,
        message: &M,
        now: DateTime<Utc>,
    ) -> Result<Self, MessageError> {
        let payload = serde_json::to_string(message).map_err(|e| MessageError::Serialization {
            message_type: M::MESSAGE_TYPE.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            id,
            event_type: M::MESSAGE_TYPE.to_string(),
            payload,
            tenant_id: message.tenant_id(),
            correlation_id: message.correlation_id(),
            created_at: now,
            processed_at: None,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
        })
    }

    /// Whether the publisher should pick this row up at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.processed_at.is_none() && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Status of a dead-lettered outbox message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStatus {
    /// Awaiting operator attention.
    Pending,
    /// Requeued or otherwise handled.
    Resolved,
    /// Deliberately dropped.
    Discarded,
}

impl DeadLetterStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "resolved" => Some(Self::Resolved),
            "discarded" => Some(Self::Discarded),
            _ => None,
        }
    }
}

/// An outbox message that exhausted its retries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Dead letter id.
    pub id: Uuid,
    /// Original outbox row.
    pub outbox_message_id: Uuid,
    /// Type tag of the carried message.
    pub event_type: String,
    /// camelCase JSON body.
    pub payload: String,
    /// Tenant the message belongs to.
    pub tenant_id: TenantId,
    /// Final publication error.
    pub error_message: String,
    /// Attempts made before giving up.
    pub retry_count: u32,
    /// When the message was dead-lettered.
    pub failed_at: DateTime<Utc>,
    /// Operator workflow status.
    pub status: DeadLetterStatus,
}

impl DeadLetter {
    /// Dead letter for `message` failing with `error`.
    #[must_use]
    pub fn from_outbox(
        id: Uuid,
        message: &OutboxMessage,
        error: &str,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            outbox_message_id: message.id,
            event_type: message.event_type.clone(),
            payload: message.payload.clone(),
            tenant_id: message.tenant_id,
            error_message: error.to_string(),
            retry_count: message.retry_count + 1,
            failed_at,
            status: DeadLetterStatus::Pending,
        }
    }
}

/// Publisher-side access to a service's outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Try to take the dispatch lease.
    ///
    /// Returns `None` when another publisher holds it; the caller skips this
    /// tick. The lease is released when the dispatch commits or is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    async fn begin_dispatch(&self) -> Result<Option<Box<dyn OutboxDispatch>>, StoreError>;

    /// Number of unprocessed messages.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    async fn pending_count(&self) -> Result<u64, StoreError>;
}

/// One leased publisher tick.
#[async_trait]
pub trait OutboxDispatch: Send {
    /// Up to `limit` due messages, oldest first, locked for this dispatch.
    async fn fetch_pending(
        &mut self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Mark a message published.
    async fn mark_processed(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Increment `retry_count`, record `error`, schedule the next attempt.
    async fn record_failure(
        &mut self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Move a message to the dead-letter table and mark it processed.
    async fn dead_letter(&mut self, dead_letter: &DeadLetter) -> Result<(), StoreError>;

    /// Commit and release the lease.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::contracts::PointsEarnedEvent;
    use crate::ids::{LedgerEntryId, UserId};
    use chrono::Duration;

    fn earned() -> PointsEarnedEvent {
        PointsEarnedEvent {
            event_id: Uuid::new_v4(),
            tenant_id: TenantId::new(Uuid::new_v4()),
            customer_id: UserId::new(Uuid::new_v4()),
            points_amount: 10,
            reason: "Order #1".to_string(),
            transaction_id: LedgerEntryId::new(Uuid::new_v4()),
            reference_id: Some("1".to_string()),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn from_message_captures_type_and_tenant() {
        let event = earned();
        let now = Utc::now();
        let message = OutboxMessage::from_message(Uuid::new_v4(), &event, now).unwrap();

        assert_eq!(message.event_type, "PointsEarnedEvent");
        assert_eq!(message.tenant_id, event.tenant_id);
        assert_eq!(message.retry_count, 0);
        assert!(message.payload.contains("\"pointsAmount\":10"));
        assert!(message.is_due(now));
    }

    #[test]
    fn backoff_delays_due_time() {
        let now = Utc::now();
        let mut message = OutboxMessage::from_message(Uuid::new_v4(), &earned(), now).unwrap();
        message.next_attempt_at = Some(now + Duration::seconds(30));

        assert!(!message.is_due(now));
        assert!(message.is_due(now + Duration::seconds(30)));

        message.processed_at = Some(now);
        assert!(!message.is_due(now + Duration::hours(1)));
    }

    #[test]
    fn dead_letter_counts_final_attempt() {
        let now = Utc::now();
        let mut message = OutboxMessage::from_message(Uuid::new_v4(), &earned(), now).unwrap();
        message.retry_count = 9;
        let dead = DeadLetter::from_outbox(Uuid::new_v4(), &message, "broker down", now);

        assert_eq!(dead.retry_count, 10);
        assert_eq!(dead.outbox_message_id, message.id);
        assert_eq!(dead.status, DeadLetterStatus::Pending);
    }
}
