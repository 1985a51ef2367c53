//! Redpanda transport for the loyalty command and event buses.
//!
//! Implements [`CommandBus`] and [`EventBus`] from `loyalty-core` on top of
//! rdkafka, so it works against Redpanda or any Kafka-compatible broker.
//! See [`topics`] for how queues, exchanges and routing keys map to topics.
//!
//! # Delivery Semantics
//!
//! **At-least-once with one delivery in flight per consumer**:
//! - A record is handed out as a [`Delivery`]; the next record is not read
//!   until that delivery is settled
//! - `ack` commits the record's offset
//! - `nack(Requeue)` republishes the record to `<queue>.retry` with its
//!   `delivery-attempt` header incremented, then commits
//! - `nack(DeadLetter)` republishes it to `<queue>.dead-letter` with the
//!   reason, then commits
//! - Dropping a delivery unsettled counts as a requeue
//! - Records without the envelope headers are dead-lettered by the bus
//!
//! A record is committed only after its settlement succeeded. If the
//! republish behind a `nack` (or behind dead-lettering a malformed record)
//! fails, the partition is rewound to that record and it is delivered again;
//! no later record of the partition is read first. If the rewind itself
//! fails, the delivery stream ends and the next consumer resumes from the
//! last committed offset.
//!
//! If the process stops between reading and committing, the record is read
//! again by the next member of the consumer group.
//!
//! # Example
//!
//! ```no_run
//! use loyalty_redpanda::RedpandaBus;
//! use loyalty_core::bus::CommandBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaBus::builder()
//!     .brokers("localhost:9092")
//!     .exchange("loyalty.events")
//!     .build()?;
//!
//! let mut deliveries = bus.consume("points.commands").await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("Received: {}", delivery.envelope.message_type);
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod headers;
pub mod topics;

use loyalty_core::bus::{
    Acknowledger, BusError, CommandBus, Delivery, DeliveryStream, EventBus, NackAction,
};
use loyalty_core::message::Envelope;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Message, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Default exchange name events are published under.
pub const DEFAULT_EXCHANGE: &str = "loyalty.events";

/// Redpanda-backed command and event bus.
///
/// One producer is shared by every publish; each `consume`/`subscribe` call
/// creates its own consumer whose group id is the queue name.
///
/// # Example
///
/// ```no_run
/// use loyalty_redpanda::RedpandaBus;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaBus::new("localhost:9092")?;
///
/// let bus = RedpandaBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedpandaBus {
    producer: FutureProducer,
    brokers: String,
    exchange: String,
    timeout: Duration,
    auto_offset_reset: String,
    session_timeout: Duration,
}

impl RedpandaBus {
    /// Create a bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder for configuring the bus.
    #[must_use]
    pub fn builder() -> RedpandaBusBuilder {
        RedpandaBusBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Exchange events are published under.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    async fn produce(
        &self,
        topic: &str,
        envelope: &Envelope,
        headers: OwnedHeaders,
    ) -> Result<(), BusError> {
        produce(&self.producer, self.timeout, topic, envelope, headers).await
    }

    fn open(&self, queue: &str, topics: Vec<String>) -> Result<DeliveryStream, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", queue)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set(
                "session.timeout.ms",
                self.session_timeout.as_millis().to_string(),
            )
            .set("enable.partition.eof", "false")
            .set("allow.auto.create.topics", "true")
            .set("topic.metadata.refresh.interval.ms", "10000")
            .create()
            .map_err(|e| BusError::SubscriptionFailed {
                queue: queue.to_string(),
                reason: format!("Failed to create consumer: {e}"),
            })?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| BusError::SubscriptionFailed {
                queue: queue.to_string(),
                reason: format!("Failed to subscribe: {e}"),
            })?;

        tracing::info!(
            queue = %queue,
            topics = ?topics,
            auto_offset_reset = %self.auto_offset_reset,
            "Consuming queue"
        );

        // Capacity 1 plus the settlement handshake keeps a single record in flight.
        let (tx, rx) = mpsc::channel(1);
        let pump = Pump {
            consumer,
            producer: self.producer.clone(),
            timeout: self.timeout,
            queue: queue.to_string(),
            tx,
        };
        tokio::spawn(pump.run());

        let stream = async_stream::stream! {
            let mut rx = rx;
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Ok(Box::pin(stream))
    }
}

impl CommandBus for RedpandaBus {
    fn send<'a>(
        &'a self,
        queue: &'a str,
        envelope: &'a Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + 'a>> {
        Box::pin(async move {
            self.produce(queue, envelope, headers::encode(envelope, 1))
                .await
        })
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BusError>> + Send + 'a>> {
        Box::pin(async move {
            self.open(queue, vec![queue.to_string(), topics::retry_topic(queue)])
        })
    }
}

impl EventBus for RedpandaBus {
    fn publish<'a>(
        &'a self,
        envelope: &'a Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + 'a>> {
        Box::pin(async move {
            let topic = topics::event_topic(&self.exchange, &envelope.routing_key());
            self.produce(&topic, envelope, headers::encode(envelope, 1))
                .await
        })
    }

    fn subscribe<'a>(
        &'a self,
        queue: &'a str,
        binding_keys: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BusError>> + Send + 'a>> {
        Box::pin(async move {
            if binding_keys.is_empty() {
                return Err(BusError::SubscriptionFailed {
                    queue: queue.to_string(),
                    reason: "No binding keys".to_string(),
                });
            }
            let mut topics: Vec<String> = binding_keys
                .iter()
                .map(|key| topics::binding_pattern(&self.exchange, key))
                .collect();
            topics.push(topics::retry_topic(queue));
            self.open(queue, topics)
        })
    }
}

/// Builder for a [`RedpandaBus`].
#[derive(Default)]
pub struct RedpandaBusBuilder {
    brokers: Option<String>,
    exchange: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
}

impl RedpandaBusBuilder {
    /// Comma-separated bootstrap servers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Exchange (topic prefix) for events. Default: [`DEFAULT_EXCHANGE`].
    #[must_use]
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Producer acknowledgement mode: `"0"`, `"1"` or `"all"`. Default: `"all"`.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec. Default: `"none"`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout. Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Where a new consumer group starts reading. Default: `"earliest"`, so
    /// commands sent before the first consumer started are not skipped.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Consumer group session timeout. Default: 10 seconds.
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Build the [`RedpandaBus`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaBus, BusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .set("enable.idempotence", if acks == "all" { "true" } else { "false" })
            .set("compression.type", &compression)
            .create()
            .map_err(|e| BusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let bus = RedpandaBus {
            producer,
            brokers,
            exchange: self
                .exchange
                .unwrap_or_else(|| DEFAULT_EXCHANGE.to_string()),
            timeout,
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(10)),
        };

        tracing::info!(
            brokers = %bus.brokers,
            exchange = %bus.exchange,
            acks = %acks,
            compression = %compression,
            "RedpandaBus created"
        );
        Ok(bus)
    }
}

async fn produce(
    producer: &FutureProducer,
    timeout: Duration,
    topic: &str,
    envelope: &Envelope,
    headers: OwnedHeaders,
) -> Result<(), BusError> {
    let key = envelope.tenant_id.to_string();
    let record = FutureRecord::to(topic)
        .payload(&envelope.payload)
        .key(&key)
        .headers(headers);

    match producer.send(record, Timeout::After(timeout)).await {
        Ok((partition, offset)) => {
            tracing::debug!(
                topic = %topic,
                partition,
                offset,
                message_type = %envelope.message_type,
                message_id = %envelope.message_id,
                "Record produced"
            );
            Ok(())
        },
        Err((e, _)) => {
            tracing::error!(topic = %topic, error = %e, "Failed to produce record");
            Err(BusError::PublishFailed {
                destination: topic.to_string(),
                reason: e.to_string(),
            })
        },
    }
}

enum Verdict {
    Ack,
    Nack(NackAction, String),
}

struct SettleRequest {
    verdict: Verdict,
    reply: oneshot::Sender<Result<(), BusError>>,
}

struct KafkaAcker {
    settle: oneshot::Sender<SettleRequest>,
}

impl KafkaAcker {
    fn request(
        self,
        verdict: Verdict,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send>> {
        Box::pin(async move {
            let (reply, response) = oneshot::channel();
            self.settle
                .send(SettleRequest { verdict, reply })
                .map_err(|_| BusError::AckFailed("Consumer task stopped".to_string()))?;
            response
                .await
                .map_err(|_| BusError::AckFailed("Consumer task stopped".to_string()))?
        })
    }
}

impl Acknowledger for KafkaAcker {
    fn ack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send>> {
        self.request(Verdict::Ack)
    }

    fn nack(
        self: Box<Self>,
        action: NackAction,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send>> {
        self.request(Verdict::Nack(action, reason))
    }
}

/// Pause before redelivering a record whose settlement failed.
const REWIND_PAUSE: Duration = Duration::from_millis(500);

/// Owns one consumer and feeds its records to a delivery stream.
struct Pump {
    consumer: StreamConsumer,
    producer: FutureProducer,
    timeout: Duration,
    queue: String,
    tx: mpsc::Sender<Result<Delivery, BusError>>,
}

impl Pump {
    async fn run(self) {
        loop {
            let record = match self.consumer.recv().await {
                Ok(message) => message.detach(),
                Err(e) => {
                    let err = BusError::TransportError(format!("Failed to receive record: {e}"));
                    if self.tx.send(Err(err)).await.is_err() {
                        break;
                    }
                    continue;
                },
            };

            if !self.handle(&record).await {
                break;
            }
        }
        tracing::debug!(queue = %self.queue, "Consumer task exiting");
    }

    /// Returns `false` once the delivery stream is gone.
    async fn handle(&self, record: &OwnedMessage) -> bool {
        let (envelope, attempt) = match headers::decode(record.headers(), record.payload()) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(
                    queue = %self.queue,
                    topic = record.topic(),
                    offset = record.offset(),
                    error = %e,
                    "Dead-lettering malformed record"
                );
                return match self.forward_raw(record, &e.to_string()).await {
                    Ok(()) => {
                        self.commit(record);
                        true
                    },
                    Err(e) => self.rewind(record, &e).await,
                };
            },
        };

        let (settle, settled) = oneshot::channel();
        let delivery = Delivery::new(
            envelope.clone(),
            attempt,
            Box::new(KafkaAcker { settle }),
        );
        if self.tx.send(Ok(delivery)).await.is_err() {
            // Uncommitted: the group redelivers it.
            return false;
        }

        let (verdict, reply) = match settled.await {
            Ok(SettleRequest { verdict, reply }) => (verdict, Some(reply)),
            Err(_) => (
                Verdict::Nack(NackAction::Requeue, "Delivery dropped".to_string()),
                None,
            ),
        };

        let result = self.settle(&envelope, attempt, verdict).await;
        let resume = match &result {
            Ok(()) => {
                self.commit(record);
                true
            },
            Err(e) => self.rewind(record, e).await,
        };
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
        resume
    }

    /// Seek back to an unsettled record so it is the next one read.
    ///
    /// Returns `false` if the seek failed; the pump must then stop so that no
    /// later offset of the partition gets committed past the record.
    async fn rewind(&self, record: &OwnedMessage, cause: &BusError) -> bool {
        tracing::warn!(
            queue = %self.queue,
            topic = record.topic(),
            partition = record.partition(),
            offset = record.offset(),
            error = %cause,
            "Settlement failed, redelivering record"
        );
        let sought = self.consumer.seek(
            record.topic(),
            record.partition(),
            Offset::Offset(record.offset()),
            self.timeout,
        );
        match sought {
            Ok(()) => {
                tokio::time::sleep(REWIND_PAUSE).await;
                true
            },
            Err(e) => {
                tracing::error!(
                    queue = %self.queue,
                    topic = record.topic(),
                    partition = record.partition(),
                    offset = record.offset(),
                    error = %e,
                    "Failed to rewind partition, closing delivery stream"
                );
                false
            },
        }
    }

    async fn settle(
        &self,
        envelope: &Envelope,
        attempt: u32,
        verdict: Verdict,
    ) -> Result<(), BusError> {
        match verdict {
            Verdict::Ack => {},
            Verdict::Nack(NackAction::Requeue, reason) => {
                tracing::debug!(
                    queue = %self.queue,
                    message_id = %envelope.message_id,
                    attempt,
                    reason = %reason,
                    "Requeueing delivery"
                );
                produce(
                    &self.producer,
                    self.timeout,
                    &topics::retry_topic(&self.queue),
                    envelope,
                    headers::encode(envelope, attempt.saturating_add(1)),
                )
                .await?;
            },
            Verdict::Nack(NackAction::DeadLetter, reason) => {
                let headers = headers::encode(envelope, attempt).insert(Header {
                    key: headers::DEAD_LETTER_REASON,
                    value: Some(reason.as_str()),
                });
                produce(
                    &self.producer,
                    self.timeout,
                    &topics::dead_letter_topic(&self.queue),
                    envelope,
                    headers,
                )
                .await?;
            },
        }
        Ok(())
    }

    async fn forward_raw(&self, record: &OwnedMessage, reason: &str) -> Result<(), BusError> {
        let headers = record
            .headers()
            .map_or_else(OwnedHeaders::new, Clone::clone)
            .insert(Header {
                key: headers::DEAD_LETTER_REASON,
                value: Some(reason),
            });
        let topic = topics::dead_letter_topic(&self.queue);
        let mut out = FutureRecord::<[u8], [u8]>::to(&topic).headers(headers);
        if let Some(payload) = record.payload() {
            out = out.payload(payload);
        }
        if let Some(key) = record.key() {
            out = out.key(key);
        }
        self.producer
            .send(out, Timeout::After(self.timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| BusError::PublishFailed {
                destination: topic.clone(),
                reason: e.to_string(),
            })
    }

    fn commit(&self, record: &OwnedMessage) {
        let mut offsets = TopicPartitionList::new();
        let added = offsets.add_partition_offset(
            record.topic(),
            record.partition(),
            Offset::Offset(record.offset() + 1),
        );
        let committed = added.and_then(|()| self.consumer.commit(&offsets, CommitMode::Async));
        if let Err(e) = committed {
            tracing::warn!(
                queue = %self.queue,
                topic = record.topic(),
                partition = record.partition(),
                offset = record.offset(),
                error = %e,
                "Failed to commit offset (record may be redelivered)"
            );
        }
    }
}
