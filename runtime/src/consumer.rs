//! Queue consumers with manual acknowledgement and automatic reconnection.
//!
//! A [`Consumer`] owns one durable queue and runs the
//! subscribe-process-reconnect loop:
//!
//! ```text
//! loop {
//!     open stream (consume / subscribe)
//!         for each delivery:
//!             dispatch through the registry
//!             settle: ack | requeue | dead-letter
//!             (shutdown is checked between deliveries, never mid-handler)
//!     stream ended or failed: back off, reconnect
//! }
//! ```
//!
//! # Settlement
//!
//! | Outcome                         | Command queue       | Event queue          |
//! |---------------------------------|---------------------|----------------------|
//! | handler succeeded               | ack                 | ack                  |
//! | no handler for the type         | dead-letter         | ack (not ours)       |
//! | body failed to decode           | dead-letter         | dead-letter          |
//! | handler rejected it             | dead-letter         | dead-letter          |
//! | transient failure               | requeue after backoff, dead-letter at `max_deliveries` |
//!
//! Deliveries are processed one at a time, which is the prefetch-of-one
//! contract both bus implementations honour.

use crate::metrics::ConsumerMetrics;
use crate::registry::{CommandRegistry, DispatchError, EventRegistry, HandlerError};
use crate::retry::RetryPolicy;
use futures::StreamExt;
use loyalty_core::bus::{BusError, CommandBus, Delivery, DeliveryStream, EventBus, NackAction};
use loyalty_core::message::Envelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Default number of deliveries before a transiently failing message is
/// dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

enum Source {
    Commands {
        bus: Arc<dyn CommandBus>,
        registry: Arc<CommandRegistry>,
    },
    Events {
        bus: Arc<dyn EventBus>,
        registry: Arc<EventRegistry>,
        binding_keys: Vec<String>,
    },
}

impl Source {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Commands { .. } => "commands",
            Self::Events { .. } => "events",
        }
    }
}

/// How a processed delivery is settled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Positive acknowledgement.
    Ack,
    /// Redeliver after `delay`.
    Requeue {
        /// Backoff before the nack is sent.
        delay: Duration,
        /// Failure being retried.
        reason: String,
    },
    /// Remove from normal processing.
    DeadLetter {
        /// Why the message was parked.
        reason: String,
    },
}

/// Decide the settlement of one dispatch outcome.
///
/// `attempt` is the 1-based delivery attempt. `unhandled_is_ack` is true for
/// event queues, where a type without a local handler is simply not ours.
#[must_use]
pub fn settle(
    outcome: Result<(), DispatchError>,
    attempt: u32,
    max_deliveries: u32,
    backoff: &RetryPolicy,
    unhandled_is_ack: bool,
) -> Settlement {
    match outcome {
        Ok(()) => Settlement::Ack,
        Err(DispatchError::NoHandler(_)) if unhandled_is_ack => Settlement::Ack,
        Err(DispatchError::NoHandler(message_type)) => Settlement::DeadLetter {
            reason: format!("No handler registered for {message_type}"),
        },
        Err(DispatchError::Handler(err @ (HandlerError::Decode(_) | HandlerError::Rejected(_)))) => {
            Settlement::DeadLetter {
                reason: err.to_string(),
            }
        },
        Err(DispatchError::Handler(err @ HandlerError::Transient(_))) => {
            if attempt >= max_deliveries {
                Settlement::DeadLetter {
                    reason: format!("Gave up after {attempt} deliveries: {err}"),
                }
            } else {
                Settlement::Requeue {
                    delay: backoff.delay_for_attempt(attempt.saturating_sub(1)),
                    reason: err.to_string(),
                }
            }
        },
    }
}

/// Consumer of one durable queue.
///
/// Built with [`Consumer::commands`] or [`Consumer::events`], then started
/// with [`spawn`](Self::spawn). Runs until the shutdown broadcast fires.
pub struct Consumer {
    name: String,
    queue: String,
    source: Source,
    shutdown: broadcast::Receiver<()>,
    retry_delay: Duration,
    backoff: RetryPolicy,
    max_deliveries: u32,
}

impl Consumer {
    /// Consume a command queue.
    #[must_use]
    pub fn commands(
        queue: impl Into<String>,
        bus: Arc<dyn CommandBus>,
        registry: Arc<CommandRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let queue = queue.into();
        Self::new(queue, Source::Commands { bus, registry }, shutdown)
    }

    /// Bind an event queue to the registry's routing keys and consume it.
    #[must_use]
    pub fn events(
        queue: impl Into<String>,
        bus: Arc<dyn EventBus>,
        registry: Arc<EventRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let binding_keys = registry.binding_keys();
        Self::new(
            queue.into(),
            Source::Events {
                bus,
                registry,
                binding_keys,
            },
            shutdown,
        )
    }

    fn new(queue: String, source: Source, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            name: queue.clone(),
            queue,
            source,
            shutdown,
            retry_delay: Duration::from_secs(5),
            backoff: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(200))
                .max_delay(Duration::from_secs(10))
                .build(),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }

    /// Name used in logs (defaults to the queue name).
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Backoff applied before requeueing a transient failure.
    #[must_use]
    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Deliveries allowed before a transient failure is dead-lettered.
    #[must_use]
    pub const fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }

    /// Start the consume loop on a background task.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(consumer = %self.name, queue = %self.queue, kind = self.source.kind(), "Consumer started");

        loop {
            let opened = tokio::select! {
                _ = self.shutdown.recv() => break,
                opened = open(&self.source, &self.queue) => opened,
            };

            match opened {
                Ok(mut stream) => {
                    info!(consumer = %self.name, queue = %self.queue, "Consuming");
                    if self.process_stream(&mut stream).await {
                        break;
                    }
                    warn!(
                        consumer = %self.name,
                        retry_delay_ms = self.retry_delay.as_millis(),
                        "Delivery stream ended, reconnecting"
                    );
                },
                Err(e) => {
                    error!(
                        consumer = %self.name,
                        error = %e,
                        retry_delay_ms = self.retry_delay.as_millis(),
                        "Failed to open delivery stream, retrying"
                    );
                },
            }

            tokio::select! {
                _ = self.shutdown.recv() => break,
                () = tokio::time::sleep(self.retry_delay) => {},
            }
        }

        info!(consumer = %self.name, "Consumer stopped");
    }

    /// Returns true when shutdown was requested.
    async fn process_stream(&mut self, stream: &mut DeliveryStream) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Shutdown requested");
                    return true;
                }
                next = stream.next() => match next {
                    Some(Ok(delivery)) => self.process(delivery).await,
                    Some(Err(e)) => {
                        error!(consumer = %self.name, error = %e, "Error receiving delivery");
                    },
                    None => return false,
                },
            }
        }
    }

    async fn dispatch(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        match &self.source {
            Source::Commands { registry, .. } => registry.dispatch(envelope).await,
            Source::Events { registry, .. } => registry.dispatch(envelope).await,
        }
    }

    async fn process(&self, delivery: Delivery) {
        let message_type = delivery.envelope.message_type.clone();
        let message_id = delivery.envelope.message_id;
        let attempt = delivery.attempt;

        debug!(
            consumer = %self.name,
            message_type = %message_type,
            message_id = %message_id,
            attempt,
            "Processing delivery"
        );

        let outcome = self.dispatch(&delivery.envelope).await;
        let unhandled_is_ack = matches!(self.source, Source::Events { .. });
        let settlement = settle(
            outcome,
            attempt,
            self.max_deliveries,
            &self.backoff,
            unhandled_is_ack,
        );

        let result = match settlement {
            Settlement::Ack => {
                ConsumerMetrics::record_ack(&self.queue, &message_type);
                delivery.ack().await
            },
            Settlement::Requeue { delay, reason } => {
                warn!(
                    consumer = %self.name,
                    message_type = %message_type,
                    message_id = %message_id,
                    attempt,
                    delay_ms = delay.as_millis(),
                    reason = %reason,
                    "Transient failure, requeueing"
                );
                ConsumerMetrics::record_nack(&self.queue, "requeue");
                tokio::time::sleep(delay).await;
                delivery.nack(NackAction::Requeue, reason).await
            },
            Settlement::DeadLetter { reason } => {
                error!(
                    consumer = %self.name,
                    message_type = %message_type,
                    message_id = %message_id,
                    attempt,
                    reason = %reason,
                    "Dead-lettering delivery"
                );
                ConsumerMetrics::record_nack(&self.queue, "dead_letter");
                delivery.nack(NackAction::DeadLetter, reason).await
            },
        };

        if let Err(e) = result {
            error!(
                consumer = %self.name,
                message_id = %message_id,
                error = %e,
                "Failed to settle delivery"
            );
        }
    }
}

async fn open(source: &Source, queue: &str) -> Result<DeliveryStream, BusError> {
    match source {
        Source::Commands { bus, .. } => bus.consume(queue).await,
        Source::Events {
            bus, binding_keys, ..
        } => bus.subscribe(queue, binding_keys).await,
    }
}
