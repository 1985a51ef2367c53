//! In-memory broker implementing both [`CommandBus`] and [`EventBus`].
//!
//! Semantics follow a topic-exchange broker with durable queues:
//!
//! - a queue exists from the first `send`/`consume`/`subscribe` naming it and
//!   buffers messages while no consumer is attached;
//! - an event published before any queue is bound to its routing key is dropped;
//! - each queue has at most one active consumer;
//! - `nack(Requeue)` and dropping an unsettled delivery put the message back
//!   with an incremented attempt counter; `nack(DeadLetter)` moves it to the
//!   dead-letter list.
//!
//! Every settlement is recorded so tests can assert on acks and nacks.

use futures::Stream;
use loyalty_core::bus::{
    Acknowledger, BusError, CommandBus, Delivery, DeliveryStream, EventBus, NackAction,
};
use loyalty_core::message::{Envelope, binding_matches};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// A message that was dead-lettered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLettered {
    /// Queue the message was consumed from.
    pub queue: String,
    /// The message.
    pub envelope: Envelope,
    /// Reason given with the nack.
    pub reason: String,
}

#[derive(Default)]
struct Queue {
    messages: VecDeque<(Envelope, u32)>,
    notify: Arc<Notify>,
    consumer_active: bool,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    bindings: Vec<(String, String)>,
    sent: Vec<(String, Envelope)>,
    published: Vec<Envelope>,
    acked: Vec<Envelope>,
    requeued: Vec<Envelope>,
    dead_lettered: Vec<DeadLettered>,
    failing_publishes: u32,
}

impl BrokerState {
    fn enqueue(&mut self, queue: &str, envelope: Envelope, attempt: u32) {
        let queue = self.queues.entry(queue.to_string()).or_default();
        queue.messages.push_back((envelope, attempt));
        queue.notify.notify_one();
    }

    fn take_injected_failure(&mut self, destination: &str) -> Result<(), BusError> {
        if self.failing_publishes == 0 {
            return Ok(());
        }
        self.failing_publishes -= 1;
        Err(BusError::PublishFailed {
            destination: destination.to_string(),
            reason: "injected broker failure".to_string(),
        })
    }
}

/// In-memory broker shared by every service in a test.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `n` sends/publishes with [`BusError::PublishFailed`].
    pub fn fail_next_publishes(&self, n: u32) {
        self.state().failing_publishes = n;
    }

    /// Put a raw envelope on a queue, bypassing routing.
    pub fn deliver_raw(&self, queue: &str, envelope: Envelope) {
        self.state().enqueue(queue, envelope, 1);
    }

    /// Commands sent so far, with their queue.
    #[must_use]
    pub fn sent(&self) -> Vec<(String, Envelope)> {
        self.state().sent.clone()
    }

    /// Events published so far.
    #[must_use]
    pub fn published(&self) -> Vec<Envelope> {
        self.state().published.clone()
    }

    /// Acknowledged deliveries.
    #[must_use]
    pub fn acked(&self) -> Vec<Envelope> {
        self.state().acked.clone()
    }

    /// Deliveries that were requeued (nack or dropped).
    #[must_use]
    pub fn requeued(&self) -> Vec<Envelope> {
        self.state().requeued.clone()
    }

    /// Dead-lettered deliveries.
    #[must_use]
    pub fn dead_lettered(&self) -> Vec<DeadLettered> {
        self.state().dead_lettered.clone()
    }

    /// Messages waiting in a queue.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.messages.len())
    }

    /// Whether a consumer is attached to `queue`.
    #[must_use]
    pub fn has_consumer(&self, queue: &str) -> bool {
        self.state()
            .queues
            .get(queue)
            .is_some_and(|q| q.consumer_active)
    }

    fn open_consumer(&self, queue: &str) -> Result<DeliveryStream, BusError> {
        let notify = {
            let mut state = self.state();
            let entry = state.queues.entry(queue.to_string()).or_default();
            if entry.consumer_active {
                return Err(BusError::SubscriptionFailed {
                    queue: queue.to_string(),
                    reason: "queue already has an active consumer".to_string(),
                });
            }
            entry.consumer_active = true;
            Arc::clone(&entry.notify)
        };

        let broker = self.clone();
        let queue = queue.to_string();
        let active = ActiveConsumer {
            broker: broker.clone(),
            queue: queue.clone(),
        };
        let stream = async_stream::stream! {
            let _active = active;
            loop {
                let next = broker
                    .state()
                    .queues
                    .get_mut(&queue)
                    .and_then(|q| q.messages.pop_front());
                match next {
                    Some((envelope, attempt)) => {
                        tracing::trace!(queue = %queue, message_type = %envelope.message_type, attempt, "Delivering message");
                        let acker = MemoryAcker {
                            broker: broker.clone(),
                            queue: queue.clone(),
                            envelope: Some(envelope.clone()),
                            attempt,
                        };
                        yield Ok(Delivery::new(envelope, attempt, Box::new(acker)));
                    }
                    None => notify.notified().await,
                }
            }
        };
        Ok(boxed(stream))
    }
}

fn boxed(
    stream: impl Stream<Item = Result<Delivery, BusError>> + Send + 'static,
) -> DeliveryStream {
    Box::pin(stream)
}

/// Clears the queue's active-consumer flag when the stream is dropped.
struct ActiveConsumer {
    broker: InMemoryBroker,
    queue: String,
}

impl Drop for ActiveConsumer {
    fn drop(&mut self) {
        if let Some(queue) = self.broker.state().queues.get_mut(&self.queue) {
            queue.consumer_active = false;
        }
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    envelope: Option<Envelope>,
    attempt: u32,
}

impl MemoryAcker {
    fn settle(&mut self, outcome: Option<(NackAction, String)>) {
        let Some(envelope) = self.envelope.take() else {
            return;
        };
        let mut state = self.broker.state();
        match outcome {
            None => state.acked.push(envelope),
            Some((NackAction::Requeue, _)) => {
                state.requeued.push(envelope.clone());
                state.enqueue(&self.queue, envelope, self.attempt + 1);
            },
            Some((NackAction::DeadLetter, reason)) => state.dead_lettered.push(DeadLettered {
                queue: self.queue.clone(),
                envelope,
                reason,
            }),
        }
    }
}

impl Acknowledger for MemoryAcker {
    fn ack(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send>> {
        self.settle(None);
        Box::pin(async { Ok(()) })
    }

    fn nack(
        mut self: Box<Self>,
        action: NackAction,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send>> {
        self.settle(Some((action, reason)));
        Box::pin(async { Ok(()) })
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        self.settle(Some((NackAction::Requeue, "delivery dropped".to_string())));
    }
}

impl CommandBus for InMemoryBroker {
    fn send<'a>(
        &'a self,
        queue: &'a str,
        envelope: &'a Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state();
            state.take_injected_failure(queue)?;
            state.sent.push((queue.to_string(), envelope.clone()));
            state.enqueue(queue, envelope.clone(), 1);
            Ok(())
        })
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BusError>> + Send + 'a>> {
        Box::pin(async move { self.open_consumer(queue) })
    }
}

impl EventBus for InMemoryBroker {
    fn publish<'a>(
        &'a self,
        envelope: &'a Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + 'a>> {
        Box::pin(async move {
            let routing_key = envelope.routing_key();
            let mut state = self.state();
            state.take_injected_failure(&routing_key)?;
            state.published.push(envelope.clone());

            let mut targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|(_, key)| binding_matches(key, &routing_key))
                .map(|(queue, _)| queue.clone())
                .collect();
            targets.dedup();
            for queue in targets {
                state.enqueue(&queue, envelope.clone(), 1);
            }
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        queue: &'a str,
        binding_keys: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BusError>> + Send + 'a>> {
        Box::pin(async move {
            {
                let mut state = self.state();
                for key in binding_keys {
                    let binding = (queue.to_string(), key.clone());
                    if !state.bindings.contains(&binding) {
                        state.bindings.push(binding);
                    }
                }
                state.bindings.sort();
            }
            self.open_consumer(queue)
        })
    }
}
