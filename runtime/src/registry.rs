//! Handler registries and outbox routes.
//!
//! Dispatch is table-driven and built once at startup:
//!
//! - a [`CommandRegistry`] maps command type tags to one [`CommandHandler`]
//! - an [`EventRegistry`] maps event type tags to one [`EventHandler`] and
//!   knows the binding keys its queue needs
//! - a [`MessageRoutes`] table tells the outbox publisher whether a stored
//!   type tag is sent to a command queue or published as an event
//!
//! Commands and events live in separate tables so a command can never be
//! dispatched to an event handler or the other way round.

use async_trait::async_trait;
use loyalty_core::message::{
    Envelope, IntegrationCommand, IntegrationEvent, Message, MessageError,
};
use loyalty_core::outbox::OutboxMessage;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a message handler.
///
/// The variant decides how the consumer settles the delivery.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The body could not be decoded into the registered type.
    #[error(transparent)]
    Decode(#[from] MessageError),

    /// Worth another attempt (lost race, dropped connection).
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Will fail the same way on every attempt.
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl HandlerError {
    /// Build a [`HandlerError::Transient`].
    pub fn transient(reason: impl fmt::Display) -> Self {
        Self::Transient(reason.to_string())
    }

    /// Build a [`HandlerError::Rejected`].
    pub fn rejected(reason: impl fmt::Display) -> Self {
        Self::Rejected(reason.to_string())
    }

    /// Whether redelivery could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Outcome of routing one envelope through a registry.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Nothing is registered for this type tag.
    #[error("No handler registered for {0}")]
    NoHandler(String),

    /// The handler ran and failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Handles one command type.
#[async_trait]
pub trait CommandHandler<C: IntegrationCommand>: Send + Sync + 'static {
    /// Process the command. Must be idempotent under redelivery.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] classifying the failure.
    async fn handle(&self, command: C) -> Result<(), HandlerError>;
}

/// Handles one event type.
#[async_trait]
pub trait EventHandler<E: IntegrationEvent>: Send + Sync + 'static {
    /// Process the event. Must be idempotent under redelivery.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] classifying the failure.
    async fn handle(&self, event: E) -> Result<(), HandlerError>;
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn dispatch(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

struct CommandAdapter<C, H> {
    handler: Arc<H>,
    _command: PhantomData<fn() -> C>,
}

#[async_trait]
impl<C, H> ErasedHandler for CommandAdapter<C, H>
where
    C: IntegrationCommand,
    H: CommandHandler<C>,
{
    async fn dispatch(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let command: C = envelope.decode()?;
        self.handler.handle(command).await
    }
}

struct EventAdapter<E, H> {
    handler: Arc<H>,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> ErasedHandler for EventAdapter<E, H>
where
    E: IntegrationEvent,
    H: EventHandler<E>,
{
    async fn dispatch(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let event: E = envelope.decode()?;
        self.handler.handle(event).await
    }
}

/// Command type tag → handler.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl CommandRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `C`, replacing any earlier one.
    #[must_use]
    pub fn register<C, H>(mut self, handler: Arc<H>) -> Self
    where
        C: IntegrationCommand,
        H: CommandHandler<C>,
    {
        let adapter = CommandAdapter::<C, H> {
            handler,
            _command: PhantomData,
        };
        if self.handlers.insert(C::MESSAGE_TYPE, Arc::new(adapter)).is_some() {
            tracing::warn!(message_type = C::MESSAGE_TYPE, "Replacing command handler");
        }
        self
    }

    /// Registered type tags.
    #[must_use]
    pub fn message_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Decode `envelope` and run its handler.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NoHandler`] for an unregistered type, or the
    /// handler's failure.
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        let handler = self
            .handlers
            .get(envelope.message_type.as_str())
            .ok_or_else(|| DispatchError::NoHandler(envelope.message_type.clone()))?;
        handler.dispatch(envelope).await?;
        Ok(())
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("message_types", &self.message_types())
            .finish()
    }
}

/// Event type tag → handler.
#[derive(Default)]
pub struct EventRegistry {
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl EventRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `E`, replacing any earlier one.
    #[must_use]
    pub fn register<E, H>(mut self, handler: Arc<H>) -> Self
    where
        E: IntegrationEvent,
        H: EventHandler<E>,
    {
        let adapter = EventAdapter::<E, H> {
            handler,
            _event: PhantomData,
        };
        if self.handlers.insert(E::MESSAGE_TYPE, Arc::new(adapter)).is_some() {
            tracing::warn!(message_type = E::MESSAGE_TYPE, "Replacing event handler");
        }
        self
    }

    /// Registered type tags.
    #[must_use]
    pub fn message_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Routing keys the consuming queue must be bound with.
    #[must_use]
    pub fn binding_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .handlers
            .keys()
            .map(|message_type| loyalty_core::message::routing_key(message_type))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// Decode `envelope` and run its handler.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NoHandler`] for an unregistered type, or the
    /// handler's failure.
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        let handler = self
            .handlers
            .get(envelope.message_type.as_str())
            .ok_or_else(|| DispatchError::NoHandler(envelope.message_type.clone()))?;
        handler.dispatch(envelope).await?;
        Ok(())
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("message_types", &self.message_types())
            .finish()
    }
}

/// Where the outbox publisher sends a stored message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Point-to-point to a named queue.
    Command {
        /// Destination queue.
        queue: String,
    },
    /// Topic-routed to the exchange.
    Event {
        /// Routing key derived from the type tag.
        routing_key: String,
    },
}

type Encoder = fn(&OutboxMessage) -> Result<Envelope, MessageError>;

/// Stored type tag → route and typed re-encoding.
///
/// Resolving re-parses the stored payload into its concrete type, so a row
/// whose body no longer matches its contract fails here instead of reaching
/// the broker.
#[derive(Default)]
pub struct MessageRoutes {
    routes: HashMap<&'static str, (Route, Encoder)>,
}

impl MessageRoutes {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `E` as an event under its routing key.
    #[must_use]
    pub fn event<E: IntegrationEvent>(mut self) -> Self {
        let route = Route::Event {
            routing_key: E::routing_key(),
        };
        self.routes
            .insert(E::MESSAGE_TYPE, (route, encode::<E> as Encoder));
        self
    }

    /// Send `C` to `queue`.
    #[must_use]
    pub fn command<C: IntegrationCommand>(mut self, queue: impl Into<String>) -> Self {
        let route = Route::Command {
            queue: queue.into(),
        };
        self.routes
            .insert(C::MESSAGE_TYPE, (route, encode::<C> as Encoder));
        self
    }

    /// Resolve a stored row to its route and broker envelope.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::UnknownType`] for an unrouted type tag, or
    /// [`MessageError::Deserialization`] if the payload does not parse.
    pub fn resolve(&self, message: &OutboxMessage) -> Result<(Route, Envelope), MessageError> {
        let (route, encoder) = self
            .routes
            .get(message.event_type.as_str())
            .ok_or_else(|| MessageError::UnknownType(message.event_type.clone()))?;
        let envelope = encoder(message)?;
        Ok((route.clone(), envelope))
    }
}

impl fmt::Debug for MessageRoutes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.routes.iter().map(|(k, (route, _))| (k, route)))
            .finish()
    }
}

fn encode<M: Message>(message: &OutboxMessage) -> Result<Envelope, MessageError> {
    let typed: M =
        serde_json::from_str(&message.payload).map_err(|e| MessageError::Deserialization {
            message_type: message.event_type.clone(),
            reason: e.to_string(),
        })?;
    Envelope::from_message(&typed)
}
