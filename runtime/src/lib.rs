//! # Loyalty Runtime
//!
//! Messaging runtime shared by the points and rewards services:
//!
//! - [`registry`]: typed command and event handlers, dispatch tables and
//!   outbox routes
//! - [`consumer`]: queue consumers with manual ack, requeue with backoff and
//!   dead-lettering
//! - [`outbox`]: the polling publisher that moves committed outbox rows to
//!   the broker
//! - [`retry`]: exponential backoff for requeues, outbox attempts and startup
//! - [`metrics`]: Prometheus recorders and the scrape endpoint
//! - [`lifecycle`]: task supervision and graceful shutdown
//!
//! ## Wiring
//!
//! ```ignore
//! let registry = CommandRegistry::new()
//!     .register::<DeductPointsCommand, _>(Arc::new(deduct_handler));
//!
//! let mut supervisor = Supervisor::new();
//! let consumer = Consumer::commands("points.commands", bus.clone(), Arc::new(registry), supervisor.subscribe());
//! supervisor.track("points.commands", consumer.spawn());
//!
//! let publisher = OutboxPublisher::new("points", outbox_store, Arc::new(routes), bus.clone(), bus, clock, ids);
//! supervisor.track("outbox", publisher.spawn(supervisor.subscribe()));
//!
//! supervisor.run_until_signal().await;
//! ```

pub mod consumer;
pub mod lifecycle;
pub mod metrics;
pub mod outbox;
pub mod registry;
pub mod retry;

pub use consumer::{Consumer, Settlement};
pub use lifecycle::{Supervisor, shutdown_signal};
pub use outbox::{OutboxConfig, OutboxPublisher, PublishReport};
pub use registry::{
    CommandHandler, CommandRegistry, DispatchError, EventHandler, EventRegistry, HandlerError,
    MessageRoutes, Route,
};
pub use retry::{RetryPolicy, retry_while};
