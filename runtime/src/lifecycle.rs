//! Process lifecycle: background tasks, signals and graceful shutdown.
//!
//! Both services run the same shape of process:
//!
//! 1. build stores, buses and registries
//! 2. spawn consumers, the outbox publisher and any sweeps into a [`Supervisor`]
//! 3. wait for Ctrl+C or SIGTERM
//! 4. broadcast shutdown, then give each task a bounded time to finish the
//!    delivery or batch it is working on

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Default time each task gets to stop after shutdown is broadcast.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Named background tasks sharing one shutdown broadcast.
pub struct Supervisor {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<(String, JoinHandle<()>)>,
    timeout: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// Create a supervisor with no tasks.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
            timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Per-task stop timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// A receiver for a task about to be spawned.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Track a spawned task.
    pub fn track(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.tasks.push((name.into(), handle));
    }

    /// Number of tracked tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Block until a termination signal arrives, then shut down.
    pub async fn run_until_signal(self) {
        info!(tasks = self.tasks.len(), "Service running");
        shutdown_signal().await;
        self.shutdown().await;
    }

    /// Broadcast shutdown and wait for every task.
    pub async fn shutdown(self) {
        info!("Initiating graceful shutdown");
        // No receivers left only means every task already stopped.
        let _ = self.shutdown_tx.send(());

        for (name, handle) in self.tasks {
            match tokio::time::timeout(self.timeout, handle).await {
                Ok(Ok(())) => info!(task = %name, "Task stopped gracefully"),
                Ok(Err(e)) => warn!(task = %name, error = %e, "Task failed"),
                Err(_) => warn!(task = %name, "Task shutdown timed out"),
            }
        }

        info!("Graceful shutdown complete");
    }
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM.
///
/// If a handler cannot be installed the failure is logged and that signal is
/// ignored; the other one still works.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}
