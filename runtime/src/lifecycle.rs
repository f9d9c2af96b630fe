//! Process lifecycle: the shared shutdown signal.
//!
//! Every long-running task in a service (HTTP server, subscriptions, outbox
//! relay) holds a [`Shutdown`] handle cloned from the same
//! [`ShutdownTrigger`]. Firing the trigger, from an OS signal or an
//! internal failure, stops all of them.
//!
//! ```text
//!   SIGINT / SIGTERM ──► ShutdownTrigger::trigger()
//!                               │
//!            ┌──────────────────┼───────────────────┐
//!            ▼                  ▼                   ▼
//!       HTTP server      Subscription(s)      Outbox relay
//!    (grace period)        (drain)             (finish batch)
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Sending half of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Signal shutdown to every [`Shutdown`] handle.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Another handle observing this trigger.
    #[must_use]
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }
}

/// Receiving half of the shutdown signal.
///
/// Dropping the [`ShutdownTrigger`] counts as a shutdown request.
#[derive(Clone, Debug)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl Shutdown {
    /// A handle that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once shutdown is requested.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

/// Create a connected trigger and handle.
#[must_use]
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownTrigger { tx },
        Shutdown {
            rx,
            _keepalive: None,
        },
    )
}

/// Resolve on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        () = ctrl_c => info!("Received Ctrl+C, starting graceful shutdown"),
        () = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}

/// Await `handles`, giving each at most `timeout`.
pub async fn await_tasks<T, I>(name: &str, handles: I, timeout: Duration)
where
    I: IntoIterator<Item = T>,
    T: Future<Output = Result<(), tokio::task::JoinError>>,
{
    for (idx, handle) in handles.into_iter().enumerate() {
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => info!(task = name, idx, "Task stopped gracefully"),
            Ok(Err(e)) => warn!(task = name, idx, error = %e, "Task failed"),
            Err(_) => warn!(task = name, idx, "Task shutdown timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_reaches_every_handle() {
        let (trigger, mut first) = shutdown_channel();
        let mut second = trigger.subscribe();

        assert!(!first.is_triggered());
        trigger.trigger();

        first.wait().await;
        second.wait().await;
        assert!(second.is_triggered());
    }

    #[tokio::test]
    async fn dropping_trigger_counts_as_shutdown() {
        let (trigger, mut shutdown) = shutdown_channel();
        drop(trigger);

        shutdown.wait().await;
        assert!(shutdown.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn never_does_not_fire() {
        let mut shutdown = Shutdown::never();
        let waited = tokio::time::timeout(Duration::from_secs(60), shutdown.wait()).await;
        assert!(waited.is_err());
    }
}
