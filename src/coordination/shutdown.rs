//! Cooperative shutdown.
//!
//! Trading loops never get aborted mid-cycle: they watch a shared flag and
//! stop at the next sleep boundary, so every placed order is followed by a
//! reconcile before the task exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Why the process is stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM / SIGINT
    Graceful,
    /// Requested from inside the process (e.g. paper history exhausted)
    Internal,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Internal => write!(f, "internal"),
        }
    }
}

/// Cloneable shutdown handle shared by every trading task
#[derive(Clone)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    tx: Arc<watch::Sender<Option<ShutdownSignal>>>,
    rx: watch::Receiver<Option<ShutdownSignal>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Ask every task to stop. Only the first request is recorded.
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.requested.swap(true, Ordering::SeqCst) {
            warn!(%signal, "shutdown already requested, ignoring duplicate signal");
            return;
        }
        info!(%signal, "shutdown requested");
        self.tx.send_replace(Some(signal));
    }

    /// Resolve once shutdown has been requested
    pub async fn wait(&self) -> ShutdownSignal {
        let mut rx = self.rx.clone();
        loop {
            if let Some(signal) = *rx.borrow_and_update() {
                return signal;
            }
            if rx.changed().await.is_err() {
                return ShutdownSignal::Internal;
            }
        }
    }
}

/// Translate SIGTERM / Ctrl-C into a graceful shutdown request
pub fn install_signal_handlers(shutdown: Shutdown) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let on_term = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    on_term.request_shutdown(ShutdownSignal::Graceful);
                }
                Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
            }
        });
    }

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl-C");
                shutdown.request_shutdown(ShutdownSignal::Graceful);
            }
            Err(e) => warn!(error = %e, "failed to install Ctrl-C handler"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn signal_display() {
        assert_eq!(ShutdownSignal::Graceful.to_string(), "graceful");
        assert_eq!(ShutdownSignal::Internal.to_string(), "internal");
    }

    #[tokio::test]
    async fn first_request_wins() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_shutdown_requested());

        shutdown.request_shutdown(ShutdownSignal::Internal);
        shutdown.request_shutdown(ShutdownSignal::Graceful);
        assert!(shutdown.is_shutdown_requested());
        assert_eq!(shutdown.wait().await, ShutdownSignal::Internal);
    }

    #[tokio::test]
    async fn clones_observe_the_request() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.request_shutdown(ShutdownSignal::Graceful);
        let signal = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(signal, ShutdownSignal::Graceful);
    }
}
