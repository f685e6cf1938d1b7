//! Signal-driven graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

/// Coordinates shutdown across the accept loop and background tasks.
/// The first SIGINT/SIGTERM wins; later signals are ignored.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    initiated: AtomicBool,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4);
        Self {
            tx,
            initiated: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn is_initiated(&self) -> bool {
        self.initiated.load(Ordering::Relaxed)
    }

    /// Trigger shutdown manually (also used by tests).
    pub fn trigger(&self) {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.tx.send(());
        }
    }

    /// Resolves once shutdown is triggered.
    pub async fn wait(&self) {
        if self.is_initiated() {
            return;
        }
        let mut rx = self.subscribe();
        let _ = rx.recv().await;
    }

    /// Listen for SIGINT and SIGTERM; the first one triggers shutdown.
    pub async fn run_signal_handler(&self) {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "failed to listen for SIGINT");
                    return;
                }
                tracing::info!("SIGINT received, shutting down");
            }
            _ = sigterm() => {
                tracing::info!("SIGTERM received, shutting down");
            }
        }
        self.trigger();
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_is_idempotent_and_wakes_waiters() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_initiated());

        let mut rx = shutdown.subscribe();
        shutdown.trigger();
        shutdown.trigger();
        assert!(shutdown.is_initiated());
        assert!(rx.recv().await.is_ok());

        // wait() returns immediately once initiated.
        shutdown.wait().await;
    }
}
