use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use eyre::{Result, WrapErr};
use tokio::{signal, sync::broadcast, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Graceful shutdown requested (SIGTERM, SIGINT)
    Graceful,
    /// Shutdown requested programmatically
    Requested,
    /// Force shutdown (grace period exceeded)
    Force,
}

/// Coordinates process shutdown.
///
/// Background tasks observe [`GracefulShutdown::token`]; the server stops
/// accepting connections on the first signal and in-flight requests get
/// `grace_timeout` to finish before they are aborted.
pub struct GracefulShutdown {
    /// Broadcast sender for shutdown signals
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    /// Flag indicating if shutdown has been initiated
    shutdown_initiated: Arc<AtomicBool>,
    token: CancellationToken,
    /// Maximum time to wait for in-flight requests
    grace_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a new GracefulShutdown manager with default 30-second timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a new GracefulShutdown manager with custom timeout
    pub fn with_timeout(grace_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            token: CancellationToken::new(),
            grace_timeout,
        }
    }

    pub fn grace_timeout(&self) -> Duration {
        self.grace_timeout
    }

    /// Get a receiver for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    /// Token cancelled once shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Manually trigger shutdown
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self.initiate_shutdown(reason) {
            tracing::info!("Shutdown manually triggered: {:?}", reason);
        }
    }

    /// Start listening for OS signals and manage shutdown process
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Signal handler started. Listening for SIGTERM, SIGINT");

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                self.initiate_shutdown(ShutdownReason::Graceful);
            }
            result = Self::wait_for_sigterm() => {
                result?;
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                self.initiate_shutdown(ShutdownReason::Graceful);
            }
            _ = self.token.cancelled() => {}
        }

        tracing::info!("Signal handler shutting down");
        Ok(())
    }

    #[cfg(unix)]
    async fn wait_for_sigterm() -> Result<()> {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).wrap_err("Failed to register SIGTERM handler")?;
        sigterm.recv().await;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn wait_for_sigterm() -> Result<()> {
        // On non-Unix systems, we only have Ctrl+C
        std::future::pending::<()>().await;
        Ok(())
    }

    fn initiate_shutdown(&self, reason: ShutdownReason) -> bool {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("Processing shutdown signal: {:?}", reason);
            // No subscribers is fine; the token carries the signal too.
            let _ = self.shutdown_tx.send(reason);
            self.token.cancel();
            true
        } else {
            tracing::warn!("Shutdown already initiated, ignoring signal");
            false
        }
    }

    /// Resolves once shutdown has been initiated.
    pub fn signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.token.clone();
        async move { token.cancelled().await }
    }

    /// Give a draining task up to `grace_timeout` to finish, then abort it.
    ///
    /// Returns `None` when the task had to be aborted.
    pub async fn drain<T>(&self, mut handle: JoinHandle<T>) -> Option<Result<T>> {
        match timeout(self.grace_timeout, &mut handle).await {
            Ok(joined) => Some(joined.wrap_err("Drained task failed")),
            Err(_) => {
                tracing::warn!(
                    grace_timeout = ?self.grace_timeout,
                    "Grace period exceeded, aborting remaining requests"
                );
                let _ = self.shutdown_tx.send(ShutdownReason::Force);
                handle.abort();
                None
            }
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}
