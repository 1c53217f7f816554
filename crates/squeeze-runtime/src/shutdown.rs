//! Graceful shutdown with signal handling

use tokio::signal;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Process-wide shutdown signal
///
/// Cloning is cheap and every clone observes the same trigger. The token is
/// also the context handed to background tasks such as the compression
/// monitor's eviction loop.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown is triggered
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait until shutdown is triggered
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Trigger shutdown
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutdown signal triggered");
        }
        self.token.cancel();
    }

    /// Check if shutdown was triggered
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Signal handler for OS signals
#[derive(Debug)]
pub struct SignalHandler {
    signal: ShutdownSignal,
}

impl SignalHandler {
    /// Create a new signal handler
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }

    /// Wait for SIGINT or SIGTERM (Ctrl+C elsewhere) and trigger shutdown
    ///
    /// Returns early without triggering if the signal fires some other way.
    pub async fn run(self) {
        #[cfg(unix)]
        {
            use signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(err), _) | (_, Err(err)) => {
                        tracing::error!(error = %err, "Failed to install signal handlers");
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM");
                    self.signal.trigger();
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT");
                    self.signal.trigger();
                }
                _ = self.signal.cancelled() => {}
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = signal::ctrl_c() => match result {
                    Ok(()) => {
                        tracing::info!("Received Ctrl+C");
                        self.signal.trigger();
                    }
                    Err(err) => {
                        tracing::error!("Failed to listen for Ctrl+C: {}", err);
                    }
                },
                _ = self.signal.cancelled() => {}
            }
        }
    }
}
