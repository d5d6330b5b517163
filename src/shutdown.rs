use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

/// Graceful shutdown coordinator for meshherd.
///
/// Flips a watch flag on SIGINT/SIGTERM; the supervisor loop observes the
/// flag between iterations and runs its orderly stop sequence (stop
/// discovery, stop polling, broadcast graceful shutdown, force-kill
/// stragglers after the grace window).
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Trip the shutdown flag directly (used by tests and fatal paths).
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Wait for SIGINT or SIGTERM, then trip the flag.
    pub async fn listen_for_signals(self) -> Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            info!("Ctrl-C received");
        }

        info!("Initiating graceful shutdown");
        let _ = self.tx.send(true);
        Ok(())
    }
}
