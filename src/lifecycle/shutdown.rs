//! Signal handling for interrupting a capture

use std::io;

use tracing::debug;

/// Resolves on SIGTERM or SIGINT (Ctrl-C elsewhere).
///
/// Handlers are registered once, in `new`, so a signal that arrives while
/// nothing is waiting is still seen by the next `wait`.
pub struct ShutdownSignal {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    /// Install the signal handlers
    #[cfg(unix)]
    pub fn new() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    #[cfg(not(unix))]
    pub fn new() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for a shutdown signal
    #[cfg(unix)]
    pub async fn wait(&mut self) -> io::Result<()> {
        tokio::select! {
            _ = self.sigterm.recv() => {
                debug!("received SIGTERM");
            }
            _ = self.sigint.recv() => {
                debug!("received SIGINT");
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub async fn wait(&mut self) -> io::Result<()> {
        tokio::signal::ctrl_c().await?;
        debug!("received Ctrl-C");
        Ok(())
    }
}
