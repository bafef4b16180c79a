//! Translation of termination signals into a one-shot stop request.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One-shot stop request shared between the signal listener and the scan controller.
///
/// Cloning yields another handle to the same request.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop.
    ///
    /// Returns `true` only for the call that actually raised the request; later calls
    /// have no further effect.
    pub fn trigger(&self) -> bool {
        let first = !self.requested.swap(true, Ordering::SeqCst);
        self.token.cancel();
        first
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until a stop has been requested.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}

/// Spawn a task that raises `shutdown` on SIGINT or SIGTERM (Ctrl+C elsewhere).
///
/// The listener keeps running after the first signal so repeated signals are
/// absorbed instead of falling back to the default handler.
///
/// # Errors
/// Returns an `io::Error` if the signal handlers cannot be installed.
pub fn listen_for_signals(shutdown: Shutdown) -> io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        Ok(tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    Some(()) = sigint.recv() => "SIGINT",
                    Some(()) = sigterm.recv() => "SIGTERM",
                    else => break,
                };
                on_signal(&shutdown, name);
            }
        }))
    }

    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                on_signal(&shutdown, "Ctrl+C");
            }
        }))
    }
}

fn on_signal(shutdown: &Shutdown, name: &str) {
    if shutdown.trigger() {
        info!("Received {name}, stopping scanner...");
    } else {
        debug!("Received {name} while already stopping");
    }
}
