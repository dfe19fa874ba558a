//! Cooperative cancellation.
//!
//! A [`ShutdownToken`] is handed to every worker and checked at each blocking
//! wait. Signal delivery is wired up explicitly with [`spawn_signal_listener`];
//! nothing registers handlers implicitly.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::AppResult;

/// Cloneable process-wide shutdown flag.
///
/// ```
/// use sky_daq::shutdown::ShutdownToken;
///
/// # tokio_test::block_on(async {
/// let token = ShutdownToken::new();
/// let worker = token.clone();
///
/// token.cancel();
/// worker.cancelled().await;
/// assert!(worker.is_cancelled());
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownToken {
    /// New, un-cancelled token.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request shutdown. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// True once shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// Wait for hang-up, terminate or interrupt. Returns the signal name.
#[cfg(unix)]
pub async fn wait_for_signal() -> AppResult<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hup = signal(SignalKind::hangup())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = hup.recv() => "SIGHUP",
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
    };
    Ok(name)
}

/// Wait for Ctrl-C. Returns the signal name.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> AppResult<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Cancel `token` when a shutdown signal arrives.
pub fn spawn_signal_listener(token: ShutdownToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = wait_for_signal() => match result {
                Ok(name) => {
                    tracing::warn!(signal = name, "Caught signal, shutting down");
                    token.cancel();
                }
                Err(e) => tracing::error!("Failed to install signal handlers: {}", e),
            },
            _ = token.cancelled() => {}
        }
    })
}
