//! Cooperative shutdown shared by every worker process.
//!
//! A termination signal only sets the stop flag. Workers look at the flag
//! between units of work, so a claimed batch always finishes and commits
//! before the process exits. Nothing here ever aborts a unit in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// `Running -> Stopping -> Stopped`, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerPhase {
    Running,
    Stopping,
    Stopped,
}

/// Owner of the stop flag for one process.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// A handle for a worker loop to observe the flag.
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Request a graceful stop. Idempotent.
    pub fn trigger(&self) {
        let already = self.tx.send_replace(true);
        if !already {
            log::info!("🛑 Shutdown requested, finishing current unit of work before stopping...");
        }
    }

    /// Install SIGTERM and SIGINT handlers that trigger this controller.
    ///
    /// Handlers are registered before returning, so a signal that arrives
    /// right after this call is not lost.
    pub fn listen_for_signals(&self) -> std::io::Result<JoinHandle<()>> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let controller = self.clone();

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    log::info!("⚠️  Received SIGTERM");
                }
                _ = sigint.recv() => {
                    log::info!("⚠️  Received SIGINT");
                }
            }
            controller.trigger();
        }))
    }
}

/// Read side of the stop flag.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopping(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration` unless a stop is requested first.
    ///
    /// Returns `true` if the sleep ended because of a stop request.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_stopping() {
            return true;
        }

        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);

        tokio::select! {
            _ = &mut sleep => false,
            res = async { self.rx.wait_for(|stop| *stop).await.map(|_| ()) } => match res {
                Ok(_) => true,
                // Controller gone: nobody can request a stop any more.
                Err(_) => {
                    sleep.await;
                    false
                }
            },
        }
    }

    /// Resolve once a stop has been requested.
    pub async fn stopped(&mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
