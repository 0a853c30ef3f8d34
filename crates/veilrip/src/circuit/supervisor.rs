use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Circuit, CircuitError, CircuitLauncher};

/// Result of [`CircuitSupervisor::acquire`].
#[derive(Debug)]
pub enum Acquisition {
    Ready(Circuit),
    Cancelled,
}

/// Brings circuits up, rotating to a new port after every failed start.
///
/// There is no delay between attempts: failures are almost always port
/// collisions or launch hiccups that a new port resolves immediately.
pub struct CircuitSupervisor {
    launcher: CircuitLauncher,
    acquired: AtomicU64,
}

impl CircuitSupervisor {
    pub fn new(launcher: CircuitLauncher) -> Self {
        Self {
            launcher,
            acquired: AtomicU64::new(0),
        }
    }

    pub fn launcher(&self) -> &CircuitLauncher {
        &self.launcher
    }

    /// Number of circuits handed out so far.
    pub fn acquired_count(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Launch circuits until one is ready or `token` is cancelled.
    pub async fn acquire(&self, token: &CancellationToken, purpose: &str) -> Acquisition {
        let mut attempt: u32 = 0;
        loop {
            if token.is_cancelled() {
                debug!(purpose, attempt, "Circuit acquisition cancelled");
                return Acquisition::Cancelled;
            }
            attempt += 1;

            match self.launcher.start(purpose, token).await {
                Ok(mut circuit) => {
                    if token.is_cancelled() {
                        circuit.stop().await;
                        return Acquisition::Cancelled;
                    }
                    self.acquired.fetch_add(1, Ordering::Relaxed);
                    return Acquisition::Ready(circuit);
                }
                Err(CircuitError::Cancelled) => return Acquisition::Cancelled,
                Err(e) => {
                    warn!(purpose, attempt, error = %e, "Circuit failed to start, rotating");
                }
            }
        }
    }
}
