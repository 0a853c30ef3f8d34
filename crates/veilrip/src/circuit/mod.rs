//! Anonymization circuits.
//!
//! A [`Circuit`] is one running circuit-client process bound to a local SOCKS
//! port. [`CircuitLauncher`] brings a single circuit up; the
//! [`CircuitSupervisor`] keeps launching until one is ready or the run is
//! cancelled.

mod port;
mod supervisor;

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use process_utils::{
    DrainLevel, RecordReader, RunningTool, ToolCommand, ToolRunner, drain_records,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::CircuitConfig;

pub use port::{PortSelector, RandomPortSelector, SequentialPortSelector};
pub use supervisor::{Acquisition, CircuitSupervisor};

/// Log fragments showing that another circuit client already holds the port.
///
/// Two launches that draw the same port also share a data directory, and the
/// loser usually reports the directory lock rather than the bind failure.
const PORT_COLLISION_MARKERS: &[&str] = &[
    "Address already in use",
    "another Tor process is running with the same data directory",
];

/// Local SOCKS endpoint exposed by a ready circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyEndpoint {
    port: u16,
}

impl ProxyEndpoint {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Proxy URL in the form expected by the fetch tool's `--proxy` flag.
    pub fn url(&self) -> String {
        format!("socks5://{}:{}", Ipv4Addr::LOCALHOST, self.port)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("failed to launch circuit on port {port}: {source}")]
    Spawn {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("circuit on port {port} never became ready: {reason}")]
    NotReady { port: u16, reason: String },

    #[error("circuit start cancelled")]
    Cancelled,

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// A running circuit process.
///
/// Dropping a circuit that was not stopped cancels its process and removes
/// its working directory on a best-effort basis; prefer [`Circuit::stop`],
/// which also waits for the process and its log drain.
pub struct Circuit {
    port: u16,
    data_dir: PathBuf,
    token: CancellationToken,
    purpose: String,
    process: Option<RunningTool>,
    log_drain: Option<JoinHandle<()>>,
    /// Cleared when the port turned out to belong to another process, whose
    /// data directory must survive our teardown.
    owns_data_dir: bool,
    stopped: bool,
}

impl Circuit {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn proxy(&self) -> ProxyEndpoint {
        ProxyEndpoint::new(self.port)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Terminate the process and remove the working directory.
    ///
    /// Idempotent. Cleanup failures are logged, never returned.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!(purpose = %self.purpose, port = self.port, "Stopping circuit");

        self.token.cancel();
        if let Some(process) = self.process.take() {
            if let Err(e) = process.wait().await {
                warn!(port = self.port, error = %e, "Failed to wait for circuit process");
            }
        }
        if let Some(drain) = self.log_drain.take() {
            let _ = drain.await;
        }
        if !self.owns_data_dir {
            return;
        }

        match tokio::fs::remove_dir_all(&self.data_dir).await {
            Ok(()) => debug!(path = %self.data_dir.display(), "Removed circuit data directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.data_dir.display(),
                error = %e,
                "Failed to remove circuit data directory"
            ),
        }
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        debug!(
            purpose = %self.purpose,
            port = self.port,
            "Circuit dropped without stop, cancelling"
        );
        self.token.cancel();
        if !self.owns_data_dir {
            return;
        }

        let data_dir = std::mem::take(&mut self.data_dir);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_data_dir(&data_dir));
            }
            Err(_) => remove_data_dir(&data_dir),
        }
    }
}

fn remove_data_dir(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => debug!(path = %path.display(), "Removed circuit data directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            path = %path.display(),
            error = %e,
            "Failed to remove circuit data directory"
        ),
    }
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("port", &self.port)
            .field("purpose", &self.purpose)
            .field("data_dir", &self.data_dir)
            .field("stopped", &self.stopped)
            .finish()
    }
}

/// Launches single circuit processes.
pub struct CircuitLauncher {
    runner: Arc<dyn ToolRunner>,
    ports: Arc<dyn PortSelector>,
    config: CircuitConfig,
}

impl CircuitLauncher {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        ports: Arc<dyn PortSelector>,
        config: CircuitConfig,
    ) -> Self {
        Self {
            runner,
            ports,
            config,
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Launch one circuit on a freshly selected port and wait for readiness.
    ///
    /// The process runs under a child of `parent`, so cancelling `parent`
    /// also tears down a circuit that is still bootstrapping.
    pub async fn start(
        &self,
        purpose: &str,
        parent: &CancellationToken,
    ) -> Result<Circuit, CircuitError> {
        let port = self.ports.next_port();
        if self.config.probe_port {
            probe_port(port)?;
        }

        let data_dir = self.config.data_root.join(format!("tor_data_{port}"));
        tokio::fs::create_dir_all(&self.config.data_root).await?;
        info!(purpose, port, "Starting circuit");

        let label = format!("tor {purpose} ({port})");
        let command = ToolCommand::new(&self.config.binary, label.clone()).args([
            "--HTTPTunnelPort".to_string(),
            "0".to_string(),
            "--SocksPort".to_string(),
            port.to_string(),
            "--DataDirectory".to_string(),
            data_dir.to_string_lossy().into_owned(),
        ]);

        let token = parent.child_token();
        let mut process = self
            .runner
            .spawn(&command, token.clone())
            .map_err(|source| CircuitError::Spawn { port, source })?;
        let stdout = process.take_stdout();

        let mut circuit = Circuit {
            port,
            data_dir,
            token,
            purpose: purpose.to_string(),
            process: Some(process),
            log_drain: None,
            owns_data_dir: true,
            stopped: false,
        };

        let Some(stdout) = stdout else {
            circuit.stop().await;
            return Err(CircuitError::NotReady {
                port,
                reason: "log stream unavailable".to_string(),
            });
        };

        let mut records = RecordReader::new(stdout);
        let readiness = tokio::select! {
            _ = circuit.token.cancelled() => Err(CircuitError::Cancelled),
            result = wait_for_marker(&mut records, &self.config.readiness_marker, port) => result,
        };

        if let Err(e) = readiness {
            if matches!(e, CircuitError::PortInUse { .. }) {
                circuit.owns_data_dir = false;
            }
            circuit.stop().await;
            return Err(e);
        }

        info!(purpose, port, "Circuit ready");
        circuit.log_drain = Some(tokio::spawn(drain_records(records, label, DrainLevel::Debug)));
        Ok(circuit)
    }
}

async fn wait_for_marker<R>(
    records: &mut RecordReader<R>,
    marker: &str,
    port: u16,
) -> Result<(), CircuitError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut collided = false;
    loop {
        match records.next_record().await {
            Ok(Some(line)) => {
                trace!(port, "{line}");
                if line.contains(marker) {
                    return Ok(());
                }
                if PORT_COLLISION_MARKERS.iter().any(|m| line.contains(m)) {
                    collided = true;
                }
            }
            Ok(None) if collided => return Err(CircuitError::PortInUse { port }),
            Ok(None) => {
                return Err(CircuitError::NotReady {
                    port,
                    reason: "log stream ended before readiness".to_string(),
                });
            }
            Err(e) => {
                return Err(CircuitError::NotReady {
                    port,
                    reason: format!("failed to read log stream: {e}"),
                });
            }
        }
    }
}

fn probe_port(port: u16) -> Result<(), CircuitError> {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(CircuitError::PortInUse { port }),
        Err(e) => Err(e.into()),
    }
}
