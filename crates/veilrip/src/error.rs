use std::fmt;
use std::path::PathBuf;

use process_utils::ToolExit;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, VeilripError>;

/// Errors that end a pipeline run.
///
/// Everything here is local and deterministic; transient failures caused by a
/// bad circuit never reach this type, they are retried by rotating circuits.
#[derive(Debug, thiserror::Error)]
pub enum VeilripError {
    #[error("failed to create channel {path}: {source}")]
    ChannelCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open channel {path} for writing: {source}")]
    ChannelOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("channel {path} was closed by its reader")]
    ChannelClosed { path: PathBuf },

    #[error("failed to launch muxer: {source}")]
    MuxSpawn {
        #[source]
        source: std::io::Error,
    },

    #[error("muxer failed with {exit}")]
    MuxFailed { exit: ToolExit },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("{task} task failed: {reason}")]
    Task { task: &'static str, reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl VeilripError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn task(task: &'static str, reason: impl Into<String>) -> Self {
        Self::Task {
            task,
            reason: reason.into(),
        }
    }
}

/// Failure of a single circuit-dependent attempt.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// Transient; the attempt is repeated over a fresh circuit.
    #[error("{0}")]
    Retryable(String),

    /// Local failure that no circuit rotation can fix.
    #[error(transparent)]
    Fatal(#[from] VeilripError),
}

impl OperationError {
    pub fn retryable(reason: impl fmt::Display) -> Self {
        Self::Retryable(reason.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
