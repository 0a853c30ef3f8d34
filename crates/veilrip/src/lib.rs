//! # veilrip engine
//!
//! Fetches the best video and audio track of a media identifier through
//! short-lived anonymization circuits and merges them into one file.
//!
//! ## Features
//!
//! - Circuit lifecycle: launch, readiness detection, teardown, rotation
//! - Retry-with-rotation combinator for any circuit-dependent operation
//! - Two concurrent track streams feeding the muxer through FIFOs
//! - Cooperative cancellation of every circuit, stream and child process
//!
//! Unix only: track channels are named pipes.

pub mod channel;
pub mod circuit;
pub mod config;
pub mod error;
pub mod formats;
pub mod mux;
pub mod pipeline;
pub mod retry;
pub mod streamer;
pub mod title;
mod utils;

#[cfg(test)]
mod test_utils;

pub use channel::{TrackChannel, open_channel_writer};
pub use circuit::{
    Acquisition, Circuit, CircuitError, CircuitLauncher, CircuitSupervisor, PortSelector,
    ProxyEndpoint, RandomPortSelector, SequentialPortSelector,
};
pub use config::{CircuitConfig, EngineConfig, OutputConfig, ToolsConfig};
pub use error::{OperationError, Result, VeilripError};
pub use formats::{FormatRanker, FormatSelection, FormatSelector, TrackKind, select_best_formats};
pub use mux::{MuxOutcome, Muxer};
pub use pipeline::{PipelineCoordinator, PipelineState, RunOutcome};
pub use retry::{CircuitOperation, RetryOutcome, RetryingOperation};
pub use streamer::{TrackStreamer, stream_track};
pub use title::TitleFetcher;
pub use utils::sanitize_filename;
