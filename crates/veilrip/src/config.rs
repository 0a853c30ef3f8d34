use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VeilripError};

/// Log line printed by the circuit client once its circuit is established.
pub const DEFAULT_READINESS_MARKER: &str = "Bootstrapped 100% (done): Done";

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub circuit: CircuitConfig,
    pub tools: ToolsConfig,
    pub output: OutputConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let circuit = &self.circuit;
        if circuit.port_range_start >= circuit.port_range_end {
            return Err(VeilripError::configuration(format!(
                "circuit port range {}..{} is empty",
                circuit.port_range_start, circuit.port_range_end
            )));
        }
        if circuit.readiness_marker.trim().is_empty() {
            return Err(VeilripError::configuration(
                "circuit readiness marker must not be empty",
            ));
        }
        if self.output.container.trim().is_empty() || self.output.container.contains('/') {
            return Err(VeilripError::configuration(format!(
                "invalid output container `{}`",
                self.output.container
            )));
        }
        for (name, value) in [
            ("circuit binary", &circuit.binary),
            ("fetch tool", &self.tools.fetch_tool),
            ("muxer", &self.tools.muxer),
        ] {
            if value.trim().is_empty() {
                return Err(VeilripError::configuration(format!("{name} must not be empty")));
            }
        }
        if self.tools.title_fallback_after == Some(0) {
            return Err(VeilripError::configuration(
                "title_fallback_after must be at least 1 when set",
            ));
        }
        Ok(())
    }
}

/// Anonymizing circuit settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Circuit client binary.
    pub binary: String,
    /// First local port a circuit may bind (inclusive).
    pub port_range_start: u16,
    /// End of the local port range (exclusive).
    pub port_range_end: u16,
    /// Directory holding per-circuit data directories (`tor_data_<port>`).
    pub data_root: PathBuf,
    pub readiness_marker: String,
    /// Check that a port is bindable before launching a circuit on it.
    pub probe_port: bool,
    /// Seconds a process gets to exit after the termination signal.
    pub stop_grace_secs: u64,
}

impl CircuitConfig {
    pub fn port_range(&self) -> Range<u16> {
        self.port_range_start..self.port_range_end
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            binary: "tor".to_string(),
            port_range_start: 10000,
            port_range_end: 10500,
            data_root: std::env::temp_dir().join("veilrip"),
            readiness_marker: DEFAULT_READINESS_MARKER.to_string(),
            probe_port: true,
            stop_grace_secs: 5,
        }
    }
}

/// External tool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Media fetch tool, invoked with youtube-dl compatible arguments.
    pub fetch_tool: String,
    pub muxer: String,
    /// Output options passed to the muxer before the output path.
    pub muxer_args: Vec<String>,
    /// Overwrite an existing output file instead of failing.
    pub overwrite: bool,
    /// Accept the identifier as title after this many consecutive empty titles.
    ///
    /// `None` keeps retrying until cancelled.
    pub title_fallback_after: Option<u32>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            fetch_tool: "youtube-dl".to_string(),
            muxer: "ffmpeg".to_string(),
            muxer_args: vec!["-c".to_string(), "copy".to_string()],
            overwrite: false,
            title_fallback_after: None,
        }
    }
}

/// Output locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub output_dir: PathBuf,
    /// Directory in which the two track channels are created.
    pub channel_dir: PathBuf,
    /// Container extension of the merged file.
    pub container: String,
    /// Milliseconds between attempts to open a channel that has no reader yet.
    pub channel_poll_ms: u64,
}

impl OutputConfig {
    pub fn channel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.channel_poll_ms.max(1))
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            channel_dir: PathBuf::from("."),
            container: "mkv".to_string(),
            channel_poll_ms: 100,
        }
    }
}
