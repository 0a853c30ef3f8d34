//! Merging the two track channels into the output file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use process_utils::{ToolCommand, ToolRunner};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ToolsConfig;
use crate::error::{Result, VeilripError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxOutcome {
    Completed(PathBuf),
    Cancelled,
}

/// Runs the muxer tool. A muxer failure is final; it is never retried.
pub struct Muxer {
    runner: Arc<dyn ToolRunner>,
    tools: ToolsConfig,
}

impl Muxer {
    pub fn new(runner: Arc<dyn ToolRunner>, tools: ToolsConfig) -> Self {
        Self { runner, tools }
    }

    pub fn command(&self, video: &Path, audio: &Path, output: &Path) -> ToolCommand {
        let mut command =
            ToolCommand::new(&self.tools.muxer, "mux").args(["-hide_banner", "-nostdin"]);
        if self.tools.overwrite {
            command = command.arg("-y");
        } else {
            command = command.arg("-n");
        }
        command
            .arg("-i")
            .arg(video.to_string_lossy())
            .arg("-i")
            .arg(audio.to_string_lossy())
            .args(self.tools.muxer_args.iter().cloned())
            .arg(output.to_string_lossy())
            .log_stdout()
    }

    /// Read both channels and write `output`.
    pub async fn merge(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<MuxOutcome> {
        let command = self.command(video, audio, output);
        debug!(args = ?command.args, "Launching muxer");

        let process = self
            .runner
            .spawn(&command, token.child_token())
            .map_err(|source| VeilripError::MuxSpawn { source })?;
        let exit = process.wait().await?;

        if exit.success() {
            info!(output = %output.display(), "Merge complete");
            Ok(MuxOutcome::Completed(output.to_path_buf()))
        } else if token.is_cancelled() {
            // A terminal interrupt reaches the muxer too, which may exit on its
            // own with a failure code before it is terminated.
            debug!(%exit, "Muxer stopped after cancellation");
            Ok(MuxOutcome::Cancelled)
        } else {
            Err(VeilripError::MuxFailed { exit })
        }
    }
}
