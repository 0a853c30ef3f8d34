//! End-to-end run: formats, two concurrent track streams, title, merge.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use process_utils::ToolRunner;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::TrackChannel;
use crate::circuit::{Circuit, CircuitLauncher, CircuitSupervisor, PortSelector};
use crate::config::EngineConfig;
use crate::error::{Result, VeilripError};
use crate::formats::{FormatSelection, FormatSelector, TrackKind};
use crate::mux::{MuxOutcome, Muxer};
use crate::retry::{RetryOutcome, RetryingOperation};
use crate::streamer::stream_track;
use crate::title::TitleFetcher;
use crate::utils::{channel_path, output_path};

/// Stage of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    SelectingFormats,
    CreatingChannels,
    Streaming,
    FetchingTitle,
    Merging,
    Cancelling,
    Done,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SelectingFormats => "selecting formats",
            Self::CreatingChannels => "creating channels",
            Self::Streaming => "streaming",
            Self::FetchingTitle => "fetching title",
            Self::Merging => "merging",
            Self::Cancelling => "cancelling",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { output: PathBuf, title: String },
    Cancelled,
}

type StreamTask = JoinHandle<Result<()>>;

/// Drives one identifier from format discovery to the merged output file.
///
/// Every circuit, channel and child process created by [`run`](Self::run) is
/// released before it returns, whatever the outcome.
pub struct PipelineCoordinator {
    config: EngineConfig,
    runner: Arc<dyn ToolRunner>,
    supervisor: Arc<CircuitSupervisor>,
}

impl PipelineCoordinator {
    pub fn new(
        config: EngineConfig,
        runner: Arc<dyn ToolRunner>,
        ports: Arc<dyn PortSelector>,
    ) -> Self {
        let launcher = CircuitLauncher::new(runner.clone(), ports, config.circuit.clone());
        Self {
            config,
            runner,
            supervisor: Arc::new(CircuitSupervisor::new(launcher)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &CircuitSupervisor {
        &self.supervisor
    }

    pub async fn run(&self, identifier: &str, token: &CancellationToken) -> Result<RunOutcome> {
        // Cancelled by a fatal stream error, a muxer failure, or the caller.
        let run_token = token.child_token();
        let _guard = run_token.clone().drop_guard();
        let mut state = StateLog::new(identifier);

        state.enter(PipelineState::SelectingFormats);
        let mut selector =
            FormatSelector::new(self.runner.clone(), self.config.tools.clone(), identifier);
        let (selection, format_circuit) = match RetryingOperation::new(&self.supervisor, &run_token)
            .run(&mut selector, None)
            .await?
        {
            RetryOutcome::Success { value, circuit } => (value, circuit),
            RetryOutcome::Cancelled => {
                state.enter(PipelineState::Cancelling);
                return Ok(RunOutcome::Cancelled);
            }
        };

        state.enter(PipelineState::CreatingChannels);
        let channel_dir = &self.config.output.channel_dir;
        tokio::fs::create_dir_all(channel_dir).await?;
        let video = TrackChannel::create(
            channel_path(channel_dir, TrackKind::Video, identifier),
            TrackKind::Video,
        )?;
        let audio = TrackChannel::create(
            channel_path(channel_dir, TrackKind::Audio, identifier),
            TrackKind::Audio,
        )?;

        state.enter(PipelineState::Streaming);
        // The format circuit is known good; the video stream starts on it.
        let tasks = [
            self.spawn_stream(identifier, &selection, &video, &run_token, Some(format_circuit)),
            self.spawn_stream(identifier, &selection, &audio, &run_token, None),
        ];

        state.enter(PipelineState::FetchingTitle);
        let mut fetcher =
            TitleFetcher::new(self.runner.clone(), self.config.tools.clone(), identifier);
        let title = match RetryingOperation::new(&self.supervisor, &run_token)
            .run(&mut fetcher, None)
            .await
        {
            Ok(RetryOutcome::Success { value, mut circuit }) => {
                circuit.stop().await;
                value
            }
            Ok(RetryOutcome::Cancelled) => {
                state.enter(PipelineState::Cancelling);
                join_streams(tasks).await?;
                return Ok(RunOutcome::Cancelled);
            }
            Err(e) => {
                run_token.cancel();
                let _ = join_streams(tasks).await;
                return Err(e);
            }
        };

        state.enter(PipelineState::Merging);
        let output = self.prepare_output(&title, identifier).await;
        let merged = match output {
            Ok(output) => {
                Muxer::new(self.runner.clone(), self.config.tools.clone())
                    .merge(video.path(), audio.path(), &output, &run_token)
                    .await
            }
            Err(e) => Err(e),
        };

        let merged = match merged {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Merge failed, stopping track streams");
                run_token.cancel();
                if let Err(stream_error) = join_streams(tasks).await {
                    debug!(error = %stream_error, "Track stream ended after merge failure");
                }
                return Err(e);
            }
        };

        // A fatal stream error cancels the run and with it the muxer, so the
        // stream error takes precedence over the muxer outcome.
        join_streams(tasks).await?;
        drop(video);
        drop(audio);

        match merged {
            MuxOutcome::Completed(output) => {
                state.enter(PipelineState::Done);
                Ok(RunOutcome::Completed { output, title })
            }
            MuxOutcome::Cancelled => {
                state.enter(PipelineState::Cancelling);
                Ok(RunOutcome::Cancelled)
            }
        }
    }

    fn spawn_stream(
        &self,
        identifier: &str,
        selection: &FormatSelection,
        channel: &TrackChannel,
        run_token: &CancellationToken,
        initial: Option<Circuit>,
    ) -> StreamTask {
        let supervisor = self.supervisor.clone();
        let runner = self.runner.clone();
        let tools = self.config.tools.clone();
        let output = self.config.output.clone();
        let identifier = identifier.to_string();
        let kind = channel.kind();
        let format_id = selection.format_for(kind).to_string();
        let path = channel.path().to_path_buf();
        let token = run_token.clone();

        tokio::spawn(async move {
            let retry = RetryingOperation::new(&supervisor, &token);
            let result = stream_track(
                retry,
                runner,
                tools,
                &output,
                &identifier,
                kind,
                &format_id,
                &path,
                &token,
                initial,
            )
            .await;

            match result {
                Ok(Some(mut circuit)) => {
                    // Nothing more goes over this circuit once the track is written.
                    circuit.stop().await;
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(e) => {
                    error!(track = %kind, error = %e, "Track stream failed, cancelling run");
                    token.cancel();
                    Err(e)
                }
            }
        })
    }

    async fn prepare_output(&self, title: &str, identifier: &str) -> Result<PathBuf> {
        let output = &self.config.output;
        tokio::fs::create_dir_all(&output.output_dir).await?;
        let path = output_path(&output.output_dir, title, identifier, &output.container);
        if !self.config.tools.overwrite && tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(output = %path.display(), "Output file exists and will not be overwritten");
        }
        Ok(path)
    }
}

/// Wait for both stream tasks and return the first error, if any.
async fn join_streams(tasks: [StreamTask; 2]) -> Result<()> {
    let mut first_error = None;
    for task in tasks {
        let result = task
            .await
            .unwrap_or_else(|e| Err(VeilripError::task("stream", e.to_string())));
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

struct StateLog<'a> {
    identifier: &'a str,
    current: Option<PipelineState>,
}

impl<'a> StateLog<'a> {
    fn new(identifier: &'a str) -> Self {
        Self {
            identifier,
            current: None,
        }
    }

    fn enter(&mut self, next: PipelineState) {
        match self.current {
            Some(previous) => info!(
                identifier = self.identifier,
                from = %previous,
                to = %next,
                "Pipeline state changed"
            ),
            None => info!(identifier = self.identifier, state = %next, "Pipeline started"),
        }
        self.current = Some(next);
    }
}

impl Drop for StateLog<'_> {
    fn drop(&mut self) {
        if let Some(state) = self.current {
            debug!(identifier = self.identifier, state = %state, "Pipeline run finished");
        }
    }
}
