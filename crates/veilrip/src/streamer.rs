//! Streaming one track into its channel.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use process_utils::{ToolCommand, ToolRunner};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::channel::open_channel_writer;
use crate::circuit::{Circuit, ProxyEndpoint};
use crate::config::{OutputConfig, ToolsConfig};
use crate::error::{OperationError, Result, VeilripError};
use crate::formats::TrackKind;
use crate::retry::{CircuitOperation, RetryOutcome, RetryingOperation};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Copies the fetch tool's output for one format into `sink`.
///
/// The sink stays open across attempts. When an attempt dies mid-stream the
/// next attempt restarts the download from the beginning, and the bytes the
/// sink already received are skipped, so the sink sees every byte exactly
/// once and in order.
pub struct TrackStreamer<W> {
    runner: Arc<dyn ToolRunner>,
    tools: ToolsConfig,
    identifier: String,
    format_id: String,
    kind: TrackKind,
    purpose: String,
    sink: W,
    /// Reported when the sink's reader goes away.
    channel: PathBuf,
    delivered: u64,
}

enum CopyError {
    Read(io::Error),
    Write(io::Error),
}

impl<W> TrackStreamer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        tools: ToolsConfig,
        identifier: impl Into<String>,
        kind: TrackKind,
        format_id: impl Into<String>,
        sink: W,
    ) -> Self {
        Self {
            runner,
            tools,
            identifier: identifier.into(),
            format_id: format_id.into(),
            kind,
            purpose: format!("download {kind}"),
            sink,
            channel: PathBuf::from(kind.as_str()),
            delivered: 0,
        }
    }

    pub fn with_channel_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.channel = path.into();
        self
    }

    /// Bytes written to the sink so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn into_sink(self) -> W {
        self.sink
    }

    fn command(&self, proxy: &ProxyEndpoint) -> ToolCommand {
        ToolCommand::new(&self.tools.fetch_tool, self.purpose.clone()).args([
            "--proxy".to_string(),
            proxy.url(),
            "-f".to_string(),
            self.format_id.clone(),
            "-o".to_string(),
            "-".to_string(),
            self.identifier.clone(),
        ])
    }

    async fn copy_from<R>(&mut self, reader: &mut R) -> std::result::Result<(), CopyError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        // Position of this attempt's stream, used to skip already delivered bytes.
        let mut offset: u64 = 0;

        loop {
            let n = reader.read(&mut buf).await.map_err(CopyError::Read)?;
            if n == 0 {
                break;
            }

            let already = self.delivered.saturating_sub(offset).min(n as u64) as usize;
            offset += n as u64;
            if already < n {
                self.sink
                    .write_all(&buf[already..n])
                    .await
                    .map_err(CopyError::Write)?;
                self.delivered += (n - already) as u64;
            }
        }

        self.sink.flush().await.map_err(CopyError::Write)
    }
}

#[async_trait]
impl<W> CircuitOperation for TrackStreamer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    type Output = u64;

    fn purpose(&self) -> &str {
        &self.purpose
    }

    async fn attempt(
        &mut self,
        proxy: &ProxyEndpoint,
        token: &CancellationToken,
    ) -> std::result::Result<u64, OperationError> {
        let process_token = token.child_token();
        let _guard = process_token.clone().drop_guard();

        if self.delivered > 0 {
            info!(
                track = %self.kind,
                resume_at = self.delivered,
                "Restarting track stream, skipping delivered bytes"
            );
        }

        let mut process = self
            .runner
            .spawn(&self.command(proxy), process_token)
            .map_err(|e| OperationError::retryable(format!("failed to launch fetch tool: {e}")))?;
        let mut stdout = process
            .take_stdout()
            .ok_or_else(|| OperationError::retryable("fetch tool has no stdout"))?;

        match self.copy_from(&mut stdout).await {
            Ok(()) => {}
            Err(CopyError::Read(e)) => {
                return Err(OperationError::retryable(format!("track stream read failed: {e}")));
            }
            Err(CopyError::Write(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                return Err(OperationError::Fatal(VeilripError::ChannelClosed {
                    path: self.channel.clone(),
                }));
            }
            Err(CopyError::Write(e)) => {
                return Err(OperationError::retryable(format!("track channel write failed: {e}")));
            }
        }

        let exit = process
            .wait()
            .await
            .map_err(|e| OperationError::retryable(format!("failed to wait for fetch tool: {e}")))?;
        if !exit.success() {
            return Err(OperationError::retryable(format!("fetch tool failed with {exit}")));
        }

        debug!(track = %self.kind, bytes = self.delivered, "Track stream complete");
        Ok(self.delivered)
    }
}

/// Stream one track into the channel at `channel_path`.
///
/// The channel is opened for writing first; failing to open it is fatal.
/// Returns the circuit of the successful attempt, or `None` when cancelled.
#[allow(clippy::too_many_arguments)]
pub async fn stream_track(
    retry: RetryingOperation<'_>,
    runner: Arc<dyn ToolRunner>,
    tools: ToolsConfig,
    output: &OutputConfig,
    identifier: &str,
    kind: TrackKind,
    format_id: &str,
    channel_path: &Path,
    token: &CancellationToken,
    initial: Option<Circuit>,
) -> Result<Option<Circuit>> {
    let poll_interval = output.channel_poll_interval();
    let Some(writer) = open_channel_writer(channel_path, poll_interval, token).await? else {
        if let Some(mut circuit) = initial {
            circuit.stop().await;
        }
        return Ok(None);
    };

    info!(track = %kind, format = format_id, "Streaming track");
    let mut streamer = TrackStreamer::new(runner, tools, identifier, kind, format_id, writer)
        .with_channel_path(channel_path);
    let outcome = retry.run(&mut streamer, initial).await?;

    match outcome {
        RetryOutcome::Success { value, circuit } => {
            info!(track = %kind, bytes = value, "Track fully written");
            // Dropping the writer delivers end-of-stream to the muxer.
            drop(streamer.into_sink());
            Ok(Some(circuit))
        }
        RetryOutcome::Cancelled => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitLauncher, CircuitSupervisor, SequentialPortSelector};
    use crate::config::CircuitConfig;
    use crate::test_utils::{ScriptedRunner, ToolBehavior, exits, ready_tor};

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn is_fetch(command: &ToolCommand) -> bool {
        command.program == "youtube-dl" && command.has_arg("-f")
    }

    fn supervisor(runner: Arc<ScriptedRunner>, root: &Path) -> CircuitSupervisor {
        let config = CircuitConfig {
            data_root: root.to_path_buf(),
            probe_port: false,
            ..CircuitConfig::default()
        };
        CircuitSupervisor::new(CircuitLauncher::new(
            runner,
            Arc::new(SequentialPortSelector::new(33000..33100)),
            config,
        ))
    }

    #[tokio::test]
    async fn successful_attempt_copies_every_byte_in_order() {
        let data = payload(300_000);
        let runner = Arc::new(ScriptedRunner::new().on_when(is_fetch, exits(data.clone(), 0)));
        let mut streamer = TrackStreamer::new(
            runner.clone(),
            ToolsConfig::default(),
            "abc123",
            TrackKind::Video,
            "137",
            Vec::new(),
        );

        let written = streamer
            .attempt(&ProxyEndpoint::new(10007), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, data.len() as u64);
        assert_eq!(streamer.into_sink(), data);
        let call = &runner.calls()[0];
        assert_eq!(call.arg_after("-f"), Some("137"));
        assert_eq!(call.arg_after("-o"), Some("-"));
        assert_eq!(call.args.last().map(String::as_str), Some("abc123"));
    }

    #[tokio::test]
    async fn mid_stream_failure_rotates_and_skips_delivered_bytes() {
        let temp = tempfile::tempdir().unwrap();
        let data = payload(200_000);
        let runner = Arc::new(
            ScriptedRunner::new().on("tor", ready_tor()).on_sequence_when(
                is_fetch,
                vec![
                    ToolBehavior::BrokenStream {
                        stdout: data[..70_000].to_vec(),
                    },
                    exits(data[..120_000].to_vec(), 1),
                    exits(data.clone(), 0),
                ],
            ),
        );
        let supervisor = supervisor(runner.clone(), temp.path());
        let token = CancellationToken::new();
        let mut streamer = TrackStreamer::new(
            runner.clone(),
            ToolsConfig::default(),
            "abc123",
            TrackKind::Audio,
            "140",
            Vec::new(),
        );

        let outcome = RetryingOperation::new(&supervisor, &token)
            .run(&mut streamer, None)
            .await
            .unwrap();

        let (_, mut circuit) = outcome.into_success().unwrap();
        circuit.stop().await;
        assert_eq!(runner.count("tor"), 3);
        assert_eq!(runner.terminations(), 3);
        assert_eq!(streamer.delivered(), data.len() as u64);
        assert_eq!(streamer.into_sink(), data);
    }

    #[tokio::test]
    async fn launch_failure_is_retryable() {
        let runner = Arc::new(ScriptedRunner::new().on_when(is_fetch, ToolBehavior::SpawnError));
        let mut streamer = TrackStreamer::new(
            runner,
            ToolsConfig::default(),
            "abc123",
            TrackKind::Video,
            "137",
            Vec::new(),
        );

        let err = streamer
            .attempt(&ProxyEndpoint::new(10007), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn closed_reader_is_fatal() {
        let runner = Arc::new(ScriptedRunner::new().on_when(is_fetch, exits(payload(4096), 0)));
        let (sink, reader) = tokio::io::duplex(16);
        drop(reader);
        let mut streamer = TrackStreamer::new(
            runner,
            ToolsConfig::default(),
            "abc123",
            TrackKind::Video,
            "137",
            sink,
        )
        .with_channel_path("/tmp/video_abc123");

        let err = streamer
            .attempt(&ProxyEndpoint::new(10007), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OperationError::Fatal(VeilripError::ChannelClosed { .. })
        ));
    }

    #[tokio::test]
    async fn stream_track_returns_none_when_cancelled_before_reader() {
        let temp = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on("tor", ready_tor()));
        let supervisor = supervisor(runner.clone(), temp.path());
        let path = temp.path().join("video_abc123");
        let _channel = crate::channel::TrackChannel::create(&path, TrackKind::Video).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let circuit = stream_track(
            RetryingOperation::new(&supervisor, &token),
            runner.clone(),
            ToolsConfig::default(),
            &OutputConfig::default(),
            "abc123",
            TrackKind::Video,
            "137",
            &path,
            &token,
            None,
        )
        .await
        .unwrap();

        assert!(circuit.is_none());
        assert_eq!(runner.count("youtube-dl"), 0);
    }
}
