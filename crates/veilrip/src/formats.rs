//! Format discovery and best-encoding selection.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use process_utils::{ToolCommand, ToolRunner};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::circuit::ProxyEndpoint;
use crate::config::ToolsConfig;
use crate::error::OperationError;
use crate::retry::CircuitOperation;

/// Kind of elementary stream carried by a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    /// Preference rank of `token` for this kind; -1 when unknown.
    pub fn rank(&self, token: &str) -> i32 {
        match self {
            Self::Video => video_rank(token),
            Self::Audio => audio_rank(token),
        }
    }

    /// Detect the kind from a format description.
    fn classify(description: &str) -> Option<Self> {
        if description.contains("audio only") {
            Some(Self::Audio)
        } else if description.contains("video only") {
            Some(Self::Video)
        } else {
            None
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn audio_rank(token: &str) -> i32 {
    match token {
        "249" => 0,
        "250" => 1,
        "251" => 2,
        "140" => 3,
        _ => -1,
    }
}

pub fn video_rank(token: &str) -> i32 {
    match token {
        "160" => 0,
        "278" => 1,
        "242" => 2,
        "133" => 3,
        "243" => 4,
        "134" => 5,
        "244" => 6,
        "135" => 7,
        "247" => 8,
        "136" => 9,
        "302" => 10,
        "298" => 11,
        "248" => 12,
        "137" => 13,
        "303" => 14,
        "299" => 15,
        _ => -1,
    }
}

/// Chosen format token per track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSelection {
    pub video_format_id: String,
    pub audio_format_id: String,
}

impl FormatSelection {
    pub fn format_for(&self, kind: TrackKind) -> &str {
        match kind {
            TrackKind::Video => &self.video_format_id,
            TrackKind::Audio => &self.audio_format_id,
        }
    }
}

/// Best candidate per kind seen so far in a format listing.
///
/// A later candidate replaces the current one only with a strictly higher
/// rank, so the first of equally ranked lines wins. Unknown tokens (rank -1)
/// are kept only until a ranked token shows up.
#[derive(Debug, Default, Clone)]
pub struct FormatRanker {
    video: Option<(String, i32)>,
    audio: Option<(String, i32)>,
}

impl FormatRanker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consider one `<token> <description>` line of the listing.
    pub fn observe(&mut self, line: &str) {
        let Some((token, description)) = line.split_once(' ') else {
            return;
        };
        let Some(kind) = TrackKind::classify(description) else {
            return;
        };

        let rank = kind.rank(token);
        let best = match kind {
            TrackKind::Video => &mut self.video,
            TrackKind::Audio => &mut self.audio,
        };
        let replace = match best {
            Some((_, best_rank)) => rank > *best_rank,
            None => true,
        };
        if replace {
            *best = Some((token.to_string(), rank));
        }
    }

    pub fn best(&self, kind: TrackKind) -> Option<&str> {
        let best = match kind {
            TrackKind::Video => &self.video,
            TrackKind::Audio => &self.audio,
        };
        best.as_ref().map(|(token, _)| token.as_str())
    }

    /// The selection, or the kind for which no format was listed.
    pub fn finish(self) -> Result<FormatSelection, TrackKind> {
        let video = self.video.ok_or(TrackKind::Video)?;
        let audio = self.audio.ok_or(TrackKind::Audio)?;
        Ok(FormatSelection {
            video_format_id: video.0,
            audio_format_id: audio.0,
        })
    }
}

/// Rank every line of a listing at once.
pub fn select_best_formats<I, S>(lines: I) -> FormatRanker
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut ranker = FormatRanker::new();
    for line in lines {
        ranker.observe(line.as_ref());
    }
    ranker
}

/// Lists the formats of one identifier over a circuit and picks the best pair.
pub struct FormatSelector {
    runner: Arc<dyn ToolRunner>,
    tools: ToolsConfig,
    identifier: String,
}

impl FormatSelector {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        tools: ToolsConfig,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            tools,
            identifier: identifier.into(),
        }
    }

    fn command(&self, proxy: &ProxyEndpoint) -> ToolCommand {
        ToolCommand::new(&self.tools.fetch_tool, "list-formats").args([
            "--proxy".to_string(),
            proxy.url(),
            "--list-formats".to_string(),
            self.identifier.clone(),
        ])
    }
}

#[async_trait]
impl CircuitOperation for FormatSelector {
    type Output = FormatSelection;

    fn purpose(&self) -> &str {
        "list-formats"
    }

    async fn attempt(
        &mut self,
        proxy: &ProxyEndpoint,
        token: &CancellationToken,
    ) -> Result<FormatSelection, OperationError> {
        let process_token = token.child_token();
        let _guard = process_token.clone().drop_guard();

        let mut process = self
            .runner
            .spawn(&self.command(proxy), process_token)
            .map_err(|e| {
                OperationError::retryable(format!("failed to launch format listing: {e}"))
            })?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| OperationError::retryable("format listing has no stdout"))?;

        let mut ranker = FormatRanker::new();
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(process = "list-formats", "{line}");
                    ranker.observe(&line);
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(OperationError::retryable(format!(
                        "failed to read format listing: {e}"
                    )));
                }
            }
        }

        let exit = process.wait().await.map_err(|e| {
            OperationError::retryable(format!("failed to wait for format listing: {e}"))
        })?;
        if !exit.success() {
            return Err(OperationError::retryable(format!("format listing failed with {exit}")));
        }

        let selection = ranker
            .finish()
            .map_err(|kind| OperationError::retryable(format!("no {kind} format listed")))?;
        info!(
            video = %selection.video_format_id,
            audio = %selection.audio_format_id,
            "Best formats selected"
        );
        Ok(selection)
    }
}
