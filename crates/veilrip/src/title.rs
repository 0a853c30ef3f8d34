//! Title lookup through the fetch tool's JSON info record.

use std::sync::Arc;

use async_trait::async_trait;
use process_utils::{ToolCommand, ToolRunner};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::circuit::ProxyEndpoint;
use crate::config::ToolsConfig;
use crate::error::OperationError;
use crate::retry::CircuitOperation;

#[derive(Debug, Deserialize)]
struct VideoInfo {
    #[serde(default)]
    title: String,
}

/// Fetches the descriptive title of an identifier.
///
/// An empty title counts as a failed attempt. With `title_fallback_after` set,
/// the identifier itself is used once that many empty titles were seen in a row.
pub struct TitleFetcher {
    runner: Arc<dyn ToolRunner>,
    tools: ToolsConfig,
    identifier: String,
    empty_titles: u32,
}

impl TitleFetcher {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        tools: ToolsConfig,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            tools,
            identifier: identifier.into(),
            empty_titles: 0,
        }
    }

    fn command(&self, proxy: &ProxyEndpoint) -> ToolCommand {
        ToolCommand::new(&self.tools.fetch_tool, "fetch-title").args([
            "--proxy".to_string(),
            proxy.url(),
            "--dump-json".to_string(),
            self.identifier.clone(),
        ])
    }

    fn on_empty_title(&mut self) -> Result<String, OperationError> {
        self.empty_titles += 1;
        match self.tools.title_fallback_after {
            Some(limit) if self.empty_titles >= limit => {
                warn!(
                    identifier = %self.identifier,
                    attempts = self.empty_titles,
                    "Title stayed empty, using identifier instead"
                );
                Ok(self.identifier.clone())
            }
            _ => Err(OperationError::retryable("fetched title is empty")),
        }
    }
}

#[async_trait]
impl CircuitOperation for TitleFetcher {
    type Output = String;

    fn purpose(&self) -> &str {
        "fetch-title"
    }

    async fn attempt(
        &mut self,
        proxy: &ProxyEndpoint,
        token: &CancellationToken,
    ) -> Result<String, OperationError> {
        let process_token = token.child_token();
        let _guard = process_token.clone().drop_guard();

        let mut process = self
            .runner
            .spawn(&self.command(proxy), process_token.clone())
            .map_err(|e| OperationError::retryable(format!("failed to launch title lookup: {e}")))?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| OperationError::retryable("title lookup has no stdout"))?;

        let mut record = None;
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    record = Some(line);
                    break;
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(OperationError::retryable(format!(
                        "failed to read info record: {e}"
                    )));
                }
            }
        }

        // Only the first record is needed.
        drop(lines);
        process_token.cancel();
        let exit = process.wait().await.map_err(|e| {
            OperationError::retryable(format!("failed to wait for title lookup: {e}"))
        })?;

        let Some(record) = record else {
            return Err(OperationError::retryable(format!(
                "title lookup printed no info record ({exit})"
            )));
        };
        let info: VideoInfo = serde_json::from_str(&record)
            .map_err(|e| OperationError::retryable(format!("malformed info record: {e}")))?;

        let title = info.title.trim();
        if title.is_empty() {
            return self.on_empty_title();
        }

        info!(title, "Fetched title");
        self.empty_titles = 0;
        Ok(title.to_string())
    }
}
