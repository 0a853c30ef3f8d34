//! Record-oriented reading of child process output.
//!
//! Progress-style tools rewrite the current terminal line with `\r`. When the
//! stream is piped those updates are not newline-terminated, so a plain
//! `lines()` reader would hold them back until the next `\n`. [`RecordReader`]
//! splits on either delimiter instead.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info, trace};

/// Yields trimmed, non-empty text records delimited by `\n` or `\r`.
pub struct RecordReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
}

impl<R> RecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            pending: Vec::new(),
        }
    }

    /// Returns the next record, or `None` once the stream is exhausted.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            let buf = self.inner.fill_buf().await?;
            if buf.is_empty() {
                return Ok(self.take_pending());
            }

            match buf.iter().position(|b| matches!(b, b'\n' | b'\r')) {
                Some(idx) => {
                    self.pending.extend_from_slice(&buf[..idx]);
                    self.inner.consume(idx + 1);
                    if let Some(record) = self.take_pending() {
                        return Ok(Some(record));
                    }
                }
                None => {
                    let len = buf.len();
                    self.pending.extend_from_slice(buf);
                    self.inner.consume(len);
                }
            }
        }
    }

    fn take_pending(&mut self) -> Option<String> {
        let record = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!record.is_empty()).then_some(record)
    }
}

/// Level at which drained records are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainLevel {
    Info,
    Debug,
    Trace,
}

/// Forward every record of `records` to the log, tagged with `label`.
///
/// Returns once the stream ends or fails to read.
pub async fn drain_records<R>(mut records: RecordReader<R>, label: String, level: DrainLevel)
where
    R: AsyncRead + Unpin,
{
    loop {
        match records.next_record().await {
            Ok(Some(line)) => match level {
                DrainLevel::Info => info!(process = %label, "{line}"),
                DrainLevel::Debug => debug!(process = %label, "{line}"),
                DrainLevel::Trace => trace!(process = %label, "{line}"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(process = %label, error = %e, "Output stream read failed");
                break;
            }
        }
    }
}
