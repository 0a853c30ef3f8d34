//! Named pipes carrying fetched tracks into the muxer.
//!
//! A [`TrackChannel`] owns the FIFO node on disk and removes it when dropped.
//! Writers are opened with [`open_channel_writer`], which never blocks the
//! runtime: opening a FIFO for writing fails with `ENXIO` while it has no
//! reader, so the open is retried on an interval until the muxer attaches or
//! the run is cancelled.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, VeilripError};
use crate::formats::TrackKind;

/// A FIFO node with one writer (a track streamer) and one reader (the muxer).
#[derive(Debug)]
pub struct TrackChannel {
    path: PathBuf,
    kind: TrackKind,
    removed: bool,
}

impl TrackChannel {
    /// Create the FIFO at `path`, replacing a stale FIFO left by an earlier run.
    pub fn create(path: impl Into<PathBuf>, kind: TrackKind) -> Result<Self> {
        let path = path.into();
        remove_stale_fifo(&path).map_err(|source| VeilripError::ChannelCreate {
            path: path.clone(),
            source,
        })?;
        mkfifo(&path).map_err(|source| VeilripError::ChannelCreate {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), kind = %kind, "Created track channel");

        Ok(Self {
            path,
            kind,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Remove the FIFO node. Idempotent; failures are logged.
    pub fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed track channel"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove track channel"
            ),
        }
    }
}

impl Drop for TrackChannel {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Open the FIFO at `path` for writing once a reader is attached.
///
/// Returns `Ok(None)` if `token` is cancelled while waiting for the reader.
pub async fn open_channel_writer(
    path: &Path,
    poll_interval: Duration,
    token: &CancellationToken,
) -> Result<Option<pipe::Sender>> {
    loop {
        if token.is_cancelled() {
            return Ok(None);
        }
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => {
                debug!(path = %path.display(), "Opened track channel for writing");
                return Ok(Some(sender));
            }
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                tokio::select! {
                    _ = token.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(source) => {
                return Err(VeilripError::ChannelOpen {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }
}

fn mkfifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn remove_stale_fifo(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => {
            debug!(path = %path.display(), "Removing stale track channel");
            std::fs::remove_file(path)
        }
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists and is not a FIFO",
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
