//! Process helpers shared across the workspace.
//!
//! Besides the command constructor this crate owns the [`ToolRunner`] seam:
//! every external tool (circuit client, fetch tool, muxer) is spawned through
//! it, supervised by a waiter task that honours a cancellation token, and has
//! its diagnostic output drained into `tracing`.

use std::ffi::OsStr;

mod records;
mod runner;

pub use records::{DrainLevel, RecordReader, drain_records};
pub use runner::{
    BoxedReader, RunningTool, StdoutMode, SystemRunner, ToolCommand, ToolExit, ToolRunner,
};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}
