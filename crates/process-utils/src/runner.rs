//! Spawning and supervising external tools.
//!
//! A spawned tool is represented by a [`RunningTool`]: an optional captured
//! stdout plus an exit future. The exit future resolves only after the waiter
//! task and every drain task belonging to the process have finished, so a
//! resolved exit means the process and its output tasks are fully gone.

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::records::{DrainLevel, RecordReader, drain_records};

/// Boxed byte stream handed out for a captured stdout.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// What to do with a tool's standard output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdoutMode {
    /// Hand the stream to the caller through [`RunningTool::take_stdout`].
    #[default]
    Capture,
    /// Drain it into the log like stderr.
    Log,
}

/// Description of one external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Tag attached to every log line produced by the process.
    pub label: String,
    pub stdout: StdoutMode,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            label: label.into(),
            stdout: StdoutMode::Capture,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn log_stdout(mut self) -> Self {
        self.stdout = StdoutMode::Log;
        self
    }

    /// Whether `flag` appears verbatim among the arguments.
    pub fn has_arg(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }

    /// The argument following the first occurrence of `flag`.
    pub fn arg_after(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|idx| self.args.get(idx + 1))
            .map(String::as_str)
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolExit {
    /// Exit code, `None` when the process died from a signal.
    pub code: Option<i32>,
    /// Set when the process was stopped through its cancellation token.
    pub terminated: bool,
}

impl ToolExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            terminated: false,
        }
    }

    pub fn terminated() -> Self {
        Self {
            code: None,
            terminated: true,
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            terminated: false,
        }
    }

    pub fn success(&self) -> bool {
        !self.terminated && self.code == Some(0)
    }
}

impl fmt::Display for ToolExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.terminated, self.code) {
            (true, _) => write!(f, "terminated"),
            (false, Some(code)) => write!(f, "exit code {code}"),
            (false, None) => write!(f, "killed by signal"),
        }
    }
}

/// A spawned tool whose lifetime is tied to a cancellation token.
pub struct RunningTool {
    label: String,
    stdout: Option<BoxedReader>,
    exit: BoxFuture<'static, io::Result<ToolExit>>,
}

impl RunningTool {
    pub fn new(
        label: impl Into<String>,
        stdout: Option<BoxedReader>,
        exit: BoxFuture<'static, io::Result<ToolExit>>,
    ) -> Self {
        Self {
            label: label.into(),
            stdout,
            exit,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Take the captured stdout. Returns `None` on the second call or when
    /// stdout was configured to be logged.
    pub fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout.take()
    }

    /// Wait for the process and all of its drain tasks to finish.
    pub async fn wait(self) -> io::Result<ToolExit> {
        // Dropping stdout first lets a producer blocked on a full pipe fail fast.
        drop(self.stdout);
        self.exit.await
    }
}

impl fmt::Debug for RunningTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningTool")
            .field("label", &self.label)
            .field("stdout_captured", &self.stdout.is_some())
            .finish()
    }
}

/// Spawns external tools.
///
/// Cancelling the token handed to [`ToolRunner::spawn`] must stop the process.
pub trait ToolRunner: Send + Sync {
    fn spawn(&self, command: &ToolCommand, token: CancellationToken) -> io::Result<RunningTool>;
}

/// [`ToolRunner`] backed by real operating-system processes.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    grace_period: Duration,
}

impl SystemRunner {
    pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self::with_grace_period(Self::DEFAULT_GRACE_PERIOD)
    }

    /// Time a process gets to exit after the termination signal before it is killed.
    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self { grace_period }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRunner for SystemRunner {
    fn spawn(&self, command: &ToolCommand, token: CancellationToken) -> io::Result<RunningTool> {
        debug!(
            process = %command.label,
            program = %command.program,
            args = ?command.args,
            "Spawning process"
        );

        let mut cmd = crate::tokio_command(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;

        let mut drains: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stderr) = child.stderr.take() {
            drains.push(tokio::spawn(drain_records(
                RecordReader::new(stderr),
                command.label.clone(),
                DrainLevel::Info,
            )));
        }

        let stdout = child.stdout.take();
        let stdout: Option<BoxedReader> = match command.stdout {
            StdoutMode::Capture => stdout.map(|s| Box::new(s) as BoxedReader),
            StdoutMode::Log => {
                if let Some(s) = stdout {
                    drains.push(tokio::spawn(drain_records(
                        RecordReader::new(s),
                        command.label.clone(),
                        DrainLevel::Info,
                    )));
                }
                None
            }
        };

        let label = command.label.clone();
        let waiter = tokio::spawn(supervise(child, token, self.grace_period, label.clone()));

        let exit = async move {
            let result = match waiter.await {
                Ok(result) => result,
                Err(e) => Err(io::Error::other(format!("process waiter failed: {e}"))),
            };
            for drain in drains {
                let _ = drain.await;
            }
            result
        }
        .boxed();

        Ok(RunningTool::new(label, stdout, exit))
    }
}

async fn supervise(
    mut child: Child,
    token: CancellationToken,
    grace_period: Duration,
    label: String,
) -> io::Result<ToolExit> {
    // Cancellation wins when the process exits at the same moment.
    tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!(process = %label, "Cancellation requested, terminating process");
            terminate(&mut child, grace_period, &label).await;
            Ok(ToolExit::terminated())
        }
        status = child.wait() => {
            let exit = ToolExit::from_status(status?);
            if !exit.success() {
                debug!(process = %label, %exit, "Process exited unsuccessfully");
            }
            Ok(exit)
        }
    }
}

/// Ask `child` to exit, escalating to a kill once `grace_period` has elapsed.
async fn terminate(child: &mut Child, grace_period: Duration, label: &str) {
    if !send_terminate(child) {
        let _ = child.kill().await;
        return;
    }

    if tokio::time::timeout(grace_period, child.wait()).await.is_err() {
        warn!(process = %label, "Process ignored termination signal, killing it");
        let _ = child.kill().await;
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: `pid` belongs to a child we have not reaped yet.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) -> bool {
    false
}
