//! Scripted stand-ins for external tools.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use futures::FutureExt;
use parking_lot::Mutex;
use process_utils::{BoxedReader, RunningTool, ToolCommand, ToolExit, ToolRunner};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

pub(crate) type SpawnFn =
    Arc<dyn Fn(&ToolCommand, CancellationToken) -> io::Result<RunningTool> + Send + Sync>;

/// How a scripted process behaves.
#[derive(Clone)]
pub(crate) enum ToolBehavior {
    /// `spawn` itself fails.
    SpawnError,
    /// Writes `stdout` and exits with `code`.
    Exit { stdout: Vec<u8>, code: i32 },
    /// Writes `stdout`, then fails the read; exits with code 1.
    BrokenStream { stdout: Vec<u8> },
    /// Writes `stdout` and stays alive until cancelled.
    UntilCancelled { stdout: Vec<u8> },
    /// Never writes anything and never exits until cancelled.
    Silent,
    Custom(SpawnFn),
}

pub(crate) fn scripted_tor(lines: &[&str]) -> ToolBehavior {
    ToolBehavior::UntilCancelled {
        stdout: lines.join("\n").into_bytes(),
    }
}

pub(crate) fn ready_tor() -> ToolBehavior {
    scripted_tor(&[
        "[notice] Bootstrapped 90% (ap_handshake_done): Handshake finished with a relay",
        "[notice] Bootstrapped 100% (done): Done",
    ])
}

pub(crate) fn silent_tor() -> ToolBehavior {
    ToolBehavior::Silent
}

pub(crate) fn exits(stdout: impl Into<Vec<u8>>, code: i32) -> ToolBehavior {
    ToolBehavior::Exit {
        stdout: stdout.into(),
        code,
    }
}

impl ToolBehavior {
    fn spawn(
        &self,
        command: &ToolCommand,
        token: CancellationToken,
        terminations: Arc<AtomicUsize>,
    ) -> io::Result<RunningTool> {
        let label = command.label.clone();
        match self {
            Self::SpawnError => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "scripted spawn failure",
            )),
            Self::Exit { stdout, code } => {
                let code = *code;
                Ok(RunningTool::new(
                    label,
                    Some(Box::new(io::Cursor::new(stdout.clone())) as BoxedReader),
                    async move { Ok(ToolExit::code(code)) }.boxed(),
                ))
            }
            Self::BrokenStream { stdout } => Ok(RunningTool::new(
                label,
                Some(Box::new(FailingReader::new(stdout.clone())) as BoxedReader),
                async move { Ok(ToolExit::code(1)) }.boxed(),
            )),
            Self::UntilCancelled { stdout } => Ok(RunningTool::new(
                label,
                Some(Box::new(io::Cursor::new(stdout.clone())) as BoxedReader),
                async move {
                    token.cancelled().await;
                    terminations.fetch_add(1, Ordering::SeqCst);
                    Ok(ToolExit::terminated())
                }
                .boxed(),
            )),
            Self::Silent => {
                let (writer, reader) = tokio::io::duplex(64);
                // Closes stdout on cancellation even if nobody waits for the exit.
                let waiter = tokio::spawn(async move {
                    token.cancelled().await;
                    drop(writer);
                    terminations.fetch_add(1, Ordering::SeqCst);
                });
                Ok(RunningTool::new(
                    label,
                    Some(Box::new(reader) as BoxedReader),
                    async move {
                        waiter.await.map_err(io::Error::other)?;
                        Ok(ToolExit::terminated())
                    }
                    .boxed(),
                ))
            }
            Self::Custom(spawn) => spawn(command, token),
        }
    }
}

type Matcher = Box<dyn Fn(&ToolCommand) -> bool + Send + Sync>;

struct Route {
    matcher: Matcher,
    script: VecDeque<ToolBehavior>,
}

impl Route {
    /// Pops the next behavior, repeating the last one forever.
    fn next(&mut self) -> Option<ToolBehavior> {
        if self.script.len() > 1 {
            self.script.pop_front()
        } else {
            self.script.front().cloned()
        }
    }
}

/// [`ToolRunner`] that replays scripted behaviors and records every call.
pub(crate) struct ScriptedRunner {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<ToolCommand>>,
    terminations: Arc<AtomicUsize>,
}

impl ScriptedRunner {
    pub(crate) fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            terminations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn on(self, program: &str, behavior: ToolBehavior) -> Self {
        self.on_sequence(program, vec![behavior])
    }

    pub(crate) fn on_sequence(self, program: &str, behaviors: Vec<ToolBehavior>) -> Self {
        let program = program.to_string();
        self.on_sequence_when(move |c| c.program == program, behaviors)
    }

    pub(crate) fn on_when(
        self,
        matcher: impl Fn(&ToolCommand) -> bool + Send + Sync + 'static,
        behavior: ToolBehavior,
    ) -> Self {
        self.on_sequence_when(matcher, vec![behavior])
    }

    pub(crate) fn on_sequence_when(
        self,
        matcher: impl Fn(&ToolCommand) -> bool + Send + Sync + 'static,
        behaviors: Vec<ToolBehavior>,
    ) -> Self {
        self.routes.lock().push(Route {
            matcher: Box::new(matcher),
            script: behaviors.into(),
        });
        self
    }

    pub(crate) fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().clone()
    }

    pub(crate) fn count(&self, program: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.program == program).count()
    }

    /// Long-running scripted processes that were stopped through their token.
    pub(crate) fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

impl ToolRunner for ScriptedRunner {
    fn spawn(&self, command: &ToolCommand, token: CancellationToken) -> io::Result<RunningTool> {
        self.calls.lock().push(command.clone());
        let behavior = self
            .routes
            .lock()
            .iter_mut()
            .find(|route| (route.matcher)(command))
            .and_then(Route::next);

        match behavior {
            Some(behavior) => behavior.spawn(command, token, self.terminations.clone()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no script for {}", command.program),
            )),
        }
    }
}

/// Yields its data, then fails every further read.
struct FailingReader {
    data: io::Cursor<Vec<u8>>,
}

impl FailingReader {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data: io::Cursor::new(data),
        }
    }
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let remaining = self.data.get_ref().len() as u64 - self.data.position();
        if remaining == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by circuit",
            )));
        }
        Pin::new(&mut self.data).poll_read(cx, buf)
    }
}
