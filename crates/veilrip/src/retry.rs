//! Retry-with-rotation: the single reliability primitive of the engine.
//!
//! A [`CircuitOperation`] is attempted over a circuit; a retryable failure
//! throws that circuit away and repeats the attempt over a freshly acquired
//! one. Only cancellation or a fatal local error ends the loop early, and at
//! most one circuit is alive per running operation at any time.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::circuit::{Acquisition, Circuit, CircuitSupervisor, ProxyEndpoint};
use crate::error::{OperationError, Result};

/// A fallible operation that needs a circuit to run.
#[async_trait]
pub trait CircuitOperation: Send {
    type Output: Send;

    /// Short label used for logging and as the purpose of acquired circuits.
    fn purpose(&self) -> &str;

    async fn attempt(
        &mut self,
        proxy: &ProxyEndpoint,
        token: &CancellationToken,
    ) -> std::result::Result<Self::Output, OperationError>;
}

/// Terminal state of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// The operation succeeded over `circuit`, which now belongs to the caller.
    Success { value: T, circuit: Circuit },
    Cancelled,
}

impl<T> RetryOutcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn into_success(self) -> Option<(T, Circuit)> {
        match self {
            Self::Success { value, circuit } => Some((value, circuit)),
            Self::Cancelled => None,
        }
    }
}

/// Runs [`CircuitOperation`]s, rotating circuits on every retryable failure.
#[derive(Clone, Copy)]
pub struct RetryingOperation<'a> {
    supervisor: &'a CircuitSupervisor,
    token: &'a CancellationToken,
}

impl<'a> RetryingOperation<'a> {
    pub fn new(supervisor: &'a CircuitSupervisor, token: &'a CancellationToken) -> Self {
        Self { supervisor, token }
    }

    /// Attempt `op` until it succeeds, fails fatally, or the token is cancelled.
    ///
    /// `initial` is used for the first attempt instead of acquiring a circuit.
    pub async fn run<O>(
        &self,
        op: &mut O,
        initial: Option<Circuit>,
    ) -> Result<RetryOutcome<O::Output>>
    where
        O: CircuitOperation,
    {
        let mut next = initial;
        let mut attempt: u32 = 0;

        loop {
            let mut circuit = match next.take() {
                Some(circuit) => circuit,
                None => match self.supervisor.acquire(self.token, op.purpose()).await {
                    Acquisition::Ready(circuit) => circuit,
                    Acquisition::Cancelled => return Ok(RetryOutcome::Cancelled),
                },
            };
            attempt += 1;

            let proxy = circuit.proxy();
            debug!(purpose = op.purpose(), attempt, %proxy, "Running attempt");

            match op.attempt(&proxy, self.token).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(purpose = op.purpose(), attempt, "Succeeded after rotation");
                    }
                    return Ok(RetryOutcome::Success { value, circuit });
                }
                Err(OperationError::Fatal(e)) => {
                    circuit.stop().await;
                    return Err(e);
                }
                Err(OperationError::Retryable(reason)) => {
                    warn!(
                        purpose = op.purpose(),
                        attempt,
                        port = circuit.port(),
                        %reason,
                        "Attempt failed, rotating circuit"
                    );
                    circuit.stop().await;
                    if self.token.is_cancelled() {
                        return Ok(RetryOutcome::Cancelled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use super::*;
    use crate::circuit::{CircuitLauncher, SequentialPortSelector};
    use crate::config::CircuitConfig;
    use crate::error::VeilripError;
    use crate::test_utils::{ScriptedRunner, ready_tor};

    /// Replays a fixed list of attempt results and records the ports used.
    struct Scripted {
        results: VecDeque<std::result::Result<&'static str, OperationError>>,
        ports: Vec<u16>,
        cancel_on_failure: Option<CancellationToken>,
    }

    impl Scripted {
        fn new(results: Vec<std::result::Result<&'static str, OperationError>>) -> Self {
            Self {
                results: results.into(),
                ports: Vec::new(),
                cancel_on_failure: None,
            }
        }
    }

    #[async_trait]
    impl CircuitOperation for Scripted {
        type Output = &'static str;

        fn purpose(&self) -> &str {
            "scripted"
        }

        async fn attempt(
            &mut self,
            proxy: &ProxyEndpoint,
            _token: &CancellationToken,
        ) -> std::result::Result<&'static str, OperationError> {
            self.ports.push(proxy.port());
            let result = self
                .results
                .pop_front()
                .unwrap_or_else(|| Err(OperationError::retryable("script exhausted")));
            if let (Err(_), Some(token)) = (&result, &self.cancel_on_failure) {
                token.cancel();
            }
            result
        }
    }

    fn supervisor(runner: Arc<ScriptedRunner>, root: &std::path::Path) -> CircuitSupervisor {
        let config = CircuitConfig {
            data_root: root.to_path_buf(),
            probe_port: false,
            ..CircuitConfig::default()
        };
        CircuitSupervisor::new(CircuitLauncher::new(
            runner,
            Arc::new(SequentialPortSelector::new(32000..32100)),
            config,
        ))
    }

    #[tokio::test]
    async fn n_failures_then_success_acquires_n_plus_one_circuits() {
        let temp = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on("tor", ready_tor()));
        let supervisor = supervisor(runner.clone(), temp.path());
        let token = CancellationToken::new();
        let mut op = Scripted::new(vec![
            Err(OperationError::retryable("exit code 1")),
            Err(OperationError::retryable("connection reset")),
            Err(OperationError::retryable("exit code 1")),
            Ok("done"),
        ]);

        let outcome = RetryingOperation::new(&supervisor, &token)
            .run(&mut op, None)
            .await
            .unwrap();

        let (value, mut circuit) = outcome.into_success().expect("operation should succeed");
        assert_eq!(value, "done");
        assert_eq!(supervisor.acquired_count(), 4);
        assert_eq!(runner.count("tor"), 4);
        assert_eq!(op.ports, vec![32000, 32001, 32002, 32003]);
        // The three failed circuits were each torn down once; the winner is still alive.
        assert_eq!(runner.terminations(), 3);
        assert_eq!(circuit.port(), 32003);
        assert!(!circuit.is_stopped());

        circuit.stop().await;
        assert_eq!(runner.terminations(), 4);
    }

    #[tokio::test]
    async fn initial_circuit_is_used_first() {
        let temp = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on("tor", ready_tor()));
        let supervisor = supervisor(runner.clone(), temp.path());
        let token = CancellationToken::new();
        let Acquisition::Ready(initial) = supervisor.acquire(&token, "seed").await else {
            panic!("expected a ready circuit");
        };
        let mut op = Scripted::new(vec![Ok("reused")]);

        let outcome = RetryingOperation::new(&supervisor, &token)
            .run(&mut op, Some(initial))
            .await
            .unwrap();

        let (_, mut circuit) = outcome.into_success().unwrap();
        assert_eq!(runner.count("tor"), 1);
        assert_eq!(op.ports, vec![32000]);
        circuit.stop().await;
    }

    #[tokio::test]
    async fn cancellation_after_failure_stops_rotation() {
        let temp = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on("tor", ready_tor()));
        let supervisor = supervisor(runner.clone(), temp.path());
        let token = CancellationToken::new();
        let mut op = Scripted::new(vec![Err(OperationError::retryable("exit code 1"))]);
        op.cancel_on_failure = Some(token.clone());

        let outcome = RetryingOperation::new(&supervisor, &token)
            .run(&mut op, None)
            .await
            .unwrap();

        assert!(outcome.is_cancelled());
        assert_eq!(runner.count("tor"), 1);
        assert_eq!(runner.terminations(), 1);
    }

    #[tokio::test]
    async fn fatal_error_is_returned_without_rotation() {
        let temp = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on("tor", ready_tor()));
        let supervisor = supervisor(runner.clone(), temp.path());
        let token = CancellationToken::new();
        let mut op = Scripted::new(vec![Err(OperationError::Fatal(
            VeilripError::configuration("broken"),
        ))]);

        let result = RetryingOperation::new(&supervisor, &token)
            .run(&mut op, None)
            .await;

        assert!(matches!(result, Err(VeilripError::Configuration { .. })));
        assert_eq!(runner.count("tor"), 1);
        assert_eq!(runner.terminations(), 1);
    }
}
