//! Supervised background workers.
//!
//! The source's supervision trees (link + trap-exit) are recast here as a
//! [`Supervisor`] owning a [`tokio_util::sync::CancellationToken`]-scoped
//! child task: parent-cancel forwards to the child, child failure surfaces
//! to the parent as a typed error, and a restart policy decides whether the
//! supervisor relaunches the worker or gives up (§5, §9).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::OrchestratorError;

/// How a worker exited its `run` loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Completed its unit of work.
    Normal,
    /// Exited because its cancellation token was triggered.
    Stopped,
}

/// A cancellable, named unit of work: a per-bucket rebalance, a vbucket
/// mover, a node heartbeat monitor.
#[async_trait]
pub trait ManagedWorker: Send + 'static {
    fn name(&self) -> &'static str;

    /// Runs until completion or until `cancel` is triggered. Implementations
    /// must check `cancel` at every suspension point (message receive, RPC
    /// call, timed wait) per the cancellation model in §5.
    async fn run(&mut self, cancel: CancellationToken) -> Result<WorkerExit, OrchestratorError>;
}

/// Restart policy applied when a supervised worker's `run` returns an error
/// other than cancellation.
#[derive(Debug, Clone, Copy)]
pub enum RestartPolicy {
    /// The rebalance and mover workers use this: a crash aborts the whole
    /// rebalance rather than silently retrying a partially-applied map.
    NoRestart,
    /// `one_for_one`: restart up to `max_restarts` times within `window`,
    /// then give up and propagate the last error. Used for the replication
    /// verification supervisor.
    OneForOne { max_restarts: u32, window: Duration },
}

/// Owns the cancellation token and join handle of one supervised worker.
pub struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<Result<WorkerExit, OrchestratorError>>,
}

impl Supervisor {
    /// Spawns `worker` under `policy`. The returned supervisor's `cancel()`
    /// propagates to the worker's `run` at its next suspension point.
    pub fn spawn<W: ManagedWorker>(mut worker: W, policy: RestartPolicy) -> Self {
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let name = worker.name();

        let handle = tokio::spawn(async move {
            let mut restarts: VecDeque<Instant> = VecDeque::new();
            loop {
                info!(worker = name, "worker starting");
                let outcome = worker.run(worker_cancel.clone()).await;
                match &outcome {
                    Ok(WorkerExit::Stopped) => {
                        info!(worker = name, "worker stopped on cancellation");
                        return outcome;
                    }
                    Ok(WorkerExit::Normal) => {
                        info!(worker = name, "worker finished normally");
                        return outcome;
                    }
                    Err(err) if err.is_cancellation() => {
                        info!(worker = name, "worker stopped on cancellation");
                        return Ok(WorkerExit::Stopped);
                    }
                    Err(err) => {
                        error!(worker = name, error = %err, "worker failed");
                        match policy {
                            RestartPolicy::NoRestart => return outcome,
                            RestartPolicy::OneForOne { max_restarts, window } => {
                                let now = Instant::now();
                                restarts.push_back(now);
                                while restarts
                                    .front()
                                    .is_some_and(|t| now.duration_since(*t) > window)
                                {
                                    restarts.pop_front();
                                }
                                if restarts.len() as u32 > max_restarts {
                                    error!(
                                        worker = name,
                                        "exceeded restart budget, propagating failure"
                                    );
                                    return outcome;
                                }
                                warn!(
                                    worker = name,
                                    restart_count = restarts.len(),
                                    "restarting worker"
                                );
                            }
                        }
                    }
                }
            }
        });

        Self { cancel, handle }
    }

    /// Requests cancellation. Does not wait for the worker to exit; call
    /// [`Supervisor::join`] (bounded by the caller's own timeout) for that.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Awaits the worker's final outcome.
    ///
    /// # Errors
    ///
    /// Returns the worker's own error, or an [`OrchestratorError::Collaborator`]
    /// wrapping a task-join failure (panic) if the worker task panicked.
    pub async fn join(self) -> Result<WorkerExit, OrchestratorError> {
        match self.handle.await {
            Ok(result) => result,
            Err(join_err) => Err(OrchestratorError::Collaborator(anyhow::anyhow!(join_err))),
        }
    }
}

/// Thread-safe handle to a running worker's cancellation token, shared with
/// callers that need to trigger `stop()` without owning the [`Supervisor`]
/// (e.g. the orchestrator's public service surface, §6).
#[derive(Clone)]
pub struct CancelHandle(Arc<Mutex<Option<CancellationToken>>>);

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    pub fn bind(&self, token: CancellationToken) {
        *self.0.lock() = Some(token);
    }

    pub fn clear(&self) {
        *self.0.lock() = None;
    }

    /// Sends `stop` to whichever worker is currently bound, if any.
    pub fn stop(&self) {
        if let Some(token) = self.0.lock().as_ref() {
            token.cancel();
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
