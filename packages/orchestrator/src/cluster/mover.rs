//! The per-bucket vbucket mover (§4.4): drives one map transition via the
//! engine client, honoring parallelism backpressure and cancellation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vbucket_core::{Chain, NodeId, VbucketMap};

use crate::collab::engine_client::{EngineClient, VbucketState};
use crate::error::OrchestratorError;
use crate::supervision::drain::DrainTracker;
use crate::supervision::worker::{ManagedWorker, WorkerExit};

/// One vbucket's pending transition.
#[derive(Debug, Clone)]
pub struct PendingMove {
    pub vbucket_id: u16,
    pub current: Chain,
    pub target: Chain,
}

/// Vbuckets whose chain actually changes between `current` and `target`
/// (§4.4 -- the mover never touches a vbucket that is already on target).
#[must_use]
pub fn pending_moves(current: &VbucketMap, target: &VbucketMap) -> Vec<PendingMove> {
    current
        .iter()
        .zip(target.iter())
        .filter(|((_, cur), (_, tgt))| cur != tgt)
        .map(|((vbucket_id, cur), (_, tgt))| PendingMove {
            vbucket_id,
            current: cur.clone(),
            target: tgt.clone(),
        })
        .collect()
}

/// Orders pending moves: master-changed transitions first (frees the old
/// master sooner), then by ascending chain distance, tie-broken by vbucket
/// id for determinism (§4.4).
#[must_use]
pub fn order_moves(mut moves: Vec<PendingMove>) -> Vec<PendingMove> {
    moves.sort_by(|a, b| {
        let master_changed_a = a.current.master() != a.target.master();
        let master_changed_b = b.current.master() != b.target.master();
        master_changed_b
            .cmp(&master_changed_a)
            .then_with(|| a.current.distance(&a.target).cmp(&b.current.distance(&b.target)))
            .then_with(|| a.vbucket_id.cmp(&b.vbucket_id))
    });
    moves
}

/// Progress callback: invoked with the fraction of pending moves completed
/// so far, per node (§4.4). Kept as a plain `Fn` rather than an async
/// callback since it only records a number.
pub type ProgressFn = Arc<dyn Fn(&BTreeMap<NodeId, f64>) + Send + Sync>;

/// Outcome of one mover run.
#[derive(Debug, Clone)]
pub struct MoverReport {
    pub completed: BTreeSet<u16>,
    pub stopped: bool,
}

/// Drives one bucket's transition from `current` to `target` via an
/// [`EngineClient`] (§4.4).
pub struct VbucketMover<E: EngineClient> {
    bucket: String,
    engine: Arc<E>,
    current: VbucketMap,
    target: VbucketMap,
    max_parallel_per_pair: usize,
    progress: Option<ProgressFn>,
    drain: DrainTracker,
}

impl<E: EngineClient + 'static> VbucketMover<E> {
    #[must_use]
    pub fn new(
        bucket: impl Into<String>,
        engine: Arc<E>,
        current: VbucketMap,
        target: VbucketMap,
        max_parallel_per_pair: usize,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            engine,
            current,
            target,
            max_parallel_per_pair: max_parallel_per_pair.max(1),
            progress: None,
            drain: DrainTracker::new(),
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Bounded-time-cancellable run: stops initiating new transitions once
    /// `cancel` fires, lets in-flight transitions finish, and reports which
    /// vbuckets completed (§5 cancellation model).
    pub async fn run(&self, cancel: CancellationToken) -> Result<MoverReport, OrchestratorError> {
        let moves = order_moves(pending_moves(&self.current, &self.target));
        let total = moves.len();
        let completed: Arc<parking_lot::Mutex<BTreeSet<u16>>> =
            Arc::new(parking_lot::Mutex::new(BTreeSet::new()));
        let semaphores: Arc<DashMap<(Option<NodeId>, Option<NodeId>), Arc<Semaphore>>> =
            Arc::new(DashMap::new());

        let mut handles = Vec::with_capacity(moves.len());
        let mut stopped = false;

        for mv in moves {
            if cancel.is_cancelled() {
                stopped = true;
                break;
            }

            let key = (mv.current.master().cloned(), mv.target.master().cloned());
            let sem = semaphores
                .entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_parallel_per_pair)))
                .clone();

            let engine = Arc::clone(&self.engine);
            let bucket = self.bucket.clone();
            let completed = Arc::clone(&completed);
            let drain = self.drain.clone();
            let child_cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore not closed");
                let _guard = drain.guard();
                if child_cancel.is_cancelled() {
                    return Ok(());
                }
                if let Err(err) = run_one_move(engine.as_ref(), &bucket, &mv).await {
                    warn!(bucket, vbucket_id = mv.vbucket_id, error = %err, "vbucket move failed");
                    return Err(err);
                }
                completed.lock().insert(mv.vbucket_id);
                info!(bucket, vbucket_id = mv.vbucket_id, "vbucket move completed");
                Ok(())
            }));
        }

        let mut crash: Option<anyhow::Error> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    crash.get_or_insert(err);
                }
                Err(join_err) => {
                    crash.get_or_insert_with(|| anyhow::anyhow!(join_err));
                }
            }
        }

        if let Some(err) = crash {
            return Err(OrchestratorError::MoverCrashed {
                bucket: self.bucket.clone(),
                reason: err.to_string(),
            });
        }

        let completed = Arc::try_unwrap(completed).map(|m| m.into_inner()).unwrap_or_default();
        if let Some(progress) = &self.progress {
            let fraction = if total == 0 { 1.0 } else { completed.len() as f64 / total as f64 };
            let mut report = BTreeMap::new();
            if let Some(node) = self.target.chains().first().and_then(Chain::master) {
                report.insert(node.clone(), fraction);
            }
            progress(&report);
        }

        Ok(MoverReport {
            completed,
            stopped: stopped || cancel.is_cancelled(),
        })
    }
}

async fn run_one_move<E: EngineClient>(
    engine: &E,
    bucket: &str,
    mv: &PendingMove,
) -> anyhow::Result<()> {
    // ACTIVE_ON_CUR -> REPLICAS_READY: bring target replicas up to date.
    for replica in mv.target.replicas() {
        engine
            .set_vbucket_state(replica, bucket, mv.vbucket_id, VbucketState::Replica)
            .await?;
        if let Some(master) = mv.target.master() {
            engine.start_replication(master, replica, bucket, mv.vbucket_id).await?;
        }
        engine
            .wait_for_replication_drain(replica, bucket, mv.vbucket_id)
            .await?;
    }

    // REPLICAS_READY -> ACTIVE_ON_NEW: takeover on the new master.
    if let Some(new_master) = mv.target.master() {
        engine
            .set_vbucket_state(new_master, bucket, mv.vbucket_id, VbucketState::Active)
            .await?;
    }

    // ACTIVE_ON_NEW -> CLEAN: delete on nodes no longer in the target chain.
    for old_node in mv.current.slots().iter().flatten() {
        if !mv.target.contains(old_node) {
            engine.delete_vbucket(old_node, bucket, mv.vbucket_id).await?;
        }
    }

    Ok(())
}

/// Adapts a [`VbucketMover`] run to the [`ManagedWorker`] interface so it
/// can be driven by a [`crate::supervision::worker::Supervisor`] under a
/// no-restart policy (§5, §10.6).
pub struct MoverWorker<E: EngineClient> {
    mover: VbucketMover<E>,
    result: Option<MoverReport>,
}

impl<E: EngineClient + 'static> MoverWorker<E> {
    #[must_use]
    pub fn new(mover: VbucketMover<E>) -> Self {
        Self { mover, result: None }
    }

    #[must_use]
    pub fn into_report(self) -> Option<MoverReport> {
        self.result
    }
}

#[async_trait]
impl<E: EngineClient + 'static> ManagedWorker for MoverWorker<E> {
    fn name(&self) -> &'static str {
        "vbucket-mover"
    }

    async fn run(&mut self, cancel: CancellationToken) -> Result<WorkerExit, OrchestratorError> {
        let report = self.mover.run(cancel).await?;
        let stopped = report.stopped;
        self.result = Some(report);
        Ok(if stopped { WorkerExit::Stopped } else { WorkerExit::Normal })
    }
}
