//! The exit-reason taxonomy (§6, §7) as a single typed error enum.
//!
//! Collaborator-facing helpers return `anyhow::Result` the way the teacher's
//! `ManagedService`/`RecordStore` methods do; call sites that must let a
//! caller distinguish a reason convert into [`OrchestratorError`] at the
//! orchestrator boundary.

use vbucket_core::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    // --- planning errors: refuse to start ---------------------------------
    #[error("no kv nodes would remain after this change")]
    NoKvNodesLeft,

    #[error("delta recovery is not possible for the requested nodes/buckets")]
    DeltaRecoveryNotPossible,

    #[error("node {0} cannot be drained gracefully: it would remain a chain head")]
    NotGraceful(NodeId),

    #[error("node {0} does not run the kv service")]
    NonKvNode(NodeId),

    #[error("node {0} is the last active kv node")]
    LastNode(NodeId),

    #[error("node {0} is not a member of this cluster")]
    UnknownNode(NodeId),

    #[error("server group assignment changed while generating a map")]
    ServerGroupsRace,

    // --- precondition errors: abort before any move -----------------------
    #[error("failed to synchronize configuration to keep-nodes before rebalance")]
    PreRebalanceConfigSynchronizationFailed,

    #[error("failed to clean up excess buckets on nodes: {failed_nodes:?}")]
    BucketsCleanupFailed { failed_nodes: Vec<NodeId> },

    #[error("timed out waiting for bucket shutdown on nodes: {failed_nodes:?}")]
    BucketsShutdownWaitFailed { failed_nodes: Vec<NodeId> },

    // --- execution errors: abort mid-rebalance -----------------------------
    #[error("vbucket mover for bucket {bucket} crashed: {reason}")]
    MoverCrashed { bucket: String, reason: String },

    #[error("pre-rebalance janitor run failed on nodes: {failed_nodes:?}")]
    PreRebalanceJanitorRunFailed { failed_nodes: Vec<NodeId> },

    #[error("not all nodes reported ready for bucket {bucket} in time")]
    NotAllNodesAreReadyYet { bucket: String },

    // --- verification errors: abort after moves ----------------------------
    #[error("replication verification found unexpected replicas for bucket {bucket}")]
    BadReplicas { bucket: String },

    #[error("replication verification could not reach all nodes for bucket {bucket}")]
    BadReplicasDueToBadResults { bucket: String },

    // --- cancellation: always a clean exit, never logged as a failure -----
    #[error("stopped")]
    Stopped,

    // --- collaborator-boundary passthrough ---------------------------------
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// True for the one variant that must never be logged as a failure (§7).
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, OrchestratorError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_is_the_only_cancellation_variant() {
        assert!(OrchestratorError::Stopped.is_cancellation());
        assert!(!OrchestratorError::NoKvNodesLeft.is_cancellation());
    }

    #[test]
    fn collaborator_errors_wrap_anyhow() {
        let inner = anyhow::anyhow!("engine client unreachable");
        let err: OrchestratorError = inner.into();
        assert!(matches!(err, OrchestratorError::Collaborator(_)));
    }
}
