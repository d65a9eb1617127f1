//! Validation errors for the data model itself (not orchestration outcomes;
//! those live in `vbucket-orchestrator`'s `OrchestratorError`).

use thiserror::Error;

use crate::node::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("vbucket {vbucket_id}: chain length {actual} does not match expected {expected}")]
    ChainLengthMismatch {
        vbucket_id: u16,
        expected: usize,
        actual: usize,
    },

    #[error("vbucket {vbucket_id}: chain contains a duplicate node")]
    DuplicateNodeInChain { vbucket_id: u16 },

    #[error("vbucket {vbucket_id}: node {node} is not a member of this bucket's servers")]
    UnknownServer { vbucket_id: u16, node: NodeId },
}
