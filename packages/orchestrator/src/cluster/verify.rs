//! Replication verification (§4.6): confirms the engine's actual replicator
//! topology matches a target map before the map is committed.

use std::collections::BTreeSet;
use std::sync::Arc;

use vbucket_core::{NodeId, VbucketMap};

use crate::collab::engine_client::EngineClient;
use crate::error::OrchestratorError;

/// The `(source, destination, vbucket)` edges a correctly-replicating engine
/// should report for `map`: one edge per master-to-replica pair in each
/// chain (§4.6).
#[must_use]
pub fn expected_replicators(bucket_servers: &[NodeId], map: &VbucketMap) -> BTreeSet<(NodeId, NodeId, u16)> {
    let mut expected = BTreeSet::new();
    for (vbucket_id, chain) in map.iter() {
        let Some(master) = chain.master() else { continue };
        if !bucket_servers.contains(master) {
            continue;
        }
        for replica in chain.replicas() {
            expected.insert((master.clone(), replica.clone(), vbucket_id));
        }
    }
    expected
}

/// Queries every node in `keep` for its view of active replicators and
/// compares the union against `expected`. Missing edges are reported as
/// "bad replicas"; a node whose query itself failed is reported separately
/// so the caller can distinguish "replication not yet caught up" from
/// "couldn't even ask" (§4.6, §7).
///
/// # Errors
///
/// Returns [`OrchestratorError::BadReplicas`] if every node answered but the
/// actual replicator set is missing expected edges, or
/// [`OrchestratorError::BadReplicasDueToBadResults`] if one or more nodes
/// could not be queried at all.
pub async fn verify_replication<E: EngineClient>(
    engine: &E,
    bucket: &str,
    keep: &[NodeId],
    expected: &BTreeSet<(NodeId, NodeId, u16)>,
) -> Result<(), OrchestratorError> {
    let mut actual = BTreeSet::new();
    let mut bad_results = Vec::new();

    for node in keep {
        match engine.active_replicators(node, bucket).await {
            Ok(edges) => actual.extend(edges),
            Err(_) => bad_results.push(node.clone()),
        }
    }

    if !bad_results.is_empty() {
        return Err(OrchestratorError::BadReplicasDueToBadResults {
            bucket: bucket.to_string(),
        });
    }

    if !expected.is_subset(&actual) {
        return Err(OrchestratorError::BadReplicas {
            bucket: bucket.to_string(),
        });
    }

    Ok(())
}

/// Convenience wrapper bundling `expected_replicators` + `verify_replication`
/// for call sites that only have a servers list and a target map.
///
/// # Errors
///
/// See [`verify_replication`].
pub async fn verify_map_replication<E: EngineClient>(
    engine: Arc<E>,
    bucket: &str,
    servers: &[NodeId],
    target: &VbucketMap,
) -> Result<(), OrchestratorError> {
    let expected = expected_replicators(servers, target);
    verify_replication(engine.as_ref(), bucket, servers, &expected).await
}
