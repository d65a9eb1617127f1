//! The engine-client collaborator contract (§6) and an in-memory test double.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use dashmap::DashMap;
use vbucket_core::NodeId;

/// State of one vbucket as reported by a node's storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbucketState {
    Active,
    Replica,
    Pending,
    Dead,
}

/// Per-node data-plane operations the mover (§4.4) and janitor sweeps need.
/// A "zombie" vbucket is one whose reported state could not be classified in
/// time; `query_states` surfaces those separately so callers can retry or
/// treat them as bad results (§4.6).
#[async_trait]
pub trait EngineClient: Send + Sync {
    async fn query_states(
        &self,
        node: &NodeId,
        bucket: &str,
        vbuckets: &[u16],
    ) -> anyhow::Result<QueryStatesResult>;

    async fn set_vbucket_state(
        &self,
        node: &NodeId,
        bucket: &str,
        vbucket: u16,
        state: VbucketState,
    ) -> anyhow::Result<()>;

    async fn wait_for_replication_drain(
        &self,
        node: &NodeId,
        bucket: &str,
        vbucket: u16,
    ) -> anyhow::Result<()>;

    async fn delete_vbucket(&self, node: &NodeId, bucket: &str, vbucket: u16) -> anyhow::Result<()>;

    async fn list_active_buckets(&self, node: &NodeId) -> anyhow::Result<Vec<String>>;

    async fn delete_unused_bucket_files(&self, node: &NodeId, bucket: &str) -> anyhow::Result<()>;

    /// `(source, destination, vbucket)` edges currently replicating for
    /// `bucket` on `node`, consulted by replication verification (§4.6).
    async fn active_replicators(
        &self,
        node: &NodeId,
        bucket: &str,
    ) -> anyhow::Result<BTreeSet<(NodeId, NodeId, u16)>>;

    /// Tells the engine to start streaming `vbucket` from `src` to `dst`.
    /// Called once a destination node has been moved into
    /// [`VbucketState::Replica`] (§4.4); a real engine establishes this via
    /// its own replication protocol, `active_replicators` then reports the
    /// edge back once it is live.
    async fn start_replication(&self, src: &NodeId, dst: &NodeId, bucket: &str, vbucket: u16) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct QueryStatesResult {
    pub states: BTreeMap<u16, VbucketState>,
    pub zombies: BTreeSet<u16>,
}

/// In-memory `EngineClient`, grounded on the teacher's `DashMap`-backed
/// storage layer. Tests drive it directly via [`FakeEngineClient::set_replicating`]
/// rather than through a real data plane.
#[derive(Default)]
pub struct FakeEngineClient {
    states: DashMap<(NodeId, String, u16), VbucketState>,
    replicators: DashMap<String, BTreeSet<(NodeId, NodeId, u16)>>,
    active_buckets: DashMap<NodeId, BTreeSet<String>>,
    failing_nodes: DashMap<NodeId, ()>,
}

impl FakeEngineClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_active_bucket(&self, node: &NodeId, bucket: &str) {
        self.active_buckets
            .entry(node.clone())
            .or_default()
            .insert(bucket.to_string());
    }

    pub fn set_replicating(&self, bucket: &str, src: NodeId, dst: NodeId, vbucket: u16) {
        self.replicators
            .entry(bucket.to_string())
            .or_default()
            .insert((src, dst, vbucket));
    }

    pub fn stop_replicating(&self, bucket: &str, src: &NodeId, dst: &NodeId, vbucket: u16) {
        if let Some(mut set) = self.replicators.get_mut(bucket) {
            set.remove(&(src.clone(), dst.clone(), vbucket));
        }
    }

    /// Makes every subsequent call that touches `node` return an error, so
    /// tests can exercise the mover's fatal-error exit path (§4.4).
    pub fn fail_calls_to(&self, node: &NodeId) {
        self.failing_nodes.insert(node.clone(), ());
    }

    fn check_failure(&self, node: &NodeId) -> anyhow::Result<()> {
        if self.failing_nodes.contains_key(node) {
            anyhow::bail!("engine client call to {node:?} failed (injected)");
        }
        Ok(())
    }
}

#[async_trait]
impl EngineClient for FakeEngineClient {
    async fn query_states(
        &self,
        node: &NodeId,
        bucket: &str,
        vbuckets: &[u16],
    ) -> anyhow::Result<QueryStatesResult> {
        let mut result = QueryStatesResult::default();
        for &vb in vbuckets {
            let key = (node.clone(), bucket.to_string(), vb);
            if let Some(state) = self.states.get(&key) {
                result.states.insert(vb, *state);
            } else {
                result.states.insert(vb, VbucketState::Dead);
            }
        }
        Ok(result)
    }

    async fn set_vbucket_state(
        &self,
        node: &NodeId,
        bucket: &str,
        vbucket: u16,
        state: VbucketState,
    ) -> anyhow::Result<()> {
        self.check_failure(node)?;
        self.states
            .insert((node.clone(), bucket.to_string(), vbucket), state);
        self.seed_active_bucket(node, bucket);
        Ok(())
    }

    async fn wait_for_replication_drain(
        &self,
        _node: &NodeId,
        _bucket: &str,
        _vbucket: u16,
    ) -> anyhow::Result<()> {
        // The fake has no real replication lag to drain.
        Ok(())
    }

    async fn delete_vbucket(&self, node: &NodeId, bucket: &str, vbucket: u16) -> anyhow::Result<()> {
        self.states.remove(&(node.clone(), bucket.to_string(), vbucket));
        Ok(())
    }

    async fn list_active_buckets(&self, node: &NodeId) -> anyhow::Result<Vec<String>> {
        Ok(self
            .active_buckets
            .get(node)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_unused_bucket_files(&self, node: &NodeId, bucket: &str) -> anyhow::Result<()> {
        if let Some(mut set) = self.active_buckets.get_mut(node) {
            set.remove(bucket);
        }
        Ok(())
    }

    async fn active_replicators(
        &self,
        node: &NodeId,
        bucket: &str,
    ) -> anyhow::Result<BTreeSet<(NodeId, NodeId, u16)>> {
        Ok(self
            .replicators
            .get(bucket)
            .map(|set| {
                set.iter()
                    .filter(|(src, dst, _)| src == node || dst == node)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn start_replication(&self, src: &NodeId, dst: &NodeId, bucket: &str, vbucket: u16) -> anyhow::Result<()> {
        self.check_failure(src)?;
        self.check_failure(dst)?;
        self.set_replicating(bucket, src.clone(), dst.clone(), vbucket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }

    #[tokio::test]
    async fn unqueried_vbucket_reports_dead() {
        let client = FakeEngineClient::new();
        let result = client.query_states(&node("n1"), "default", &[0]).await.unwrap();
        assert_eq!(result.states.get(&0), Some(&VbucketState::Dead));
    }

    #[tokio::test]
    async fn set_vbucket_state_is_observed_by_query_states() {
        let client = FakeEngineClient::new();
        client
            .set_vbucket_state(&node("n1"), "default", 0, VbucketState::Active)
            .await
            .unwrap();
        let result = client.query_states(&node("n1"), "default", &[0]).await.unwrap();
        assert_eq!(result.states.get(&0), Some(&VbucketState::Active));
    }

    #[tokio::test]
    async fn active_replicators_filters_by_node() {
        let client = FakeEngineClient::new();
        client.set_replicating("default", node("n1"), node("n2"), 0);
        client.set_replicating("default", node("n2"), node("n3"), 1);

        let from_n1 = client.active_replicators(&node("n1"), "default").await.unwrap();
        assert_eq!(from_n1.len(), 1);
        assert!(from_n1.contains(&(node("n1"), node("n2"), 0)));

        let from_n2 = client.active_replicators(&node("n2"), "default").await.unwrap();
        assert_eq!(from_n2.len(), 2);
    }

    #[tokio::test]
    async fn stop_replicating_removes_the_edge() {
        let client = FakeEngineClient::new();
        client.set_replicating("default", node("n1"), node("n2"), 0);
        client.stop_replicating("default", &node("n1"), &node("n2"), 0);
        let edges = client.active_replicators(&node("n1"), "default").await.unwrap();
        assert!(edges.is_empty());
    }

    #[tokio::test]
    async fn fail_calls_to_makes_set_vbucket_state_error() {
        let client = FakeEngineClient::new();
        client.fail_calls_to(&node("n1"));
        let result = client
            .set_vbucket_state(&node("n1"), "default", 0, VbucketState::Active)
            .await;
        assert!(result.is_err());
        // Unaffected nodes are untouched.
        assert!(client
            .set_vbucket_state(&node("n2"), "default", 0, VbucketState::Active)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn delete_unused_bucket_files_removes_from_active_list() {
        let client = FakeEngineClient::new();
        client.seed_active_bucket(&node("n1"), "default");
        assert_eq!(client.list_active_buckets(&node("n1")).await.unwrap().len(), 1);
        client.delete_unused_bucket_files(&node("n1"), "default").await.unwrap();
        assert!(client.list_active_buckets(&node("n1")).await.unwrap().is_empty());
    }
}
