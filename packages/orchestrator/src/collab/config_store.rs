//! The config-store collaborator contract (§6) and an in-memory test double.

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use vbucket_core::{BucketConfig, MapHistory, MapHistoryEntry, NodeId, NodeMembership, ServerGroup};

/// The cluster's replicated key-value configuration store. Production
/// implementations replicate writes to every node and expose a
/// compare-and-set-flavored write path (§5); this crate only consumes the
/// surface described here.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_bucket(&self, bucket: &str) -> anyhow::Result<Option<BucketConfig>>;

    async fn set_bucket(&self, bucket: &str, config: BucketConfig) -> anyhow::Result<()>;

    /// Applies several bucket writes as a single atomic batch (used by delta
    /// recovery, §4.3, which must commit several transitional configs
    /// together).
    async fn set_multiple(&self, changes: Vec<(String, BucketConfig)>) -> anyhow::Result<()>;

    async fn get_membership(&self, node: &NodeId) -> anyhow::Result<Option<NodeMembership>>;

    async fn set_membership(&self, membership: NodeMembership) -> anyhow::Result<()>;

    async fn server_groups(&self) -> anyhow::Result<Vec<ServerGroup>>;

    async fn failover_vbuckets(
        &self,
        bucket: &str,
        node: &NodeId,
    ) -> anyhow::Result<Option<BTreeSet<u16>>>;

    async fn record_failover_vbuckets(
        &self,
        bucket: &str,
        node: NodeId,
        vbuckets: BTreeSet<u16>,
    ) -> anyhow::Result<()>;

    async fn clear_failover_vbuckets(&self, bucket: &str, node: &NodeId) -> anyhow::Result<()>;

    async fn push_map_history(&self, bucket: &str, entry: MapHistoryEntry) -> anyhow::Result<()>;

    /// Returns history most-recent-entry-last, mirroring `past_vbucket_maps`
    /// (§6).
    async fn past_vbucket_maps(&self, bucket: &str) -> anyhow::Result<Vec<MapHistoryEntry>>;

    /// Pushes locally buffered writes out. Production implementations batch
    /// writes and flush on a timer; the orchestrator calls this at explicit
    /// checkpoints (§4.5 step 1, step 8) to force visibility before blocking
    /// on `synchronize_remote`.
    async fn sync_announcements(&self) -> anyhow::Result<()>;

    /// Waits for `nodes` to observe the latest config. Returns the subset
    /// that failed to synchronize in time.
    async fn synchronize_remote(&self, nodes: &[NodeId]) -> anyhow::Result<Vec<NodeId>>;
}

/// Lock-free in-memory `ConfigStore`, grounded on the way the teacher's
/// `ClusterPartitionTable` layers a `DashMap` under a small typed API.
/// This is the only implementation this crate owns: a real config store is
/// an external collaborator (§1).
pub struct InMemoryConfigStore {
    buckets: DashMap<String, BucketConfig>,
    memberships: DashMap<NodeId, NodeMembership>,
    /// Swapped wholesale on every server-groups update, and read far more
    /// often than it's written -- an `ArcSwap` avoids taking a lock on the
    /// `server_groups()` hot path the mover and `build_map_options` hit.
    server_groups: ArcSwap<Vec<ServerGroup>>,
    failover_vbuckets: DashMap<(String, NodeId), BTreeSet<u16>>,
    history: DashMap<String, MapHistory>,
    history_capacity: usize,
}

impl Default for InMemoryConfigStore {
    fn default() -> Self {
        Self {
            buckets: DashMap::new(),
            memberships: DashMap::new(),
            server_groups: ArcSwap::from_pointee(Vec::new()),
            failover_vbuckets: DashMap::new(),
            history: DashMap::new(),
            history_capacity: 0,
        }
    }
}

impl InMemoryConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            history_capacity: 50,
            ..Self::default()
        }
    }

    pub fn set_server_groups(&self, groups: Vec<ServerGroup>) {
        self.server_groups.store(Arc::new(groups));
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn get_bucket(&self, bucket: &str) -> anyhow::Result<Option<BucketConfig>> {
        Ok(self.buckets.get(bucket).map(|entry| entry.value().clone()))
    }

    async fn set_bucket(&self, bucket: &str, config: BucketConfig) -> anyhow::Result<()> {
        self.buckets.insert(bucket.to_string(), config);
        Ok(())
    }

    async fn set_multiple(&self, changes: Vec<(String, BucketConfig)>) -> anyhow::Result<()> {
        for (bucket, config) in changes {
            self.buckets.insert(bucket, config);
        }
        Ok(())
    }

    async fn get_membership(&self, node: &NodeId) -> anyhow::Result<Option<NodeMembership>> {
        Ok(self.memberships.get(node).map(|entry| entry.value().clone()))
    }

    async fn set_membership(&self, membership: NodeMembership) -> anyhow::Result<()> {
        self.memberships.insert(membership.node.clone(), membership);
        Ok(())
    }

    async fn server_groups(&self) -> anyhow::Result<Vec<ServerGroup>> {
        Ok((*self.server_groups.load_full()).clone())
    }

    async fn failover_vbuckets(
        &self,
        bucket: &str,
        node: &NodeId,
    ) -> anyhow::Result<Option<BTreeSet<u16>>> {
        Ok(self
            .failover_vbuckets
            .get(&(bucket.to_string(), node.clone()))
            .map(|entry| entry.value().clone()))
    }

    async fn record_failover_vbuckets(
        &self,
        bucket: &str,
        node: NodeId,
        vbuckets: BTreeSet<u16>,
    ) -> anyhow::Result<()> {
        self.failover_vbuckets
            .insert((bucket.to_string(), node), vbuckets);
        Ok(())
    }

    async fn clear_failover_vbuckets(&self, bucket: &str, node: &NodeId) -> anyhow::Result<()> {
        self.failover_vbuckets
            .remove(&(bucket.to_string(), node.clone()));
        Ok(())
    }

    async fn push_map_history(&self, bucket: &str, entry: MapHistoryEntry) -> anyhow::Result<()> {
        self.history
            .entry(bucket.to_string())
            .or_insert_with(|| MapHistory::new(self.history_capacity))
            .push(entry);
        Ok(())
    }

    async fn past_vbucket_maps(&self, bucket: &str) -> anyhow::Result<Vec<MapHistoryEntry>> {
        Ok(self
            .history
            .get(bucket)
            .map(|h| h.entries().to_vec())
            .unwrap_or_default())
    }

    async fn sync_announcements(&self) -> anyhow::Result<()> {
        // Writes above are immediately visible (DashMap); nothing to flush.
        Ok(())
    }

    async fn synchronize_remote(&self, _nodes: &[NodeId]) -> anyhow::Result<Vec<NodeId>> {
        // A single in-process store has no remote replicas to wait for.
        Ok(Vec::new())
    }
}
