//! The top-level rebalance driver (§4.5): the nine-step sequence from
//! pre-sync through ejecting departed nodes.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vbucket_core::{BucketKind, MapOptions, MembershipState, NodeId, NodeMembership, RecoveryType};

use crate::cluster::delta_recovery::{build_transitional_map, transitional_servers, DeltaRecoveryPlan};
use crate::cluster::map_generator::{build_map_options, generate_vbucket_map};
use crate::cluster::mover::VbucketMover;
use crate::cluster::verify::verify_map_replication;
use crate::collab::config_store::ConfigStore;
use crate::collab::engine_client::EngineClient;
use crate::collab::event_bus::{ClusterEvent, EventBus};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;

/// The node-set change a rebalance drives the cluster towards.
#[derive(Debug, Clone)]
pub struct RebalancePlan {
    /// Nodes that remain kv-active after this rebalance.
    pub keep: Vec<NodeId>,
    /// Nodes being gracefully removed.
    pub eject: Vec<NodeId>,
    /// Nodes already dead, evicted without a drain.
    pub failed: Vec<NodeId>,
    /// Accepted delta recovery plans, computed ahead of time by
    /// [`crate::cluster::delta_recovery::build_delta_recovery_buckets`].
    pub delta_plans: Vec<DeltaRecoveryPlan>,
    pub recovering: BTreeSet<NodeId>,
}

pub struct RebalanceOrchestrator<C, E, B> {
    config_store: Arc<C>,
    engine: Arc<E>,
    events: Arc<B>,
    config: OrchestratorConfig,
}

impl<C: ConfigStore, E: EngineClient + 'static, B: EventBus> RebalanceOrchestrator<C, E, B> {
    pub fn new(config_store: Arc<C>, engine: Arc<E>, events: Arc<B>, config: OrchestratorConfig) -> Self {
        Self {
            config_store,
            engine,
            events,
            config,
        }
    }

    /// Drives the full nine-step sequence for `plan`. Buckets are processed
    /// in the order `bucket_names` lists (§4.5 step 7: "in config order").
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`OrchestratorError`] encountered; see §7 for
    /// the taxonomy.
    pub async fn rebalance(
        &self,
        plan: &RebalancePlan,
        bucket_names: &[String],
        cancel: CancellationToken,
    ) -> Result<(), OrchestratorError> {
        if plan.keep.is_empty() {
            return Err(OrchestratorError::NoKvNodesLeft);
        }

        // 1. pre-sync.
        self.config_store
            .sync_announcements()
            .await
            .map_err(|_| OrchestratorError::PreRebalanceConfigSynchronizationFailed)?;
        let unsynced = self
            .config_store
            .synchronize_remote(&plan.keep)
            .await
            .map_err(|_| OrchestratorError::PreRebalanceConfigSynchronizationFailed)?;
        if !unsynced.is_empty() {
            return Err(OrchestratorError::PreRebalanceConfigSynchronizationFailed);
        }
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Stopped);
        }

        // 2. service activation is idempotent and, in this crate's scope, a
        // no-op: only the kv service is modeled and bucket `servers` already
        // carries that assignment (§1 Non-goals -- no service-to-node map).
        info!(nodes = ?plan.keep, "service activation checkpoint reached");

        // 3. failed-node eviction.
        for node in &plan.failed {
            self.config_store
                .set_membership(NodeMembership {
                    node: node.clone(),
                    state: MembershipState::InactiveFailed,
                    recovery_type: RecoveryType::None,
                })
                .await
                .map_err(OrchestratorError::Collaborator)?;
        }

        // 4. old-buckets cleanup.
        let keep_set: BTreeSet<NodeId> = plan.keep.iter().cloned().collect();
        let mut cleanup_failed = Vec::new();
        for node in &plan.keep {
            let active = self
                .engine
                .list_active_buckets(node)
                .await
                .unwrap_or_default();
            for bucket in active {
                if !bucket_names.contains(&bucket) {
                    if self.engine.delete_unused_bucket_files(node, &bucket).await.is_err() {
                        cleanup_failed.push(node.clone());
                    }
                }
            }
        }
        if !cleanup_failed.is_empty() {
            return Err(OrchestratorError::BucketsCleanupFailed { failed_nodes: cleanup_failed });
        }

        // 5. wait for bucket shutdowns.
        let deadline = self.config.buckets_shutdown_timeout(bucket_names.len());
        let wait_result = tokio::time::timeout(deadline, self.wait_for_shutdowns(&plan.keep, bucket_names)).await;
        if wait_result.is_err() {
            return Err(OrchestratorError::BucketsShutdownWaitFailed { failed_nodes: plan.keep.clone() });
        }
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Stopped);
        }

        // 6. delta-recovery apply.
        if !plan.delta_plans.is_empty() {
            self.apply_delta_recovery(plan).await?;
        }

        // 7. per-bucket rebalance loop.
        for bucket_name in bucket_names {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Stopped);
            }
            self.rebalance_one_bucket(bucket_name, plan, &keep_set, cancel.clone())
                .await?;
        }

        // 8. post-sync & eject-delay.
        self.config_store
            .sync_announcements()
            .await
            .map_err(OrchestratorError::Collaborator)?;
        if !plan.eject.is_empty() {
            tokio::time::sleep(self.config.rebalance_out_delay).await;
        }

        // 9. eject keep-complement. No membership key exists in this crate's
        // `ConfigStore` for "remove node from cluster" (§6 lists no such
        // key) -- eject is fully expressed by the node's absence from every
        // bucket's `servers`, already committed in step 7.
        info!(ejected = ?plan.eject, "eject checkpoint reached");

        Ok(())
    }

    async fn wait_for_shutdowns(&self, keep: &[NodeId], bucket_names: &[String]) {
        loop {
            let mut all_clear = true;
            for node in keep {
                let active = self.engine.list_active_buckets(node).await.unwrap_or_default();
                if active.iter().any(|b| !bucket_names.contains(b)) {
                    all_clear = false;
                }
            }
            if all_clear {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    async fn apply_delta_recovery(&self, plan: &RebalancePlan) -> Result<(), OrchestratorError> {
        let mut changes = Vec::new();
        for dr in &plan.delta_plans {
            let Some(mut config) = self
                .config_store
                .get_bucket(&dr.bucket)
                .await
                .map_err(OrchestratorError::Collaborator)?
            else {
                continue;
            };
            let transitional = build_transitional_map(&config.map, &dr.past_map, &plan.recovering, config.chain_len());
            config.servers = transitional_servers(&config.servers, &plan.recovering);
            config.map = transitional;
            changes.push((dr.bucket.clone(), config));
        }
        self.config_store
            .set_multiple(changes)
            .await
            .map_err(OrchestratorError::Collaborator)?;

        for dr in &plan.delta_plans {
            for node in &plan.recovering {
                self.config_store
                    .clear_failover_vbuckets(&dr.bucket, node)
                    .await
                    .map_err(OrchestratorError::Collaborator)?;
            }
        }
        for node in &plan.recovering {
            self.config_store
                .set_membership(NodeMembership {
                    node: node.clone(),
                    state: MembershipState::Active,
                    recovery_type: RecoveryType::None,
                })
                .await
                .map_err(OrchestratorError::Collaborator)?;
        }
        self.config_store
            .sync_announcements()
            .await
            .map_err(OrchestratorError::Collaborator)?;
        Ok(())
    }

    async fn rebalance_one_bucket(
        &self,
        bucket_name: &str,
        plan: &RebalancePlan,
        keep_set: &BTreeSet<NodeId>,
        cancel: CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let Some(mut config) = self
            .config_store
            .get_bucket(bucket_name)
            .await
            .map_err(OrchestratorError::Collaborator)?
        else {
            return Ok(());
        };

        let had_rebalance_out = config.servers.iter().any(|n| plan.eject.contains(n));
        let still_ejecting: BTreeSet<NodeId> = config
            .servers
            .iter()
            .filter(|n| plan.eject.contains(n))
            .cloned()
            .collect();
        let transitional: BTreeSet<NodeId> = keep_set.union(&still_ejecting).cloned().collect();
        config.servers = transitional.into_iter().collect();
        config.servers.sort();
        self.config_store
            .set_bucket(bucket_name, config.clone())
            .await
            .map_err(OrchestratorError::Collaborator)?;

        self.run_janitor_sweep(bucket_name, &config.servers).await?;

        match config.kind {
            BucketKind::Memcached => {
                config.servers = plan.keep.clone();
                config.servers.sort();
                self.config_store
                    .set_bucket(bucket_name, config)
                    .await
                    .map_err(OrchestratorError::Collaborator)?;
            }
            BucketKind::Membase => {
                let server_groups = self
                    .config_store
                    .server_groups()
                    .await
                    .map_err(OrchestratorError::Collaborator)?;
                let opts: MapOptions =
                    build_map_options(&plan.keep, config.num_vbuckets, config.num_replicas, &server_groups)?;
                let history = self
                    .config_store
                    .past_vbucket_maps(bucket_name)
                    .await
                    .map_err(OrchestratorError::Collaborator)?;
                let target_map = generate_vbucket_map(&config.map, &plan.keep, &opts, &history);

                config.fast_forward_map = Some(target_map.clone());
                config.map_opts_hash = Some(opts.hash_key());
                self.config_store
                    .set_bucket(bucket_name, config.clone())
                    .await
                    .map_err(OrchestratorError::Collaborator)?;

                let mover = VbucketMover::new(
                    bucket_name,
                    Arc::clone(&self.engine),
                    config.map.clone(),
                    target_map.clone(),
                    self.config.max_parallel_moves_per_node_pair,
                );
                let report = mover.run(cancel).await?;
                if report.stopped {
                    return Err(OrchestratorError::Stopped);
                }

                if had_rebalance_out {
                    tokio::time::sleep(self.config.rebalance_out_delay).await;
                }

                config.fast_forward_map = None;
                config.map = target_map.clone();
                config.servers = plan.keep.clone();
                config.servers.sort();
                config.delta_recovery_map = None;
                self.config_store
                    .set_bucket(bucket_name, config.clone())
                    .await
                    .map_err(OrchestratorError::Collaborator)?;
                self.config_store
                    .push_map_history(
                        bucket_name,
                        vbucket_core::MapHistoryEntry {
                            map: target_map.clone(),
                            options: opts,
                        },
                    )
                    .await
                    .map_err(OrchestratorError::Collaborator)?;

                verify_map_replication(Arc::clone(&self.engine), bucket_name, &config.servers, &target_map).await?;
            }
        }

        self.events
            .publish(ClusterEvent::BucketReady {
                bucket: bucket_name.to_string(),
                node: plan.keep[0].clone(),
            })
            .await;

        Ok(())
    }

    async fn run_janitor_sweep(&self, bucket_name: &str, servers: &[NodeId]) -> Result<(), OrchestratorError> {
        let mut failed_nodes = Vec::new();
        for node in servers {
            if self.engine.query_states(node, bucket_name, &[]).await.is_err() {
                failed_nodes.push(node.clone());
            }
        }
        if failed_nodes.is_empty() {
            Ok(())
        } else {
            warn!(bucket = bucket_name, nodes = ?failed_nodes, "janitor sweep could not reach some nodes");
            Err(OrchestratorError::PreRebalanceJanitorRunFailed { failed_nodes })
        }
    }
}

#[cfg(test)]
mod tests {
    use vbucket_core::{BucketConfig, Chain, VbucketMap};

    use super::*;
    use crate::collab::config_store::InMemoryConfigStore;
    use crate::collab::engine_client::FakeEngineClient;
    use crate::collab::event_bus::InMemoryEventBus;

    fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }

    async fn seed_bucket(
        store: &InMemoryConfigStore,
        engine: &FakeEngineClient,
        name: &str,
        servers: Vec<NodeId>,
        num_vbuckets: u16,
    ) {
        let chain_len = 2usize;
        let map = VbucketMap::new(
            (0..num_vbuckets)
                .map(|i| {
                    let s = &servers;
                    Chain::new(vec![
                        Some(s[usize::from(i) % s.len()].clone()),
                        Some(s[(usize::from(i) + 1) % s.len()].clone()),
                    ])
                })
                .collect(),
        );
        // The fake engine only learns about a replication edge when the
        // mover tells it to start one; seed it here so verification sees
        // the chains that *don't* move as already replicating, matching a
        // live cluster that was already serving this map.
        for (vbucket_id, chain) in map.iter() {
            if let Some(master) = chain.master() {
                for replica in chain.replicas() {
                    engine.set_replicating(name, master.clone(), replica.clone(), vbucket_id);
                }
            }
        }
        let config = BucketConfig {
            name: name.to_string(),
            kind: BucketKind::Membase,
            num_replicas: (chain_len - 1) as u8,
            num_vbuckets,
            servers,
            map,
            fast_forward_map: None,
            map_opts_hash: None,
            delta_recovery_map: None,
        };
        store.set_bucket(name, config).await.unwrap();
    }

    #[tokio::test]
    async fn rebalance_adds_a_node_and_commits_a_balanced_map() {
        let store = Arc::new(InMemoryConfigStore::new());
        let engine = Arc::new(FakeEngineClient::new());
        let events = Arc::new(InMemoryEventBus::default());

        let servers = vec![node("n1"), node("n2"), node("n3")];
        seed_bucket(&store, &engine, "default", servers.clone(), 16).await;

        let orchestrator =
            RebalanceOrchestrator::new(store.clone(), engine, events, OrchestratorConfig::default());
        let keep = vec![node("n1"), node("n2"), node("n3"), node("n4")];
        let plan = RebalancePlan {
            keep: keep.clone(),
            eject: vec![],
            failed: vec![],
            delta_plans: vec![],
            recovering: BTreeSet::new(),
        };

        let result = orchestrator
            .rebalance(&plan, &["default".to_string()], CancellationToken::new())
            .await;
        assert!(result.is_ok(), "{result:?}");

        let committed = store.get_bucket("default").await.unwrap().unwrap();
        assert!(committed.fast_forward_map.is_none());
        assert_eq!(committed.servers, keep);
        for (_, chain) in committed.map.iter() {
            assert!(chain.has_no_duplicates());
        }
    }

    #[tokio::test]
    async fn rebalance_refuses_when_keep_is_empty() {
        let store = Arc::new(InMemoryConfigStore::new());
        let engine = Arc::new(FakeEngineClient::new());
        let events = Arc::new(InMemoryEventBus::default());
        let orchestrator = RebalanceOrchestrator::new(store, engine, events, OrchestratorConfig::default());

        let plan = RebalancePlan {
            keep: vec![],
            eject: vec![node("n1")],
            failed: vec![],
            delta_plans: vec![],
            recovering: BTreeSet::new(),
        };
        let result = orchestrator.rebalance(&plan, &[], CancellationToken::new()).await;
        assert!(matches!(result, Err(OrchestratorError::NoKvNodesLeft)));
    }

    #[tokio::test]
    async fn rebalance_marks_failed_nodes_inactive() {
        let store = Arc::new(InMemoryConfigStore::new());
        let engine = Arc::new(FakeEngineClient::new());
        let events = Arc::new(InMemoryEventBus::default());
        seed_bucket(&store, &engine, "default", vec![node("n1"), node("n2")], 4).await;

        let orchestrator =
            RebalanceOrchestrator::new(store.clone(), engine, events, OrchestratorConfig::default());
        let plan = RebalancePlan {
            keep: vec![node("n1")],
            eject: vec![],
            failed: vec![node("n2")],
            delta_plans: vec![],
            recovering: BTreeSet::new(),
        };
        orchestrator
            .rebalance(&plan, &["default".to_string()], CancellationToken::new())
            .await
            .unwrap();

        let membership = store.get_membership(&node("n2")).await.unwrap().unwrap();
        assert_eq!(membership.state, MembershipState::InactiveFailed);
    }

    #[tokio::test]
    async fn rebalance_stops_cleanly_when_cancelled_up_front() {
        let store = Arc::new(InMemoryConfigStore::new());
        let engine = Arc::new(FakeEngineClient::new());
        let events = Arc::new(InMemoryEventBus::default());
        seed_bucket(&store, &engine, "default", vec![node("n1"), node("n2")], 4).await;

        let orchestrator = RebalanceOrchestrator::new(store, engine, events, OrchestratorConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let plan = RebalancePlan {
            keep: vec![node("n1"), node("n2")],
            eject: vec![],
            failed: vec![],
            delta_plans: vec![],
            recovering: BTreeSet::new(),
        };
        let result = orchestrator.rebalance(&plan, &["default".to_string()], cancel).await;
        assert!(matches!(result, Err(OrchestratorError::Stopped)));
    }
}
