//! Hard, auto-validated, and graceful failover (§4.7).

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use vbucket_core::{BucketKind, MembershipState, NodeId, RecoveryType};

use crate::cluster::map_algebra::{promote_replicas, promote_replicas_for_graceful_failover};
use crate::cluster::mover::VbucketMover;
use crate::collab::config_store::ConfigStore;
use crate::collab::engine_client::EngineClient;
use crate::collab::event_bus::{ClusterEvent, EventBus};
use crate::error::OrchestratorError;

pub struct FailoverOrchestrator<C, E, B> {
    config_store: Arc<C>,
    engine: Arc<E>,
    events: Arc<B>,
}

impl<C: ConfigStore, E: EngineClient + 'static, B: EventBus> FailoverOrchestrator<C, E, B> {
    pub fn new(config_store: Arc<C>, engine: Arc<E>, events: Arc<B>) -> Self {
        Self { config_store, engine, events }
    }

    /// Hard-fails `node` out of every bucket it serves (§4.7). Janitor
    /// failure is logged and swallowed, never fatal, per §7's
    /// `janitor_failed` informational category.
    ///
    /// # Errors
    ///
    /// Returns a collaborator error only if the config store itself cannot
    /// be written to.
    pub async fn hard_failover(&self, node: &NodeId, bucket_names: &[String]) -> Result<(), OrchestratorError> {
        let dead = BTreeSet::from([node.clone()]);

        for bucket_name in bucket_names {
            let Some(mut config) = self
                .config_store
                .get_bucket(bucket_name)
                .await
                .map_err(OrchestratorError::Collaborator)?
            else {
                continue;
            };
            if !config.servers.contains(node) {
                continue;
            }

            match config.kind {
                BucketKind::Memcached => {
                    config.servers.retain(|n| n != node);
                    self.config_store
                        .set_bucket(bucket_name, config)
                        .await
                        .map_err(OrchestratorError::Collaborator)?;
                }
                BucketKind::Membase => {
                    let promoted = promote_replicas(&config.map, &dead);

                    let unowned: BTreeSet<u16> = promoted
                        .iter()
                        .filter(|(_, chain)| chain.is_unowned())
                        .map(|(id, _)| id)
                        .collect();
                    if !unowned.is_empty() {
                        let percent_lost = ((unowned.len() * 100) / promoted.num_vbuckets().max(1) as usize) as u8;
                        error!(
                            bucket = bucket_name,
                            node = %node,
                            percent_lost,
                            vbuckets = ?unowned,
                            "DATA_LOST"
                        );
                        self.events
                            .publish(ClusterEvent::DataLost {
                                bucket: bucket_name.clone(),
                                node: node.clone(),
                                percent_lost,
                            })
                            .await;
                    }

                    let owned_before: BTreeSet<u16> = config
                        .map
                        .iter()
                        .filter(|(_, chain)| chain.contains(node))
                        .map(|(id, _)| id)
                        .collect();

                    config.map = promoted;
                    config.fast_forward_map = None;
                    config.servers.retain(|n| n != node);
                    self.config_store
                        .set_bucket(bucket_name, config.clone())
                        .await
                        .map_err(OrchestratorError::Collaborator)?;
                    self.config_store
                        .record_failover_vbuckets(bucket_name, node.clone(), owned_before)
                        .await
                        .map_err(OrchestratorError::Collaborator)?;

                    if self.engine.query_states(node, bucket_name, &[]).await.is_err() {
                        warn!(bucket = bucket_name, node = %node, "janitor_failed");
                    }
                }
            }
        }

        self.config_store
            .set_membership(vbucket_core::NodeMembership {
                node: node.clone(),
                state: MembershipState::InactiveFailed,
                recovery_type: RecoveryType::None,
            })
            .await
            .map_err(OrchestratorError::Collaborator)?;

        Ok(())
    }

    /// Simulates a hard failover of `node` without committing anything;
    /// returns the membase buckets that would be left with an unowned
    /// vbucket (§4.7).
    ///
    /// # Errors
    ///
    /// Returns a collaborator error only if a bucket lookup fails.
    pub async fn validate_autofailover(&self, node: &NodeId, bucket_names: &[String]) -> Result<Vec<String>, OrchestratorError> {
        let dead = BTreeSet::from([node.clone()]);
        let mut unsafe_buckets = Vec::new();

        for bucket_name in bucket_names {
            let Some(config) = self
                .config_store
                .get_bucket(bucket_name)
                .await
                .map_err(OrchestratorError::Collaborator)?
            else {
                continue;
            };
            if config.kind != BucketKind::Membase {
                continue;
            }
            let promoted = promote_replicas(&config.map, &dead);
            if promoted.iter().any(|(_, chain)| chain.master().is_none()) {
                unsafe_buckets.push(bucket_name.clone());
            }
        }

        Ok(unsafe_buckets)
    }

    /// Drains `node` off every membase bucket's chain heads, then hard-fails
    /// it over (§4.7). Rejected up front with [`OrchestratorError::NotGraceful`]
    /// if draining would still leave `node` as a chain head in some bucket.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotGraceful`] on the precondition
    /// failure described above, [`OrchestratorError::LastNode`] if `node` is
    /// the only kv node, or a mover/collaborator error during drain.
    pub async fn graceful_failover(
        &self,
        node: &NodeId,
        bucket_names: &[String],
        kv_nodes: &[NodeId],
        cancel: CancellationToken,
    ) -> Result<(), OrchestratorError> {
        if kv_nodes.len() <= 1 {
            return Err(OrchestratorError::LastNode(node.clone()));
        }

        for bucket_name in bucket_names {
            let Some(config) = self
                .config_store
                .get_bucket(bucket_name)
                .await
                .map_err(OrchestratorError::Collaborator)?
            else {
                continue;
            };
            if config.kind != BucketKind::Membase || !config.servers.contains(node) {
                continue;
            }
            let drained = promote_replicas_for_graceful_failover(&config.map, node);
            if drained.iter().any(|(_, chain)| chain.master() == Some(node)) {
                return Err(OrchestratorError::NotGraceful(node.clone()));
            }
        }

        for bucket_name in bucket_names {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Stopped);
            }
            let Some(mut config) = self
                .config_store
                .get_bucket(bucket_name)
                .await
                .map_err(OrchestratorError::Collaborator)?
            else {
                continue;
            };
            if config.kind != BucketKind::Membase || !config.servers.contains(node) {
                continue;
            }

            let drained_target = promote_replicas_for_graceful_failover(&config.map, node);
            let mover = VbucketMover::new(
                bucket_name.clone(),
                Arc::clone(&self.engine),
                config.map.clone(),
                drained_target.clone(),
                1,
            );
            let report = mover.run(cancel.clone()).await?;
            if report.stopped {
                return Err(OrchestratorError::Stopped);
            }

            config.map = drained_target;
            self.config_store
                .set_bucket(bucket_name, config)
                .await
                .map_err(OrchestratorError::Collaborator)?;
        }

        self.hard_failover(node, bucket_names).await
    }
}
