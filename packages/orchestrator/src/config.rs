//! Tunables for the rebalance/failover orchestrator (§5, §10.4).

use std::time::Duration;

/// Orchestrator-wide configuration. Defaults mirror the literal values named
/// in the concurrency model.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bound on waiting for a bucket to report ready on a node.
    pub readiness_timeout: Duration,
    /// Bound on a single `query_states` round-trip to the engine client.
    pub query_states_timeout: Duration,
    /// Bound on propagating a config change to all keep-nodes.
    pub apply_config_timeout: Duration,
    /// Per-bucket budget while waiting for excess local buckets to shut down;
    /// the effective wait is this value multiplied by the bucket count.
    pub buckets_shutdown_timeout_per_bucket: Duration,
    /// `P`: max concurrent vbucket moves per source-destination node pair.
    pub max_parallel_moves_per_node_pair: usize,
    /// Delay after a bucket's move completes, applied only when that bucket
    /// had rebalance-out members, before the new map is finalized.
    pub rebalance_out_delay: Duration,
    /// `one_for_one` restart cap for the replication-verification supervisor.
    pub replication_supervisor_max_restarts: u32,
    /// Window over which `replication_supervisor_max_restarts` is counted.
    pub replication_supervisor_restart_window: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(60),
            query_states_timeout: Duration::from_secs(10),
            apply_config_timeout: Duration::from_secs(300),
            buckets_shutdown_timeout_per_bucket: Duration::from_secs(20),
            max_parallel_moves_per_node_pair: 1,
            rebalance_out_delay: Duration::from_secs(0),
            replication_supervisor_max_restarts: 3,
            replication_supervisor_restart_window: Duration::from_secs(10),
        }
    }
}

impl OrchestratorConfig {
    /// Bound referenced by testable property 7: the orchestrator must exit
    /// within `query_states_timeout + 5s` of a `stop` signal.
    #[must_use]
    pub fn cancellation_bound(&self) -> Duration {
        self.query_states_timeout + Duration::from_secs(5)
    }

    #[must_use]
    pub fn buckets_shutdown_timeout(&self, bucket_count: usize) -> Duration {
        self.buckets_shutdown_timeout_per_bucket * u32::try_from(bucket_count.max(1)).unwrap_or(u32::MAX)
    }
}
