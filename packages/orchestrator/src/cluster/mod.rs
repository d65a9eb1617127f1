//! Cluster rebalancing and failover (§2-§4): map algebra, map generation,
//! delta recovery planning, the vbucket mover, replication verification,
//! and the rebalance/failover orchestrators built on top of them.

pub mod delta_recovery;
pub mod failover;
pub mod map_algebra;
pub mod map_generator;
pub mod mover;
pub mod rebalance;
pub mod verify;

pub use delta_recovery::{
    build_delta_recovery_buckets, build_transitional_map, find_matching_past_maps, plan_delta_recovery,
    transitional_servers, DeltaRecoveryPlan, RequestedBuckets,
};
pub use failover::FailoverOrchestrator;
pub use map_algebra::{is_trivially_compatible_past_map, promote_replicas, promote_replicas_for_graceful_failover, unbalanced, vbucket_movements};
pub use map_generator::{build_map_options, generate_initial_map, generate_vbucket_map};
pub use mover::{MoverReport, MoverWorker, PendingMove, VbucketMover};
pub use rebalance::{RebalanceOrchestrator, RebalancePlan};
pub use verify::{expected_replicators, verify_map_replication, verify_replication};
