//! Cluster rebalancing and failover orchestrator for a distributed key-value
//! store: vbucket map generation, delta recovery planning, rebalance
//! execution, and graceful/hard failover (see the module docs under
//! [`cluster`] for the per-operation breakdown).
//!
//! This crate owns the control-plane decisions -- what the next map should
//! be, which node should take over which vbuckets, when a move is safe to
//! commit -- and drives them through the collaborator traits in [`collab`]
//! rather than talking to a real config store, data plane, or pubsub system
//! directly (§1, §6).

pub mod cluster;
pub mod collab;
pub mod config;
pub mod error;
pub mod supervision;

pub use cluster::{
    DeltaRecoveryPlan, FailoverOrchestrator, RebalanceOrchestrator, RebalancePlan, RequestedBuckets,
};
pub use collab::{ClusterEvent, ConfigStore, EngineClient, EventBus};
pub use config::OrchestratorConfig;
pub use error::OrchestratorError;
