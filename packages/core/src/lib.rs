//! Vbucket data model -- the wire-shape of everything that crosses the
//! config-store boundary for cluster rebalancing and failover.
//!
//! - **Map** ([`map`]): [`Chain`] and [`VbucketMap`], with the chain-integrity
//!   invariants from the testable-properties list.
//! - **Node** ([`node`]): [`NodeId`], membership state, server groups.
//! - **Bucket** ([`bucket`]): [`BucketConfig`], [`MapOptions`], map history,
//!   and the failover-vbuckets record consulted by delta recovery.
//! - **Error** ([`error`]): data-model validation errors.

pub mod bucket;
pub mod error;
pub mod map;
pub mod node;

pub use bucket::{BucketConfig, BucketKind, FailoverVbucketsRecord, MapHistory, MapHistoryEntry, MapOptions};
pub use error::CoreError;
pub use map::{Chain, VbucketMap};
pub use node::{MembershipState, NodeId, NodeMembership, RecoveryType, ServerGroup};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    /// Verify all re-exports are accessible from the crate root.
    #[test]
    fn reexports_accessible() {
        let node = NodeId::new("n1");
        let _ = NodeMembership::new(node.clone());
        let _ = MembershipState::Active;
        let _ = RecoveryType::None;
        let _group = ServerGroup {
            uuid: "g".into(),
            name: "rack".into(),
            nodes: vec![node.clone()],
        };
        let _chain = Chain::empty(2);
        let _map = VbucketMap::unassigned(4, 1);
        let opts = MapOptions {
            num_vbuckets: 4,
            num_replicas: 1,
            tags: None,
        };
        let _history = MapHistory::new(10);
        let _entry = MapHistoryEntry {
            map: VbucketMap::unassigned(4, 1),
            options: opts,
        };
        let _record = FailoverVbucketsRecord::default();
        let _kind = BucketKind::Membase;
    }

    #[test]
    fn bucket_config_msgpack_roundtrip() {
        let config = BucketConfig {
            name: "default".into(),
            kind: BucketKind::Membase,
            num_replicas: 1,
            num_vbuckets: 2,
            servers: vec![NodeId::new("n1"), NodeId::new("n2")],
            map: VbucketMap::new(vec![
                Chain::new(vec![Some(NodeId::new("n1")), Some(NodeId::new("n2"))]),
                Chain::new(vec![Some(NodeId::new("n2")), Some(NodeId::new("n1"))]),
            ]),
            fast_forward_map: None,
            map_opts_hash: Some("v2-r1-t[]".into()),
            delta_recovery_map: None,
        };
        let bytes = rmp_serde::to_vec_named(&config).expect("serialize BucketConfig");
        let decoded: BucketConfig = rmp_serde::from_slice(&bytes).expect("deserialize BucketConfig");
        assert_eq!(decoded.servers, config.servers);
        assert_eq!(decoded.map, config.map);
    }
}
