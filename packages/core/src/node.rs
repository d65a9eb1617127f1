//! Node identity and cluster membership state (§3 Cluster Membership).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque node identifier, e.g. `"n1"` or a hostname:port pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Membership tag of a node in the cluster (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MembershipState {
    Active,
    InactiveAdded,
    InactiveFailed,
}

/// Recovery strategy a node is marked with while re-joining after failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryType {
    None,
    Delta,
    Full,
}

/// A node's membership record as tracked by the config store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMembership {
    pub node: NodeId,
    pub state: MembershipState,
    pub recovery_type: RecoveryType,
}

impl NodeMembership {
    #[must_use]
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            state: MembershipState::Active,
            recovery_type: RecoveryType::None,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == MembershipState::Active
    }
}

/// A named server group (rack), used for chain anti-affinity (§3, §4.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerGroup {
    pub uuid: String,
    pub name: String,
    pub nodes: Vec<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_displays_inner_string() {
        let id = NodeId::new("n1");
        assert_eq!(id.to_string(), "n1");
        assert_eq!(id.as_str(), "n1");
    }

    #[test]
    fn node_membership_defaults_to_active_none() {
        let m = NodeMembership::new(NodeId::new("n1"));
        assert!(m.is_active());
        assert_eq!(m.recovery_type, RecoveryType::None);
    }

    #[test]
    fn server_group_holds_member_nodes() {
        let group = ServerGroup {
            uuid: "g1".into(),
            name: "rack-a".into(),
            nodes: vec![NodeId::new("n1"), NodeId::new("n2")],
        };
        assert_eq!(group.nodes.len(), 2);
    }
}
