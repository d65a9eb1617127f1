//! Vbucket maps and chains.
//!
//! A [`VbucketMap`] is an ordered sequence of [`Chain`]s, one per vbucket id.
//! A chain is a master (head) followed by zero or more replicas, with `None`
//! used as the sentinel for "no node owns this position".

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::node::NodeId;

/// One replication chain: `chain[0]` is the master, `chain[1..]` are replicas
/// in priority order. `None` marks a position with no owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain(Vec<Option<NodeId>>);

impl Chain {
    /// Builds a chain of the given length, validating nothing beyond length:
    /// duplicate-node and membership checks are map-level invariants (see
    /// [`VbucketMap::validate`]) because they require the bucket's `servers` set.
    #[must_use]
    pub fn new(slots: Vec<Option<NodeId>>) -> Self {
        Self(slots)
    }

    /// An all-unassigned chain of the given length.
    #[must_use]
    pub fn empty(len: usize) -> Self {
        Self(vec![None; len])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn master(&self) -> Option<&NodeId> {
        self.0.first().and_then(|slot| slot.as_ref())
    }

    #[must_use]
    pub fn replicas(&self) -> impl Iterator<Item = &NodeId> {
        self.0.iter().skip(1).filter_map(|slot| slot.as_ref())
    }

    #[must_use]
    pub fn slots(&self) -> &[Option<NodeId>] {
        &self.0
    }

    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.iter().any(|slot| slot.as_ref() == Some(node))
    }

    #[must_use]
    pub fn position_of(&self, node: &NodeId) -> Option<usize> {
        self.0.iter().position(|slot| slot.as_ref() == Some(node))
    }

    /// True when every slot is `None`.
    #[must_use]
    pub fn is_unowned(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    /// Has no duplicate non-`None` node across slots.
    #[must_use]
    pub fn has_no_duplicates(&self) -> bool {
        let mut seen = Vec::with_capacity(self.0.len());
        for slot in self.0.iter().flatten() {
            if seen.contains(&slot) {
                return false;
            }
            seen.push(slot);
        }
        true
    }

    /// Number of slots that differ from `other` (position-wise). Panics if
    /// lengths differ -- callers compare chains of the same bucket only.
    #[must_use]
    pub fn distance(&self, other: &Chain) -> usize {
        assert_eq!(self.0.len(), other.0.len(), "chain length mismatch");
        self.0
            .iter()
            .zip(other.0.iter())
            .filter(|(a, b)| a != b)
            .count()
    }
}

impl From<Vec<Option<NodeId>>> for Chain {
    fn from(slots: Vec<Option<NodeId>>) -> Self {
        Self(slots)
    }
}

/// The full vbucket map for one bucket: `map[i]` is the chain for vbucket `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VbucketMap {
    chains: Vec<Chain>,
}

impl VbucketMap {
    #[must_use]
    pub fn new(chains: Vec<Chain>) -> Self {
        Self { chains }
    }

    /// A map of `num_vbuckets` all-unowned chains of length `num_replicas + 1`.
    #[must_use]
    pub fn unassigned(num_vbuckets: u16, num_replicas: u8) -> Self {
        let chain_len = usize::from(num_replicas) + 1;
        Self {
            chains: (0..num_vbuckets).map(|_| Chain::empty(chain_len)).collect(),
        }
    }

    #[must_use]
    pub fn num_vbuckets(&self) -> u16 {
        u16::try_from(self.chains.len()).expect("vbucket count fits u16")
    }

    #[must_use]
    pub fn chain(&self, vbucket_id: u16) -> &Chain {
        &self.chains[usize::from(vbucket_id)]
    }

    #[must_use]
    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub fn chains_mut(&mut self) -> &mut [Chain] {
        &mut self.chains
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &Chain)> {
        self.chains
            .iter()
            .enumerate()
            .map(|(i, c)| (u16::try_from(i).expect("vbucket id fits u16"), c))
    }

    /// Validates invariant 1 (§8): uniform chain length, no duplicate nodes
    /// per chain, and every non-empty slot is a member of `servers`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ChainLengthMismatch`] or [`CoreError::UnknownServer`].
    pub fn validate(&self, expected_chain_len: usize, servers: &[NodeId]) -> Result<(), CoreError> {
        for (vbucket_id, chain) in self.iter() {
            if chain.len() != expected_chain_len {
                return Err(CoreError::ChainLengthMismatch {
                    vbucket_id,
                    expected: expected_chain_len,
                    actual: chain.len(),
                });
            }
            if !chain.has_no_duplicates() {
                return Err(CoreError::DuplicateNodeInChain { vbucket_id });
            }
            for slot in chain.slots().iter().flatten() {
                if !servers.contains(slot) {
                    return Err(CoreError::UnknownServer {
                        vbucket_id,
                        node: slot.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Total number of slots (across all chains) that differ between `self`
    /// and `other`. Used for move-count estimation (§4.1) and S1's ≈768 bound.
    #[must_use]
    pub fn total_distance(&self, other: &VbucketMap) -> usize {
        self.chains
            .iter()
            .zip(other.chains.iter())
            .map(|(a, b)| a.distance(b))
            .sum()
    }
}
