//! Pure functions over vbucket maps (§4.1). No I/O, no collaborator calls --
//! every function here is a candidate for property-based testing (§8).

use std::collections::{BTreeSet, HashMap};

use vbucket_core::{Chain, NodeId, VbucketMap};

/// Removes every node in `dead_nodes` from every chain, padding with
/// trailing `None` to preserve chain length. A chain left entirely empty
/// becomes all-`None` (testable property 2: promotion safety).
#[must_use]
pub fn promote_replicas(map: &VbucketMap, dead_nodes: &BTreeSet<NodeId>) -> VbucketMap {
    let chains = map
        .chains()
        .iter()
        .map(|chain| promote_chain(chain, dead_nodes))
        .collect();
    VbucketMap::new(chains)
}

fn promote_chain(chain: &Chain, dead_nodes: &BTreeSet<NodeId>) -> Chain {
    let len = chain.len();
    let mut survivors: Vec<Option<NodeId>> = chain
        .slots()
        .iter()
        .filter(|slot| {
            slot.as_ref()
                .is_none_or(|node| !dead_nodes.contains(node))
        })
        .cloned()
        .collect();
    survivors.resize(len, None);
    Chain::new(survivors)
}

/// Like [`promote_replicas`] for a single node, but demotes rather than
/// removes it: `node` is pushed to the tail of any chain it still appears
/// in, never deleted. Used to drain traffic off `node` ahead of a graceful
/// failover (§4.7) without losing its data (testable property 3).
#[must_use]
pub fn promote_replicas_for_graceful_failover(map: &VbucketMap, node: &NodeId) -> VbucketMap {
    let chains = map
        .chains()
        .iter()
        .map(|chain| demote_in_chain(chain, node))
        .collect();
    VbucketMap::new(chains)
}

fn demote_in_chain(chain: &Chain, node: &NodeId) -> Chain {
    if !chain.contains(node) {
        return chain.clone();
    }
    let len = chain.len();
    let mut rest: Vec<Option<NodeId>> = chain
        .slots()
        .iter()
        .filter(|slot| slot.as_ref() != Some(node))
        .cloned()
        .collect();
    rest.push(Some(node.clone()));
    rest.resize(len, None);
    Chain::new(rest)
}

/// Count of positions at which `a` and `b` differ, summed over every chain.
/// A cheap distance measure for logging and progress, not a substitute for
/// [`vbucket_core::VbucketMap::total_distance`] (same computation, exposed
/// here for call sites that only import `map_algebra`).
#[must_use]
pub fn vbucket_movements(a: &VbucketMap, b: &VbucketMap) -> usize {
    a.total_distance(b)
}

/// True iff `past_map` can be used unchanged as the rebalance target: every
/// chain in `past_map` refers only to nodes in `keep`, the vbucket counts
/// agree, and the option hashes match (§4.2 step 2).
#[must_use]
pub fn is_trivially_compatible_past_map(
    keep: &BTreeSet<NodeId>,
    cur_opts_hash: &str,
    past_map: &VbucketMap,
    past_opts_hash: &str,
    expected_num_vbuckets: u16,
) -> bool {
    if cur_opts_hash != past_opts_hash {
        return false;
    }
    if past_map.num_vbuckets() != expected_num_vbuckets {
        return false;
    }
    past_map
        .chains()
        .iter()
        .all(|chain| chain.slots().iter().flatten().all(|n| keep.contains(n)))
}

/// Reports imbalance (§4.1): any chain has `None` in a position that should
/// be filled given `|servers|`, or master/replica counts differ by more
/// than 1 across `servers`.
#[must_use]
pub fn unbalanced(map: &VbucketMap, servers: &[NodeId]) -> bool {
    if servers.is_empty() {
        return false;
    }
    let chain_len = map.chains().first().map_or(0, Chain::len);
    let fillable = chain_len.min(servers.len());

    for (_, chain) in map.iter() {
        for slot in chain.slots().iter().take(fillable) {
            if slot.is_none() {
                return true;
            }
        }
    }

    let mut masters: HashMap<&NodeId, usize> = HashMap::new();
    let mut replicas: HashMap<&NodeId, usize> = HashMap::new();
    for server in servers {
        masters.insert(server, 0);
        replicas.insert(server, 0);
    }
    for (_, chain) in map.iter() {
        if let Some(master) = chain.master() {
            *masters.entry(master).or_insert(0) += 1;
        }
        for replica in chain.replicas() {
            *replicas.entry(replica).or_insert(0) += 1;
        }
    }

    is_spread_unbalanced(&masters) || is_spread_unbalanced(&replicas)
}

fn is_spread_unbalanced(counts: &HashMap<&NodeId, usize>) -> bool {
    let Some(min) = counts.values().min() else {
        return false;
    };
    let Some(max) = counts.values().max() else {
        return false;
    };
    max - min > 1
}
