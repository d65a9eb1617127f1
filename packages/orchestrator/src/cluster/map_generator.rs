//! Target map generation (§4.2).

use std::collections::{BTreeMap, BTreeSet};

use vbucket_core::{Chain, MapHistoryEntry, MapOptions, NodeId, ServerGroup, VbucketMap};

use crate::cluster::map_algebra::is_trivially_compatible_past_map;
use crate::error::OrchestratorError;

/// Builds the [`MapOptions`] a map generated right now would carry (§4.2
/// step 1). `keep` need not be sorted.
///
/// # Errors
///
/// Returns [`OrchestratorError::ServerGroupsRace`] if two or more non-empty
/// groups intersect `keep` but some node in `keep` belongs to none of them.
pub fn build_map_options(
    keep: &[NodeId],
    num_vbuckets: u16,
    num_replicas: u8,
    server_groups: &[ServerGroup],
) -> Result<MapOptions, OrchestratorError> {
    let keep_set: BTreeSet<&NodeId> = keep.iter().collect();
    let non_empty_groups_in_keep = server_groups
        .iter()
        .filter(|g| g.nodes.iter().any(|n| keep_set.contains(n)))
        .count();

    let tags = if non_empty_groups_in_keep >= 2 {
        let mut tags = BTreeMap::new();
        for node in keep {
            let group = server_groups.iter().find(|g| g.nodes.contains(node));
            match group {
                Some(group) => {
                    tags.insert(node.clone(), group.uuid.clone());
                }
                None => return Err(OrchestratorError::ServerGroupsRace),
            }
        }
        Some(tags)
    } else {
        None
    };

    Ok(MapOptions {
        num_vbuckets,
        num_replicas,
        tags,
    })
}

/// Produces a target map for `keep` under `opts`, preferring (in order): a
/// compatible map already present in `history`, then a fresh assignment
/// derived from `current_map` that retains every slot it can without
/// breaking balance (§4.2 step 2 -- "minimize movements vs `current_map`,
/// subject to balance"), with a best-effort tag-diversity repair pass on top
/// (§4.2 step 3). Ties are broken by `(vbucket_id, node_id)` lexicographic
/// order via the sorted keep-set, so two calls with identical inputs are
/// identical (§4.2's determinism requirement).
#[must_use]
pub fn generate_vbucket_map(
    current_map: &VbucketMap,
    keep: &[NodeId],
    opts: &MapOptions,
    history: &[MapHistoryEntry],
) -> VbucketMap {
    let keep_set: BTreeSet<NodeId> = keep.iter().cloned().collect();
    let opts_hash = opts.hash_key();

    for entry in history.iter().rev() {
        if is_trivially_compatible_past_map(
            &keep_set,
            &opts_hash,
            &entry.map,
            &entry.options.hash_key(),
            opts.num_vbuckets,
        ) {
            return entry.map.clone();
        }
    }

    fresh_balanced_map(keep, opts, Some(current_map))
}

/// The special case where there is no prior map at all (§4.2).
#[must_use]
pub fn generate_initial_map(keep: &[NodeId], opts: &MapOptions) -> VbucketMap {
    fresh_balanced_map(keep, opts, None)
}

/// Per-node target count: `num_vbuckets / n` plus one for the first
/// `num_vbuckets % n` nodes in sorted order.
fn target_counts(num_vbuckets: usize, sorted_keep: &[NodeId]) -> BTreeMap<NodeId, usize> {
    let n = sorted_keep.len();
    let base = num_vbuckets / n;
    let remainder = num_vbuckets % n;
    sorted_keep
        .iter()
        .enumerate()
        .map(|(i, node)| (node.clone(), if i < remainder { base + 1 } else { base }))
        .collect()
}

/// Fills one chain "column" (one slot position across every vbucket) over
/// `sorted_keep`, biased to retain whatever `current_map` already has there.
///
/// Three passes:
/// 1. Retain: keep `current_map`'s node at this column wherever it's still
///    in `keep`, doesn't duplicate an earlier slot in the same chain, and
///    the node's quota isn't already spent.
/// 2. Fill: round-robin the remaining slots over nodes with quota left,
///    skipping same-chain duplicates.
/// 3. Repair: a slot the fill pass couldn't place (every node with quota
///    left already sits earlier in that chain) is filled by swapping with
///    an already-assigned slot whose node the blocked chain can take,
///    handing the freed node to whichever node still has quota. Quota
///    neutral: it changes which vbucket a node serves, not how many.
fn assign_column(
    column: usize,
    num_vbuckets: usize,
    sorted_keep: &[NodeId],
    keep_set: &BTreeSet<&NodeId>,
    current_map: Option<&VbucketMap>,
    assigned: &mut [Vec<Option<NodeId>>],
) {
    let n = sorted_keep.len();
    let mut quotas = target_counts(num_vbuckets, sorted_keep);

    let current_at = |vb: usize| -> Option<NodeId> {
        let map = current_map?;
        if vb >= usize::from(map.num_vbuckets()) {
            return None;
        }
        let node = map.chain(u16::try_from(vb).ok()?).slots().get(column)?.clone()?;
        keep_set.contains(&node).then_some(node)
    };

    // Pass 1: retain.
    for vb in 0..num_vbuckets {
        if let Some(node) = current_at(vb) {
            let in_chain_already = assigned[vb][..column].iter().any(|s| s.as_ref() == Some(&node));
            if in_chain_already {
                continue;
            }
            if let Some(quota) = quotas.get_mut(&node) {
                if *quota > 0 {
                    *quota -= 1;
                    assigned[vb][column] = Some(node);
                }
            }
        }
    }

    // Pass 2: round-robin fill.
    let mut cursor = 0usize;
    let mut blocked = Vec::new();
    for vb in 0..num_vbuckets {
        if assigned[vb][column].is_some() {
            continue;
        }
        let mut placed = false;
        for step in 0..n {
            let idx = (cursor + step) % n;
            let candidate = &sorted_keep[idx];
            if assigned[vb][..column].iter().any(|s| s.as_ref() == Some(candidate)) {
                continue;
            }
            if let Some(quota) = quotas.get_mut(candidate) {
                if *quota > 0 {
                    *quota -= 1;
                    assigned[vb][column] = Some(candidate.clone());
                    cursor = (idx + 1) % n;
                    placed = true;
                    break;
                }
            }
        }
        if !placed {
            blocked.push(vb);
        }
    }

    // Pass 3: donor-swap repair.
    for vb in blocked {
        let swap = (0..num_vbuckets).find_map(|donor| {
            if donor == vb {
                return None;
            }
            let donor_node = assigned[donor][column].clone()?;
            if assigned[vb][..column].iter().any(|s| s.as_ref() == Some(&donor_node)) {
                return None;
            }
            let replacement = quotas.iter().find_map(|(candidate, &quota)| {
                let eligible = quota > 0
                    && *candidate != donor_node
                    && !assigned[donor][..column].iter().any(|s| s.as_ref() == Some(candidate));
                eligible.then(|| candidate.clone())
            })?;
            Some((donor, replacement, donor_node))
        });
        if let Some((donor, replacement, donor_node)) = swap {
            *quotas.get_mut(&replacement).expect("quota entry exists") -= 1;
            assigned[donor][column] = Some(replacement);
            assigned[vb][column] = Some(donor_node);
        }
        // Otherwise the slot stays unassigned -- no legal placement exists
        // under the current keep-set and chain-length, which only happens
        // when the cluster is too small to fill every replica slot.
    }
}

fn fresh_balanced_map(keep: &[NodeId], opts: &MapOptions, current_map: Option<&VbucketMap>) -> VbucketMap {
    let mut sorted_keep: Vec<NodeId> = keep.to_vec();
    sorted_keep.sort();
    let n = sorted_keep.len();
    let chain_len = usize::from(opts.num_replicas) + 1;
    let num_vbuckets = usize::from(opts.num_vbuckets);

    if n == 0 {
        return VbucketMap::unassigned(opts.num_vbuckets, opts.num_replicas);
    }

    let keep_set: BTreeSet<&NodeId> = sorted_keep.iter().collect();
    let mut assigned: Vec<Vec<Option<NodeId>>> = vec![vec![None; chain_len]; num_vbuckets];

    for column in 0..chain_len.min(n) {
        assign_column(column, num_vbuckets, &sorted_keep, &keep_set, current_map, &mut assigned);
    }

    let chains = assigned
        .into_iter()
        .map(|mut slots| {
            if let Some(tags) = &opts.tags {
                repair_tag_diversity(&mut slots, &sorted_keep, tags);
            }
            Chain::new(slots)
        })
        .collect();

    VbucketMap::new(chains)
}

/// Best-effort repair: for each slot after the first, if its tag collides
/// with an earlier slot in the same chain, try swapping in a same-chain-absent
/// node that is untagged-so-far, scanning the sorted keep-set from the
/// current occupant onward. Leaves the slot unchanged if no swap helps
/// (tag diversity is a preference, not an invariant -- §4.2 step 3).
fn repair_tag_diversity(
    slots: &mut [Option<NodeId>],
    sorted_keep: &[NodeId],
    tags: &BTreeMap<NodeId, String>,
) {
    let n = sorted_keep.len();
    let mut used_tags: BTreeSet<String> = BTreeSet::new();
    let mut used_nodes: BTreeSet<NodeId> = BTreeSet::new();

    for slot in slots.iter_mut() {
        let Some(node) = slot.clone() else { continue };
        let node_tag = tags.get(&node).cloned();

        let collides = node_tag
            .as_ref()
            .is_some_and(|tag| used_tags.contains(tag));

        if collides {
            let start = sorted_keep.iter().position(|n| *n == node).unwrap_or(0);
            let mut replacement = None;
            for offset in 1..n {
                let candidate = &sorted_keep[(start + offset) % n];
                if used_nodes.contains(candidate) {
                    continue;
                }
                let candidate_tag = tags.get(candidate);
                if candidate_tag.is_none_or(|t| !used_tags.contains(t)) {
                    replacement = Some(candidate.clone());
                    break;
                }
            }
            if let Some(replacement) = replacement {
                if let Some(tag) = tags.get(&replacement) {
                    used_tags.insert(tag.clone());
                }
                used_nodes.insert(replacement.clone());
                *slot = Some(replacement);
                continue;
            }
        }

        if let Some(tag) = node_tag {
            used_tags.insert(tag);
        }
        used_nodes.insert(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }

    fn group(uuid: &str, nodes: &[&str]) -> ServerGroup {
        ServerGroup {
            uuid: uuid.into(),
            name: uuid.into(),
            nodes: nodes.iter().map(|n| node(n)).collect(),
        }
    }

    fn no_prior_map(opts: &MapOptions) -> VbucketMap {
        VbucketMap::unassigned(opts.num_vbuckets, opts.num_replicas)
    }

    #[test]
    fn build_map_options_has_no_tags_with_single_group() {
        let groups = vec![group("g1", &["n1", "n2"])];
        let opts = build_map_options(&[node("n1"), node("n2")], 4, 1, &groups).unwrap();
        assert!(opts.tags.is_none());
    }

    #[test]
    fn build_map_options_tags_nodes_across_two_groups() {
        let groups = vec![group("g1", &["n1"]), group("g2", &["n2"])];
        let opts = build_map_options(&[node("n1"), node("n2")], 4, 1, &groups).unwrap();
        let tags = opts.tags.unwrap();
        assert_eq!(tags.get(&node("n1")), Some(&"g1".to_string()));
        assert_eq!(tags.get(&node("n2")), Some(&"g2".to_string()));
    }

    #[test]
    fn build_map_options_errors_on_ungrouped_node() {
        let groups = vec![group("g1", &["n1"]), group("g2", &["n2"])];
        let result = build_map_options(&[node("n1"), node("n2"), node("n3")], 4, 1, &groups);
        assert!(matches!(result, Err(OrchestratorError::ServerGroupsRace)));
    }

    #[test]
    fn generate_initial_map_has_no_duplicates_per_chain() {
        let keep = vec![node("n1"), node("n2"), node("n3")];
        let opts = MapOptions {
            num_vbuckets: 8,
            num_replicas: 1,
            tags: None,
        };
        let map = generate_initial_map(&keep, &opts);
        for (_, chain) in map.iter() {
            assert!(chain.has_no_duplicates());
        }
    }

    #[test]
    fn generate_initial_map_balances_masters_within_one() {
        let keep: Vec<NodeId> = (0..4).map(|i| node(&format!("n{i}"))).collect();
        let opts = MapOptions {
            num_vbuckets: 1024,
            num_replicas: 1,
            tags: None,
        };
        let map = generate_initial_map(&keep, &opts);
        let mut counts: BTreeMap<NodeId, usize> = BTreeMap::new();
        for (_, chain) in map.iter() {
            *counts.entry(chain.master().unwrap().clone()).or_insert(0) += 1;
        }
        let min = *counts.values().min().unwrap();
        let max = *counts.values().max().unwrap();
        assert!(max - min <= 1);
        assert_eq!(counts.len(), 4);
        assert_eq!(counts[&node("n0")], 256);
    }

    #[test]
    fn generate_vbucket_map_is_deterministic() {
        let keep = vec![node("n1"), node("n2"), node("n3")];
        let opts = MapOptions {
            num_vbuckets: 16,
            num_replicas: 1,
            tags: None,
        };
        let current = no_prior_map(&opts);
        let a = generate_vbucket_map(&current, &keep, &opts, &[]);
        let b = generate_vbucket_map(&current, &keep, &opts, &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn generate_vbucket_map_reuses_compatible_history() {
        let keep = vec![node("n1"), node("n2")];
        let opts = MapOptions {
            num_vbuckets: 4,
            num_replicas: 1,
            tags: None,
        };
        let past_map = generate_initial_map(&keep, &opts);
        let history = vec![MapHistoryEntry {
            map: past_map.clone(),
            options: opts.clone(),
        }];
        let current = no_prior_map(&opts);
        let generated = generate_vbucket_map(&current, &keep, &opts, &history);
        assert_eq!(generated, past_map);
    }

    #[test]
    fn generate_vbucket_map_ignores_history_incompatible_with_keep() {
        let opts = MapOptions {
            num_vbuckets: 4,
            num_replicas: 1,
            tags: None,
        };
        let stale_keep = vec![node("n1"), node("n2")];
        let stale_map = generate_initial_map(&stale_keep, &opts);
        let history = vec![MapHistoryEntry {
            map: stale_map.clone(),
            options: opts.clone(),
        }];
        let keep = vec![node("n1"), node("n3")];
        let current = no_prior_map(&opts);
        let generated = generate_vbucket_map(&current, &keep, &opts, &history);
        assert_ne!(generated, stale_map);
        for (_, chain) in generated.iter() {
            assert!(!chain.contains(&node("n2")));
        }
    }

    #[test]
    fn generate_vbucket_map_retains_slots_the_new_keep_set_still_has() {
        let initial = vec![node("n1"), node("n2"), node("n3")];
        let opts = MapOptions {
            num_vbuckets: 12,
            num_replicas: 1,
            tags: None,
        };
        let current = generate_initial_map(&initial, &opts);
        let keep = vec![node("n1"), node("n2"), node("n3"), node("n4")];
        let generated = generate_vbucket_map(&current, &keep, &opts, &[]);

        let mut retained = 0usize;
        for (vbucket_id, chain) in generated.iter() {
            if chain.master() == current.chain(vbucket_id).master() {
                retained += 1;
            }
        }
        // Adding a fourth node to a 3-node map only needs to move roughly a
        // quarter of the masters; a generator blind to `current_map` would
        // retain none of them.
        assert!(retained > 0, "expected some masters to be retained across the rebalance");
    }

    #[test]
    fn tag_repair_spreads_chain_across_distinct_groups_when_feasible() {
        let keep = vec![node("n1"), node("n2"), node("n3"), node("n4")];
        let mut tags = BTreeMap::new();
        tags.insert(node("n1"), "rack-a".to_string());
        tags.insert(node("n2"), "rack-a".to_string());
        tags.insert(node("n3"), "rack-b".to_string());
        tags.insert(node("n4"), "rack-b".to_string());
        let opts = MapOptions {
            num_vbuckets: 8,
            num_replicas: 1,
            tags: Some(tags.clone()),
        };
        let map = generate_initial_map(&keep, &opts);
        for (_, chain) in map.iter() {
            let slot_tags: Vec<&String> = chain
                .slots()
                .iter()
                .flatten()
                .filter_map(|n| tags.get(n))
                .collect();
            let unique: BTreeSet<&String> = slot_tags.iter().copied().collect();
            assert_eq!(slot_tags.len(), unique.len(), "chain should not repeat a tag");
        }
    }
}
