//! Delta recovery planning (§4.3): re-admit previously failed-over nodes
//! while keeping their retained local data.

use std::collections::{BTreeMap, BTreeSet};

use vbucket_core::{BucketConfig, Chain, MapHistoryEntry, MapOptions, NodeId, VbucketMap};

/// Which buckets a delta recovery request names.
#[derive(Debug, Clone)]
pub enum RequestedBuckets {
    All,
    Named(BTreeSet<String>),
}

impl RequestedBuckets {
    fn includes(&self, bucket: &str) -> bool {
        match self {
            RequestedBuckets::All => true,
            RequestedBuckets::Named(names) => names.contains(bucket),
        }
    }
}

/// A single bucket's accepted delta recovery plan: the historical map/options
/// chosen as the recovery target.
#[derive(Debug, Clone)]
pub struct DeltaRecoveryPlan {
    pub bucket: String,
    pub past_map: VbucketMap,
    pub past_options: MapOptions,
}

/// History entries congruent with the cluster's current map options and
/// referring only to nodes in `all_nodes` (§4.3 step 1), most-recent first.
#[must_use]
pub fn find_matching_past_maps<'a>(
    all_nodes: &BTreeSet<NodeId>,
    current_opts: &MapOptions,
    history: &'a [MapHistoryEntry],
) -> Vec<&'a MapHistoryEntry> {
    let current_hash = current_opts.hash_key();
    history
        .iter()
        .rev()
        .filter(|entry| {
            entry.options.hash_key() == current_hash
                && entry.map.num_vbuckets() == current_opts.num_vbuckets
                && entry
                    .map
                    .chains()
                    .iter()
                    .all(|chain| chain.slots().iter().flatten().all(|n| all_nodes.contains(n)))
        })
        .collect()
}

/// Picks the first candidate under which every node in `recovering` owns
/// exactly its recorded failover vbuckets (§4.3 step 2-3). `failover_record`
/// maps a recovering node to the vbucket ids it served when failed over (an
/// empty set if it was never failed over in this bucket).
#[must_use]
pub fn plan_delta_recovery(
    candidates: &[&MapHistoryEntry],
    recovering: &BTreeSet<NodeId>,
    failover_record: &BTreeMap<NodeId, BTreeSet<u16>>,
) -> Option<MapHistoryEntry> {
    'candidate: for candidate in candidates {
        for node in recovering {
            let expected = failover_record.get(node).cloned().unwrap_or_default();
            let actual: BTreeSet<u16> = candidate
                .map
                .iter()
                .filter(|(_, chain)| chain.contains(node))
                .map(|(id, _)| id)
                .collect();
            if actual != expected {
                continue 'candidate;
            }
        }
        return Some((*candidate).clone());
    }
    None
}

/// Runs the planner over every membase bucket named by `requested`. If any
/// required bucket has no plan, the whole delta recovery is rejected: the
/// returned vector is empty (§4.3).
#[must_use]
pub fn build_delta_recovery_buckets(
    all_nodes: &BTreeSet<NodeId>,
    recovering: &BTreeSet<NodeId>,
    buckets: &[(String, BucketConfig, MapOptions, Vec<MapHistoryEntry>, BTreeMap<NodeId, BTreeSet<u16>>)],
    requested: &RequestedBuckets,
) -> Vec<DeltaRecoveryPlan> {
    let mut plans = Vec::new();
    for (name, config, current_opts, history, failover_record) in buckets {
        if !config.is_membase() || !requested.includes(name) {
            continue;
        }
        let candidates = find_matching_past_maps(all_nodes, current_opts, history);
        match plan_delta_recovery(&candidates, recovering, failover_record) {
            Some(entry) => plans.push(DeltaRecoveryPlan {
                bucket: name.clone(),
                past_map: entry.map,
                past_options: entry.options,
            }),
            None => return Vec::new(),
        }
    }
    plans
}

/// Builds the transitional map for one bucket (§4.3): preserved
/// not-in-`recovering` entries from `current`, then `recovering` nodes
/// placed at the positions they hold in `target`, padded/truncated to
/// `chain_len`.
#[must_use]
pub fn build_transitional_map(
    current: &VbucketMap,
    target: &VbucketMap,
    recovering: &BTreeSet<NodeId>,
    chain_len: usize,
) -> VbucketMap {
    let chains = current
        .chains()
        .iter()
        .zip(target.chains().iter())
        .map(|(cur_chain, tgt_chain)| {
            // Drop both recovering-node slots and already-empty slots here,
            // so the push loop below has room to place recovering nodes
            // even when their old position already reads `None` (the usual
            // case right after a hard failover padded the chain).
            let mut slots: Vec<Option<NodeId>> = cur_chain
                .slots()
                .iter()
                .filter(|slot| slot.as_ref().is_some_and(|n| !recovering.contains(n)))
                .cloned()
                .collect();
            for slot in tgt_chain.slots() {
                if let Some(node) = slot {
                    if recovering.contains(node) && !slots.iter().any(|s| s.as_ref() == Some(node))
                    {
                        slots.push(Some(node.clone()));
                    }
                }
            }
            slots.truncate(chain_len);
            slots.resize(chain_len, None);
            Chain::new(slots)
        })
        .collect();
    VbucketMap::new(chains)
}

/// `servers` for the transitional bucket config: `recovering ∪ original`
/// (§4.3), deduplicated and sorted for determinism.
#[must_use]
pub fn transitional_servers(original_servers: &[NodeId], recovering: &BTreeSet<NodeId>) -> Vec<NodeId> {
    let mut merged: BTreeSet<NodeId> = recovering.clone();
    merged.extend(original_servers.iter().cloned());
    merged.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use vbucket_core::BucketKind;

    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }

    fn chain(slots: &[Option<&str>]) -> Chain {
        Chain::new(slots.iter().map(|s| s.map(node)).collect())
    }

    fn opts(num_vbuckets: u16, num_replicas: u8) -> MapOptions {
        MapOptions {
            num_vbuckets,
            num_replicas,
            tags: None,
        }
    }

    #[test]
    fn find_matching_past_maps_filters_by_option_hash_and_members() {
        let all_nodes = BTreeSet::from([node("n1"), node("n2")]);
        let matching = MapHistoryEntry {
            map: VbucketMap::new(vec![chain(&[Some("n1"), Some("n2")])]),
            options: opts(1, 1),
        };
        let wrong_opts = MapHistoryEntry {
            map: VbucketMap::new(vec![chain(&[Some("n1"), Some("n2")])]),
            options: opts(1, 0),
        };
        let outside_members = MapHistoryEntry {
            map: VbucketMap::new(vec![chain(&[Some("n1"), Some("n3")])]),
            options: opts(1, 1),
        };
        let history = vec![wrong_opts, outside_members, matching.clone()];
        let current_opts = opts(1, 1);

        let candidates = find_matching_past_maps(&all_nodes, &current_opts, &history);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].map, matching.map);
    }

    #[test]
    fn plan_delta_recovery_matches_recorded_vbuckets() {
        let recovering = BTreeSet::from([node("n2")]);
        let mut failover_record = BTreeMap::new();
        failover_record.insert(node("n2"), BTreeSet::from([0]));

        let good = MapHistoryEntry {
            map: VbucketMap::new(vec![
                chain(&[Some("n1"), Some("n2")]),
                chain(&[Some("n1"), Some("n3")]),
            ]),
            options: opts(2, 1),
        };
        let bad = MapHistoryEntry {
            map: VbucketMap::new(vec![
                chain(&[Some("n2"), Some("n1")]),
                chain(&[Some("n1"), Some("n3")]),
            ]),
            options: opts(2, 1),
        };
        let candidates = vec![&bad, &good];
        let plan = plan_delta_recovery(&candidates, &recovering, &failover_record);
        assert_eq!(plan.unwrap().map, good.map);
    }

    #[test]
    fn plan_delta_recovery_returns_none_when_no_candidate_matches() {
        let recovering = BTreeSet::from([node("n2")]);
        let mut failover_record = BTreeMap::new();
        failover_record.insert(node("n2"), BTreeSet::from([0, 1]));
        let entry = MapHistoryEntry {
            map: VbucketMap::new(vec![chain(&[Some("n1"), Some("n2")])]),
            options: opts(1, 1),
        };
        let candidates = vec![&entry];
        assert!(plan_delta_recovery(&candidates, &recovering, &failover_record).is_none());
    }

    #[test]
    fn build_delta_recovery_buckets_rejects_all_when_one_bucket_has_no_plan() {
        let all_nodes = BTreeSet::from([node("n1"), node("n2")]);
        let recovering = BTreeSet::from([node("n2")]);

        let config = BucketConfig {
            name: "default".into(),
            kind: BucketKind::Membase,
            num_replicas: 1,
            num_vbuckets: 1,
            servers: vec![node("n1")],
            map: VbucketMap::unassigned(1, 1),
            fast_forward_map: None,
            map_opts_hash: None,
            delta_recovery_map: None,
        };

        let buckets = vec![(
            "default".to_string(),
            config,
            opts(1, 1),
            Vec::new(), // no history -> no candidates -> no plan
            BTreeMap::new(),
        )];

        let plans = build_delta_recovery_buckets(&all_nodes, &recovering, &buckets, &RequestedBuckets::All);
        assert!(plans.is_empty());
    }

    #[test]
    fn build_delta_recovery_buckets_succeeds_when_plan_exists() {
        let all_nodes = BTreeSet::from([node("n1"), node("n2")]);
        let recovering = BTreeSet::from([node("n2")]);

        let config = BucketConfig {
            name: "default".into(),
            kind: BucketKind::Membase,
            num_replicas: 1,
            num_vbuckets: 1,
            servers: vec![node("n1")],
            map: VbucketMap::unassigned(1, 1),
            fast_forward_map: None,
            map_opts_hash: None,
            delta_recovery_map: None,
        };
        let mut failover_record = BTreeMap::new();
        failover_record.insert(node("n2"), BTreeSet::from([0]));
        let history = vec![MapHistoryEntry {
            map: VbucketMap::new(vec![chain(&[Some("n1"), Some("n2")])]),
            options: opts(1, 1),
        }];

        let buckets = vec![("default".to_string(), config, opts(1, 1), history, failover_record)];
        let plans = build_delta_recovery_buckets(&all_nodes, &recovering, &buckets, &RequestedBuckets::All);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].bucket, "default");
    }

    #[test]
    fn transitional_map_keeps_preserved_entries_and_appends_recovering_nodes() {
        let current = VbucketMap::new(vec![chain(&[Some("n1"), Some("n2")])]);
        let target = VbucketMap::new(vec![chain(&[Some("n2"), Some("n1")])]);
        let recovering = BTreeSet::from([node("n2")]);

        let transitional = build_transitional_map(&current, &target, &recovering, 2);
        let slots = transitional.chain(0).slots();
        assert_eq!(slots[0], Some(node("n1")));
        assert_eq!(slots[1], Some(node("n2")));
    }

    #[test]
    fn transitional_servers_merges_and_dedups() {
        let servers = vec![node("n1"), node("n2")];
        let recovering = BTreeSet::from([node("n2"), node("n3")]);
        let merged = transitional_servers(&servers, &recovering);
        assert_eq!(merged, vec![node("n1"), node("n2"), node("n3")]);
    }
}
