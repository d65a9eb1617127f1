//! Bucket configuration, map options, and map history (§3).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::map::VbucketMap;
use crate::node::NodeId;

/// Bucket kind; dispatch differs per §4.7/§4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    Membase,
    Memcached,
}

/// The options a map was generated under. Two maps generated from equal
/// options (under the same tag policy) are considered interchangeable by
/// [`crate::map::VbucketMap`]-level compatibility checks (§4.2 step 2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapOptions {
    pub num_vbuckets: u16,
    pub num_replicas: u8,
    /// `(node, server-group uuid)` pairs, restricted to the keep-set in use
    /// when these options were computed. `None` when fewer than two
    /// non-empty groups intersect the keep-set (§4.2 step 1).
    pub tags: Option<BTreeMap<NodeId, String>>,
}

impl MapOptions {
    #[must_use]
    pub fn hash_key(&self) -> String {
        // A stable textual digest, not a cryptographic hash: used only to
        // detect "does this map need regenerating", not for security.
        let mut tags: Vec<(&NodeId, &String)> = self
            .tags
            .as_ref()
            .map(|t| t.iter().collect())
            .unwrap_or_default();
        tags.sort_by(|a, b| a.0.cmp(b.0));
        let tags_repr: String = tags
            .iter()
            .map(|(n, g)| format!("{n}={g}"))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "v{}-r{}-t[{}]",
            self.num_vbuckets, self.num_replicas, tags_repr
        )
    }
}

/// A bucket's persisted configuration (§3 Bucket Config).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
    pub name: String,
    pub kind: BucketKind,
    pub num_replicas: u8,
    pub num_vbuckets: u16,
    pub servers: Vec<NodeId>,
    pub map: VbucketMap,
    pub fast_forward_map: Option<VbucketMap>,
    pub map_opts_hash: Option<String>,
    pub delta_recovery_map: Option<VbucketMap>,
}

impl BucketConfig {
    #[must_use]
    pub fn chain_len(&self) -> usize {
        usize::from(self.num_replicas) + 1
    }

    #[must_use]
    pub fn is_membase(&self) -> bool {
        matches!(self.kind, BucketKind::Membase)
    }
}

/// One entry of the bounded map history (§3 Map History).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapHistoryEntry {
    pub map: VbucketMap,
    pub options: MapOptions,
}

/// A bounded append-only log of committed maps, most-recent last.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapHistory {
    entries: Vec<MapHistoryEntry>,
    capacity: usize,
}

impl MapHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    pub fn push(&mut self, entry: MapHistoryEntry) {
        self.entries.push(entry);
        if self.entries.len() > self.capacity {
            self.entries.remove(0);
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[MapHistoryEntry] {
        &self.entries
    }

    /// Most recent entries first, the order [`crate::recovery`] planners scan in.
    pub fn iter_most_recent_first(&self) -> impl Iterator<Item = &MapHistoryEntry> {
        self.entries.iter().rev()
    }
}

/// Per-node, per-bucket record of vbuckets owned at the moment of hard
/// failover (§3 Failover Vbuckets Record). Consulted by delta recovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailoverVbucketsRecord {
    // bucket name -> node -> vbucket ids it served when failed over.
    by_bucket: BTreeMap<String, BTreeMap<NodeId, BTreeSet<u16>>>,
}

impl FailoverVbucketsRecord {
    pub fn record(&mut self, bucket: &str, node: NodeId, vbuckets: BTreeSet<u16>) {
        self.by_bucket
            .entry(bucket.to_string())
            .or_default()
            .insert(node, vbuckets);
    }

    #[must_use]
    pub fn get(&self, bucket: &str, node: &NodeId) -> Option<&BTreeSet<u16>> {
        self.by_bucket.get(bucket).and_then(|m| m.get(node))
    }

    pub fn clear(&mut self, bucket: &str, node: &NodeId) {
        if let Some(m) = self.by_bucket.get_mut(bucket) {
            m.remove(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }

    #[test]
    fn map_options_hash_key_is_order_independent_over_tags() {
        let mut tags_a = BTreeMap::new();
        tags_a.insert(node("n1"), "g1".to_string());
        tags_a.insert(node("n2"), "g2".to_string());
        let opts_a = MapOptions {
            num_vbuckets: 8,
            num_replicas: 1,
            tags: Some(tags_a),
        };

        let mut tags_b = BTreeMap::new();
        tags_b.insert(node("n2"), "g2".to_string());
        tags_b.insert(node("n1"), "g1".to_string());
        let opts_b = MapOptions {
            num_vbuckets: 8,
            num_replicas: 1,
            tags: Some(tags_b),
        };

        assert_eq!(opts_a.hash_key(), opts_b.hash_key());
    }

    #[test]
    fn map_options_hash_key_differs_on_replica_count() {
        let opts_a = MapOptions {
            num_vbuckets: 8,
            num_replicas: 1,
            tags: None,
        };
        let opts_b = MapOptions {
            num_vbuckets: 8,
            num_replicas: 2,
            tags: None,
        };
        assert_ne!(opts_a.hash_key(), opts_b.hash_key());
    }

    #[test]
    fn map_history_evicts_oldest_beyond_capacity() {
        let opts = MapOptions {
            num_vbuckets: 1,
            num_replicas: 0,
            tags: None,
        };
        let mut history = MapHistory::new(2);
        for i in 0..3u16 {
            history.push(MapHistoryEntry {
                map: VbucketMap::unassigned(i + 1, 0),
                options: opts.clone(),
            });
        }
        assert_eq!(history.entries().len(), 2);
        assert_eq!(history.entries()[0].map.num_vbuckets(), 2);
    }

    #[test]
    fn map_history_most_recent_first_reverses_push_order() {
        let opts = MapOptions {
            num_vbuckets: 1,
            num_replicas: 0,
            tags: None,
        };
        let mut history = MapHistory::new(4);
        history.push(MapHistoryEntry {
            map: VbucketMap::unassigned(1, 0),
            options: opts.clone(),
        });
        history.push(MapHistoryEntry {
            map: VbucketMap::unassigned(2, 0),
            options: opts,
        });
        let first = history.iter_most_recent_first().next().unwrap();
        assert_eq!(first.map.num_vbuckets(), 2);
    }

    #[test]
    fn failover_vbuckets_record_tracks_per_bucket_per_node() {
        let mut record = FailoverVbucketsRecord::default();
        record.record("default", node("n2"), BTreeSet::from([7, 9]));
        assert_eq!(
            record.get("default", &node("n2")),
            Some(&BTreeSet::from([7, 9]))
        );
        assert_eq!(record.get("default", &node("n3")), None);

        record.clear("default", &node("n2"));
        assert_eq!(record.get("default", &node("n2")), None);
    }
}
