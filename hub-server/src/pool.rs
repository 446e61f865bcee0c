//! The multi-source report pool: per-object, per-source report buckets, per
//! spec.md §4.1. Generic over scope — the same map shape and mutators back
//! the player, entity and waypoint pools in [`crate::state::HubState`].

use serde_json::Value;
use std::collections::HashMap;

/// One source's reported value for one object, with the bookkeeping needed
/// for arbitration, timeout and legacy broadcast.
#[derive(Debug, Clone)]
pub struct ReportNode {
    pub timestamp: f64,
    pub submit_player_id: Option<String>,
    pub data: Value,
}

/// `object_id -> source_id -> node`.
pub type ReportMap = HashMap<String, HashMap<String, ReportNode>>;

/// Inserts or overwrites one source's report for one object.
pub fn upsert(map: &mut ReportMap, object_id: &str, source_id: &str, node: ReportNode) {
    map.entry(object_id.to_string())
        .or_default()
        .insert(source_id.to_string(), node);
}

/// Removes one source's report for one object, pruning the object's bucket
/// if it becomes empty as a result. Returns whether anything was removed.
///
/// A bucket is never left empty in the map — every mutator here enforces
/// that invariant centrally rather than leaving it to callers.
pub fn delete(map: &mut ReportMap, object_id: &str, source_id: &str) -> bool {
    let Some(bucket) = map.get_mut(object_id) else {
        return false;
    };
    let removed = bucket.remove(source_id).is_some();
    if bucket.is_empty() {
        map.remove(object_id);
    }
    removed
}

/// Replaces everything a source has reported in this scope with exactly the
/// given set of object ids — a full replace, not a merge, matching
/// `*_update` messages (spec.md §4.6).
pub fn full_replace_for_source(
    map: &mut ReportMap,
    source_id: &str,
    nodes: HashMap<String, ReportNode>,
) {
    prune_source(map, source_id);
    for (object_id, node) in nodes {
        upsert(map, &object_id, source_id, node);
    }
}

/// Removes every report a given source contributed to this scope, wherever
/// its object id may be. Used on disconnect and before a full replace.
pub fn prune_source(map: &mut ReportMap, source_id: &str) {
    for object_id in map.keys().cloned().collect::<Vec<_>>() {
        delete(map, &object_id, source_id);
    }
}

/// Looks up one source's current report for one object, used to merge
/// incoming `*_patch` messages onto a baseline.
pub fn snapshot_of_source<'a>(
    map: &'a ReportMap,
    object_id: &str,
    source_id: &str,
) -> Option<&'a ReportNode> {
    map.get(object_id)?.get(source_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(ts: f64) -> ReportNode {
        ReportNode {
            timestamp: ts,
            submit_player_id: Some("s1".to_string()),
            data: serde_json::json!({"x": 1.0}),
        }
    }

    #[test]
    fn upsert_then_delete_prunes_empty_bucket() {
        let mut map: ReportMap = HashMap::new();
        upsert(&mut map, "obj1", "s1", node(1.0));
        assert!(map.contains_key("obj1"));
        assert!(delete(&mut map, "obj1", "s1"));
        assert!(!map.contains_key("obj1"));
    }

    #[test]
    fn delete_missing_source_is_a_no_op() {
        let mut map: ReportMap = HashMap::new();
        upsert(&mut map, "obj1", "s1", node(1.0));
        assert!(!delete(&mut map, "obj1", "s2"));
        assert!(map.contains_key("obj1"));
    }

    #[test]
    fn full_replace_drops_objects_no_longer_reported() {
        let mut map: ReportMap = HashMap::new();
        upsert(&mut map, "e1", "s1", node(1.0));
        upsert(&mut map, "e2", "s1", node(1.0));

        let mut next = HashMap::new();
        next.insert("e2".to_string(), node(2.0));
        next.insert("e3".to_string(), node(2.0));
        full_replace_for_source(&mut map, "s1", next);

        assert!(!map.contains_key("e1"));
        assert!(map.contains_key("e2"));
        assert!(map.contains_key("e3"));
    }

    #[test]
    fn prune_source_clears_only_that_source() {
        let mut map: ReportMap = HashMap::new();
        upsert(&mut map, "e1", "s1", node(1.0));
        upsert(&mut map, "e1", "s2", node(1.0));
        prune_source(&mut map, "s1");
        assert!(map.contains_key("e1"));
        assert!(snapshot_of_source(&map, "e1", "s1").is_none());
        assert!(snapshot_of_source(&map, "e1", "s2").is_some());
    }

    #[test]
    fn snapshot_of_source_reads_without_mutating() {
        let mut map: ReportMap = HashMap::new();
        upsert(&mut map, "e1", "s1", node(3.0));
        let found = snapshot_of_source(&map, "e1", "s1").unwrap();
        assert_eq!(found.timestamp, 3.0);
    }
}
