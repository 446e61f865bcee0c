//! Picks one winning source per object out of a report pool, per spec.md
//! §4.2, and computes the scope-level patch between two resolved views.
//!
//! The tie-break order is pinned from `state.py::resolve_report_map` and
//! must not be reordered: **freshest** (by timestamp, lexicographic
//! `source_id` tiebreak on exact ties) first; *then* the **self-preference**
//! override (players only — the object id is also a valid source id when a
//! player reports on themselves) within the switch threshold; *then*
//! **stickiness** to the previously-selected source, applied last so it can
//! override the self-preference pick.

use crate::pool::{ReportMap, ReportNode};
use crate::state::ResolvedMap;
use serde_json::Value;
use std::collections::HashMap;

fn node_timestamp(node: &ReportNode) -> f64 {
    node.timestamp
}

/// Resolves one scope's report pool into a winning node per object,
/// updating `selected_sources` in place for next tick's stickiness check.
///
/// `prefer_object_id_source` enables the self-preference override and is
/// `true` only for the player scope (spec.md §4.2: an object reporting on
/// itself, i.e. `object_id == source_id`, is preferred within the switch
/// threshold).
pub fn resolve_report_map(
    report_map: &ReportMap,
    selected_sources: &mut HashMap<String, String>,
    switch_threshold_sec: f64,
    prefer_object_id_source: bool,
) -> ResolvedMap {
    let mut resolved = ResolvedMap::new();
    let mut next_selected = HashMap::new();

    for (object_id, bucket) in report_map {
        if bucket.is_empty() {
            continue;
        }

        let mut best_source_id: Option<&String> = None;
        let mut best_node: Option<&ReportNode> = None;
        let mut best_timestamp = f64::NEG_INFINITY;

        for (source_id, node) in bucket {
            let ts = node_timestamp(node);
            if ts > best_timestamp {
                best_source_id = Some(source_id);
                best_node = Some(node);
                best_timestamp = ts;
                continue;
            }
            if ts == best_timestamp {
                let current_best = best_source_id.map(String::as_str).unwrap_or("");
                if source_id.as_str() < current_best {
                    best_source_id = Some(source_id);
                    best_node = Some(node);
                }
            }
        }

        let mut chosen_source_id = best_source_id;
        let mut chosen_node = best_node;

        if prefer_object_id_source {
            if let Some(preferred_node) = bucket.get(object_id) {
                let preferred_ts = node_timestamp(preferred_node);
                if best_timestamp - preferred_ts <= switch_threshold_sec {
                    chosen_source_id = Some(object_id);
                    chosen_node = Some(preferred_node);
                }
            }
        }

        if let Some(previous_source) = selected_sources.get(object_id) {
            if let Some(previous_node) = bucket.get(previous_source) {
                let previous_ts = node_timestamp(previous_node);
                let chosen_ts = chosen_node.map(node_timestamp).unwrap_or(f64::NEG_INFINITY);
                if chosen_ts - previous_ts <= switch_threshold_sec {
                    chosen_source_id = Some(previous_source);
                    chosen_node = Some(previous_node);
                }
            }
        }

        if let (Some(source_id), Some(node)) = (chosen_source_id, chosen_node) {
            resolved.insert(object_id.clone(), node.clone());
            next_selected.insert(object_id.clone(), source_id.clone());
        }
    }

    *selected_sources = next_selected;
    resolved
}

/// The field-level delta between an old and new value for one object. A
/// brand-new object's delta is its full data (there's no old value to diff).
fn field_delta(old_data: Option<&Value>, new_data: &Value) -> Value {
    let Some(Value::Object(old_obj)) = old_data else {
        return new_data.clone();
    };
    let Value::Object(new_obj) = new_data else {
        return new_data.clone();
    };
    let mut delta = serde_json::Map::new();
    for (key, value) in new_obj {
        if old_obj.get(key) != Some(value) {
            delta.insert(key.clone(), value.clone());
        }
    }
    Value::Object(delta)
}

/// Computes `{upsert, delete}` between two resolved views for one scope.
/// Deletes are the set difference `old_keys - new_keys`, sorted for stable
/// wire output; upserts only carry changed fields (or the full object for a
/// newly-appearing id).
pub fn compute_scope_patch(old_map: &ResolvedMap, new_map: &ResolvedMap) -> protocol::ScopePatch {
    let mut delete: Vec<String> = old_map
        .keys()
        .filter(|id| !new_map.contains_key(*id))
        .cloned()
        .collect();
    delete.sort();

    let mut upsert = HashMap::new();
    for (object_id, new_node) in new_map {
        let old_data = old_map.get(object_id).map(|n| &n.data);
        let delta = field_delta(old_data, &new_node.data);
        let has_changes = match &delta {
            Value::Object(obj) => !obj.is_empty(),
            _ => true,
        };
        if has_changes {
            upsert.insert(object_id.clone(), delta);
        }
    }

    protocol::ScopePatch { upsert, delete }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(ts: f64, data: Value) -> ReportNode {
        ReportNode {
            timestamp: ts,
            submit_player_id: None,
            data,
        }
    }

    fn bucket(entries: &[(&str, f64)]) -> HashMap<String, ReportNode> {
        entries
            .iter()
            .map(|(source, ts)| (source.to_string(), node(*ts, serde_json::json!({"x": ts}))))
            .collect()
    }

    #[test]
    fn freshest_source_wins_without_tiebreak() {
        let mut pool: ReportMap = HashMap::new();
        pool.insert("obj1".to_string(), bucket(&[("a", 1.0), ("b", 2.0)]));
        let mut selected = HashMap::new();
        let resolved = resolve_report_map(&pool, &mut selected, 0.35, false);
        assert_eq!(selected.get("obj1").unwrap(), "b");
        assert_eq!(resolved["obj1"].timestamp, 2.0);
    }

    #[test]
    fn exact_tie_breaks_lexicographically_on_source_id() {
        let mut pool: ReportMap = HashMap::new();
        pool.insert("obj1".to_string(), bucket(&[("zeta", 5.0), ("alpha", 5.0)]));
        let mut selected = HashMap::new();
        let resolved = resolve_report_map(&pool, &mut selected, 0.35, false);
        assert_eq!(selected.get("obj1").unwrap(), "alpha");
        assert_eq!(resolved["obj1"].timestamp, 5.0);
    }

    #[test]
    fn self_preference_overrides_within_threshold_for_players() {
        let mut pool: ReportMap = HashMap::new();
        // object id "p1" is also a source id: the player reporting themselves.
        pool.insert("p1".to_string(), bucket(&[("other", 10.0), ("p1", 9.8)]));
        let mut selected = HashMap::new();
        let resolved = resolve_report_map(&pool, &mut selected, 0.35, true);
        assert_eq!(selected.get("p1").unwrap(), "p1");
        assert_eq!(resolved["p1"].timestamp, 9.8);
    }

    #[test]
    fn self_preference_does_not_apply_outside_threshold() {
        let mut pool: ReportMap = HashMap::new();
        pool.insert("p1".to_string(), bucket(&[("other", 10.0), ("p1", 9.0)]));
        let mut selected = HashMap::new();
        let resolved = resolve_report_map(&pool, &mut selected, 0.35, true);
        assert_eq!(selected.get("p1").unwrap(), "other");
        assert_eq!(resolved["p1"].timestamp, 10.0);
    }

    #[test]
    fn stickiness_overrides_self_preference_when_applied_last() {
        let mut pool: ReportMap = HashMap::new();
        pool.insert("p1".to_string(), bucket(&[("other", 10.0), ("p1", 9.8), ("sticky", 9.7)]));
        let mut selected = HashMap::new();
        selected.insert("p1".to_string(), "sticky".to_string());
        let resolved = resolve_report_map(&pool, &mut selected, 0.35, true);
        // Self-preference would pick "p1" (within 0.35 of best=10.0), but the
        // previously-selected "sticky" source (within 0.35 of the chosen
        // value) is applied afterward and wins.
        assert_eq!(selected.get("p1").unwrap(), "sticky");
        assert_eq!(resolved["p1"].timestamp, 9.7);
    }

    #[test]
    fn scope_patch_reports_deletes_and_field_level_upserts() {
        let mut old_map = ResolvedMap::new();
        old_map.insert("a".to_string(), node(1.0, serde_json::json!({"x": 0, "y": 0})));
        old_map.insert("b".to_string(), node(1.0, serde_json::json!({"x": 0})));

        let mut new_map = ResolvedMap::new();
        new_map.insert("a".to_string(), node(2.0, serde_json::json!({"x": 1, "y": 0})));
        new_map.insert("c".to_string(), node(2.0, serde_json::json!({"x": 5})));

        let patch = compute_scope_patch(&old_map, &new_map);
        assert_eq!(patch.delete, vec!["b".to_string()]);
        assert_eq!(patch.upsert["a"], serde_json::json!({"x": 1}));
        assert_eq!(patch.upsert["c"], serde_json::json!({"x": 5}));
    }
}
