//! Per-message mutation logic for the `READY` half of the ingest state
//! machine (spec.md §4.6). Pure state mutation: no socket I/O, no broadcast
//! dispatch — callers (`session.rs`, `admin.rs`) decide what happens next
//! based on the returned [`IngestEffect`].
//!
//! Validation failures are swallowed per object id (spec.md §7): the
//! offending id is skipped and logged at debug, the rest of the message
//! still applies.

use crate::pool::{self, ReportMap, ReportNode};
use crate::state::HubState;
use protocol::{EntityData, HubConfig, PlayerData, Schema, TabPlayerEntry, WaypointData};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Which pool a missing-baseline patch id belongs to, so the caller can
/// shape the right `refresh_req{players|entities}` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Players,
    Entities,
}

/// What the caller should do after a message was ingested.
#[derive(Debug, Default)]
pub struct IngestEffect {
    /// A broadcast tick should run (most mutating messages).
    pub broadcast: bool,
    /// Only the admin snapshot should be pushed, no core tick
    /// (`tab_players_update`: it affects the *next* tick's visibility, not
    /// this tick's arbitration).
    pub admin_snapshot_only: bool,
    /// Ids that arrived in a patch with no existing baseline, grouped by
    /// scope, for the caller to turn into a `missing_baseline_patch`
    /// `refresh_req` (still subject to the per-source cooldown).
    pub missing_baseline: Option<(Scope, Vec<String>)>,
}

fn upsert_validated<T: Schema>(
    map: &mut ReportMap,
    source_id: &str,
    now: f64,
    raw_by_id: HashMap<String, Value>,
) {
    for (object_id, raw) in raw_by_id {
        match T::normalize(&raw) {
            Ok(data) => {
                pool::upsert(
                    map,
                    &object_id,
                    source_id,
                    ReportNode { timestamp: now, submit_player_id: Some(source_id.to_string()), data },
                );
            }
            Err(err) => debug!(object_id, source_id, %err, "dropping invalid report"),
        }
    }
}

/// `players_update`: a merge-upsert, no implicit deletion of ids missing
/// from this message (spec.md §4.6).
pub fn players_update(state: &mut HubState, now: f64, source_id: &str, players: HashMap<String, Value>) {
    upsert_validated::<PlayerData>(&mut state.player_reports, source_id, now, players);
}

/// `entities_update`: "this source's complete entity set for this round" —
/// full-replace, unlike `players_update`.
pub fn entities_update(state: &mut HubState, now: f64, source_id: &str, entities: HashMap<String, Value>) {
    let mut nodes = HashMap::new();
    for (object_id, raw) in entities {
        match EntityData::normalize(&raw) {
            Ok(data) => {
                nodes.insert(object_id, ReportNode { timestamp: now, submit_player_id: Some(source_id.to_string()), data });
            }
            Err(err) => debug!(object_id, source_id, %err, "dropping invalid entity report"),
        }
    }
    pool::full_replace_for_source(&mut state.entity_reports, source_id, nodes);
}

fn apply_patch<T: Schema>(
    map: &mut ReportMap,
    source_id: &str,
    now: f64,
    upsert: HashMap<String, Value>,
    delete: Vec<String>,
) -> Vec<String> {
    let mut missing_baseline = Vec::new();
    for (object_id, patch) in upsert {
        let existing = pool::snapshot_of_source(map, &object_id, source_id).map(|n| &n.data);
        let had_baseline = existing.is_some();
        match T::merge_and_normalize(existing, &patch) {
            Ok(data) => {
                pool::upsert(
                    map,
                    &object_id,
                    source_id,
                    ReportNode { timestamp: now, submit_player_id: Some(source_id.to_string()), data },
                );
            }
            Err(err) => {
                // No prior baseline to merge onto means the partial patch is
                // missing required fields by construction — flag it so the
                // caller can ask the source to resend a full report, mirroring
                // `main.py`'s `except ValidationError` branch.
                if !had_baseline {
                    missing_baseline.push(object_id.clone());
                }
                debug!(object_id, source_id, %err, "dropping invalid patch");
            }
        }
    }
    for object_id in delete {
        pool::delete(map, &object_id, source_id);
    }
    missing_baseline
}

pub fn players_patch(
    state: &mut HubState,
    now: f64,
    source_id: &str,
    upsert: HashMap<String, Value>,
    delete: Vec<String>,
) -> Vec<String> {
    apply_patch::<PlayerData>(&mut state.player_reports, source_id, now, upsert, delete)
}

pub fn entities_patch(
    state: &mut HubState,
    now: f64,
    source_id: &str,
    upsert: HashMap<String, Value>,
    delete: Vec<String>,
) -> Vec<String> {
    apply_patch::<EntityData>(&mut state.entity_reports, source_id, now, upsert, delete)
}

fn is_quick(node: &ReportNode) -> bool {
    node.data.get("waypointKind").and_then(Value::as_str) == Some("quick")
}

/// This waypoint's own eviction cap, evaluated independently of any other
/// waypoint in the same message: its own `maxQuickMarks` (clamped to
/// `[1, 100]`) if present, else `1` if `replaceOldQuick` is set, else `None`
/// (no eviction triggered by this report at all).
fn quick_mark_cap(data: &Value) -> Option<u64> {
    if let Some(requested) = data.get("maxQuickMarks").and_then(Value::as_i64) {
        Some(protocol::config::clamp_quick_mark_cap(requested))
    } else if data.get("replaceOldQuick").and_then(Value::as_bool) == Some(true) {
        Some(1)
    } else {
        None
    }
}

/// Evicts this source's oldest other `quick`-kind waypoints so that, once
/// `exclude_object_id` (just inserted) is counted, at most `cap` remain, LRU
/// by timestamp (spec.md §6 / §8 "Quick-mark cap").
fn evict_quick_marks(map: &mut ReportMap, source_id: &str, exclude_object_id: &str, cap: u64) {
    let mut others: Vec<(String, f64)> = map
        .iter()
        .filter(|(object_id, _)| object_id.as_str() != exclude_object_id)
        .filter_map(|(object_id, bucket)| {
            bucket.get(source_id).filter(|n| is_quick(n)).map(|n| (object_id.clone(), n.timestamp))
        })
        .collect();
    let cap = cap as usize;
    if others.len() + 1 <= cap {
        return;
    }
    let remove_count = others.len() + 1 - cap;
    others.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    for (object_id, _) in others.into_iter().take(remove_count) {
        pool::delete(map, &object_id, source_id);
    }
}

/// `waypoints_update`: each waypoint in the message is validated, upserted
/// and — independently of every other waypoint in the same message — has its
/// own `maxQuickMarks`/`replaceOldQuick` cap applied if it is `quick`-kind
/// (spec.md §6). A batch mixing different caps evicts each item against its
/// own cap rather than a batch-wide minimum.
pub fn waypoints_update(state: &mut HubState, now: f64, source_id: &str, waypoints: HashMap<String, Value>) {
    // Each item's eviction can observe siblings already upserted earlier in
    // this same message, so processing order matters (as it does in the
    // original's insertion-ordered dict) — sort by id for a deterministic,
    // reproducible order instead of relying on undefined hash-map iteration.
    let mut ordered: Vec<(String, Value)> = waypoints.into_iter().collect();
    ordered.sort_by(|a, b| a.0.cmp(&b.0));
    for (object_id, raw) in ordered {
        match WaypointData::normalize(&raw) {
            Ok(data) => {
                let is_quick_kind = data.get("waypointKind").and_then(Value::as_str) == Some("quick");
                let cap = is_quick_kind.then(|| quick_mark_cap(&data)).flatten();
                pool::upsert(
                    &mut state.waypoint_reports,
                    &object_id,
                    source_id,
                    ReportNode { timestamp: now, submit_player_id: Some(source_id.to_string()), data },
                );
                if let Some(cap) = cap {
                    evict_quick_marks(&mut state.waypoint_reports, source_id, &object_id, cap);
                }
            }
            Err(err) => debug!(object_id, source_id, %err, "dropping invalid waypoint report"),
        }
    }
}

pub fn waypoints_delete(state: &mut HubState, source_id: &str, waypoint_ids: Vec<String>) {
    for object_id in waypoint_ids {
        pool::delete(&mut state.waypoint_reports, &object_id, source_id);
    }
}

/// `waypoints_entity_death_cancel`: a global notice, not scoped to one
/// source — cancels every `entity_track`-kind waypoint (any source) whose
/// `targetEntityId` is in the given set.
pub fn waypoints_entity_death_cancel(state: &mut HubState, target_entity_ids: &[String]) {
    let targets: std::collections::HashSet<&str> = target_entity_ids.iter().map(String::as_str).collect();
    let to_remove: Vec<(String, String)> = state
        .waypoint_reports
        .iter()
        .flat_map(|(object_id, bucket)| {
            bucket.iter().filter_map(|(source_id, node)| {
                let matches_kind = node.data.get("targetType").and_then(Value::as_str) == Some("entity");
                let matches_target = node
                    .data
                    .get("targetEntityId")
                    .and_then(Value::as_str)
                    .is_some_and(|id| targets.contains(id));
                (matches_kind && matches_target).then(|| (object_id.clone(), source_id.clone()))
            })
        })
        .collect();
    for (object_id, source_id) in to_remove {
        pool::delete(&mut state.waypoint_reports, &object_id, &source_id);
    }
}

/// `tab_players_update`: refresh this source's identity report. Never
/// mutates a pool, so it never triggers a core broadcast tick — only the
/// admin UI is told immediately (spec.md §4 "tab_players_update triggers an
/// admin snapshot, not a full broadcast tick").
pub fn tab_players_update(state: &mut HubState, now: f64, source_id: &str, tab_players: &[TabPlayerEntry]) {
    let identity_keys = tab_players.iter().flat_map(protocol::identity_keys).collect();
    state
        .tab_reports
        .insert(source_id.to_string(), crate::state::TabIdentityReport { timestamp: now, identity_keys });
}

/// Dispatches one [`protocol::ClientMessage`] against shared state, per
/// spec.md §4.6's `READY` transition table.
pub fn apply(
    state: &mut HubState,
    _config: &HubConfig,
    source_id: &str,
    msg: &protocol::ClientMessage,
    now: f64,
) -> IngestEffect {
    use protocol::ClientMessage as M;
    match msg {
        M::Handshake { .. } => IngestEffect::default(),
        M::PlayersUpdate { players, .. } => {
            players_update(state, now, source_id, players.clone());
            IngestEffect { broadcast: true, ..Default::default() }
        }
        M::PlayersPatch { upsert, delete, .. } => {
            let missing = players_patch(state, now, source_id, upsert.clone(), delete.clone());
            IngestEffect {
                broadcast: true,
                missing_baseline: (!missing.is_empty()).then_some((Scope::Players, missing)),
                ..Default::default()
            }
        }
        M::EntitiesUpdate { entities, .. } => {
            entities_update(state, now, source_id, entities.clone());
            IngestEffect { broadcast: true, ..Default::default() }
        }
        M::EntitiesPatch { upsert, delete, .. } => {
            let missing = entities_patch(state, now, source_id, upsert.clone(), delete.clone());
            IngestEffect {
                broadcast: true,
                missing_baseline: (!missing.is_empty()).then_some((Scope::Entities, missing)),
                ..Default::default()
            }
        }
        M::WaypointsUpdate { waypoints, .. } => {
            waypoints_update(state, now, source_id, waypoints.clone());
            IngestEffect { broadcast: true, ..Default::default() }
        }
        M::WaypointsDelete { waypoint_ids, .. } => {
            waypoints_delete(state, source_id, waypoint_ids.clone());
            IngestEffect { broadcast: true, ..Default::default() }
        }
        M::WaypointsEntityDeathCancel { target_entity_ids } => {
            waypoints_entity_death_cancel(state, target_entity_ids);
            IngestEffect { broadcast: true, ..Default::default() }
        }
        M::TabPlayersUpdate { tab_players, .. } => {
            tab_players_update(state, now, source_id, tab_players);
            IngestEffect { admin_snapshot_only: true, ..Default::default() }
        }
        M::ResyncReq { .. } => IngestEffect::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn player(x: f64) -> Value {
        json!({"x": x, "y": 0.0, "z": 0.0, "dimension": "overworld"})
    }

    #[test]
    fn players_update_merges_without_deleting_missing_ids() {
        let mut state = HubState::default();
        let mut first = HashMap::new();
        first.insert("p1".to_string(), player(1.0));
        first.insert("p2".to_string(), player(2.0));
        players_update(&mut state, 1.0, "src", first);

        let mut second = HashMap::new();
        second.insert("p1".to_string(), player(3.0));
        players_update(&mut state, 2.0, "src", second);

        assert!(state.player_reports.contains_key("p1"));
        assert!(state.player_reports.contains_key("p2"));
    }

    #[test]
    fn entities_update_drops_ids_missing_from_the_new_set() {
        let mut state = HubState::default();
        let mut first = HashMap::new();
        first.insert("e1".to_string(), player(1.0));
        first.insert("e2".to_string(), player(1.0));
        entities_update(&mut state, 1.0, "src", first);

        let mut second = HashMap::new();
        second.insert("e2".to_string(), player(2.0));
        entities_update(&mut state, 2.0, "src", second);

        assert!(!state.entity_reports.contains_key("e1"));
        assert!(state.entity_reports.contains_key("e2"));
    }

    #[test]
    fn partial_patch_without_baseline_is_flagged_missing() {
        // No prior report for "src" on "p1", and this patch alone is missing
        // required fields (y/z/dimension) — merge_and_normalize fails, and
        // since there was no baseline to merge onto, it's flagged.
        let mut state = HubState::default();
        let mut upsert = HashMap::new();
        upsert.insert("p1".to_string(), json!({"x": 1.0}));
        let missing = players_patch(&mut state, 1.0, "src", upsert, Vec::new());
        assert_eq!(missing, vec!["p1".to_string()]);
        assert!(!state.player_reports.contains_key("p1"));
    }

    #[test]
    fn full_patch_without_baseline_is_not_flagged() {
        // A patch that happens to carry every required field succeeds even
        // with no prior baseline, so it is not flagged as missing.
        let mut state = HubState::default();
        let mut upsert = HashMap::new();
        upsert.insert("p1".to_string(), player(1.0));
        let missing = players_patch(&mut state, 1.0, "src", upsert, Vec::new());
        assert!(missing.is_empty());
        assert!(state.player_reports.contains_key("p1"));
    }

    #[test]
    fn patch_with_existing_baseline_is_not_flagged() {
        let mut state = HubState::default();
        let mut first = HashMap::new();
        first.insert("p1".to_string(), player(1.0));
        players_update(&mut state, 1.0, "src", first);

        let mut upsert = HashMap::new();
        upsert.insert("p1".to_string(), json!({"x": 9.0}));
        let missing = players_patch(&mut state, 2.0, "src", upsert, Vec::new());
        assert!(missing.is_empty());
    }

    #[test]
    fn invalid_report_in_a_batch_is_skipped_others_still_apply() {
        let mut state = HubState::default();
        let mut players = HashMap::new();
        players.insert("bad".to_string(), json!({"x": 1.0})); // missing y/z/dimension
        players.insert("good".to_string(), player(1.0));
        players_update(&mut state, 1.0, "src", players);
        assert!(!state.player_reports.contains_key("bad"));
        assert!(state.player_reports.contains_key("good"));
    }

    fn waypoint(name: &str, kind: &str) -> Value {
        json!({
            "x": 0.0, "y": 0.0, "z": 0.0, "dimension": "overworld", "name": name,
            "waypointKind": kind,
        })
    }

    #[test]
    fn quick_mark_eviction_keeps_only_the_cap_newest() {
        let mut state = HubState::default();
        for i in 0..5 {
            let mut waypoints = HashMap::new();
            let mut data = waypoint(&format!("w{i}"), "quick");
            data["maxQuickMarks"] = json!(2);
            waypoints.insert(format!("w{i}"), data);
            waypoints_update(&mut state, i as f64, "src", waypoints);
        }
        let remaining: Vec<_> = state.waypoint_reports.keys().cloned().collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&"w3".to_string()));
        assert!(remaining.contains(&"w4".to_string()));
    }

    #[test]
    fn replace_old_quick_forces_cap_of_one() {
        let mut state = HubState::default();
        for i in 0..3 {
            let mut waypoints = HashMap::new();
            let mut data = waypoint(&format!("w{i}"), "quick");
            data["replaceOldQuick"] = json!(true);
            waypoints.insert(format!("w{i}"), data);
            waypoints_update(&mut state, i as f64, "src", waypoints);
        }
        assert_eq!(state.waypoint_reports.len(), 1);
        assert!(state.waypoint_reports.contains_key("w2"));
    }

    #[test]
    fn mixed_caps_in_one_batch_are_evicted_independently_not_by_batch_min() {
        let mut state = HubState::default();
        for i in 0..3 {
            let mut waypoints = HashMap::new();
            waypoints.insert(format!("old{i}"), waypoint(&format!("old{i}"), "quick"));
            waypoints_update(&mut state, i as f64, "src", waypoints);
        }

        // One message, two quick waypoints with different maxQuickMarks.
        // Items are processed in object-id order, so "a_low" (cap 1) runs
        // before "b_high" (cap 5).
        let mut batch = HashMap::new();
        let mut low = waypoint("a_low", "quick");
        low["maxQuickMarks"] = json!(1);
        batch.insert("a_low".to_string(), low);
        let mut high = waypoint("b_high", "quick");
        high["maxQuickMarks"] = json!(5);
        batch.insert("b_high".to_string(), high);
        waypoints_update(&mut state, 10.0, "src", batch);

        // "a_low"'s cap of 1 evicts the three pre-existing quick waypoints.
        assert!(!state.waypoint_reports.contains_key("old0"));
        assert!(!state.waypoint_reports.contains_key("old1"));
        assert!(!state.waypoint_reports.contains_key("old2"));
        // A batch-wide minimum (1) would have also evicted "b_high" down to
        // just one survivor; its own cap of 5 means it is left alone.
        assert!(state.waypoint_reports.contains_key("a_low"));
        assert!(state.waypoint_reports.contains_key("b_high"));
        assert_eq!(state.waypoint_reports.len(), 2);
    }

    #[test]
    fn manual_waypoints_are_never_evicted() {
        let mut state = HubState::default();
        for i in 0..10 {
            let mut waypoints = HashMap::new();
            waypoints.insert(format!("w{i}"), waypoint(&format!("w{i}"), "manual"));
            waypoints_update(&mut state, i as f64, "src", waypoints);
        }
        assert_eq!(state.waypoint_reports.len(), 10);
    }

    #[test]
    fn entity_death_cancel_removes_matching_waypoints_across_sources() {
        let mut state = HubState::default();
        let mut w = HashMap::new();
        let mut data = waypoint("track", "manual");
        data["targetType"] = json!("entity");
        data["targetEntityId"] = json!("zombie-1");
        w.insert("w1".to_string(), data);
        waypoints_update(&mut state, 1.0, "src-a", w.clone());
        waypoints_update(&mut state, 1.0, "src-b", w);

        waypoints_entity_death_cancel(&mut state, &["zombie-1".to_string()]);
        assert!(!state.waypoint_reports.contains_key("w1"));
    }

    #[test]
    fn tab_players_update_never_requests_a_broadcast() {
        let mut state = HubState::default();
        let entries = vec![TabPlayerEntry { uuid: Some("abc".into()), name: None, display_name: None, prefixed_name: None }];
        let effect = apply(
            &mut state,
            &HubConfig::default(),
            "src",
            &protocol::ClientMessage::TabPlayersUpdate { submit_player_id: "src".into(), tab_players: entries },
            1.0,
        );
        assert!(!effect.broadcast);
        assert!(effect.admin_snapshot_only);
    }
}
