//! Drives one broadcast tick, per spec.md §4.5's fixed seven-step ordering.
//! Runs synchronously over the whole tick body while the caller holds
//! [`crate::state::AppState::state`]'s lock — outbound sends go through
//! unbounded channels and never await, so nothing can mutate the pools
//! between cleanup and dispatch (spec.md §5).

use crate::pool::ReportNode;
use crate::state::{HubState, ResolvedMap};
use crate::{arbitrator, ingest, timeout, visibility};
use protocol::{AdminSnapshot, DigestHashes, HubConfig, NodeWire, ScopePatch, ServerMessage, TabState};
use std::collections::{HashMap, HashSet};

fn node_wire(node: &ReportNode) -> NodeWire {
    NodeWire { timestamp: node.timestamp, submit_player_id: node.submit_player_id.clone(), data: node.data.clone() }
}

fn compact_map(view: &ResolvedMap) -> HashMap<String, serde_json::Value> {
    view.iter().map(|(id, node)| (id.clone(), node.data.clone())).collect()
}

fn wire_map(view: &ResolvedMap) -> HashMap<String, NodeWire> {
    view.iter().map(|(id, node)| (id.clone(), node_wire(node))).collect()
}

fn scope_changed(patch: &ScopePatch) -> bool {
    !patch.upsert.is_empty() || !patch.delete.is_empty()
}

/// Sends a `refresh_req` to one still-connected source if its cooldown has
/// elapsed, marking the cooldown on success. Shared by the periodic
/// pre-expiry dispatch and the direct missing-baseline reaction.
fn try_send_refresh(
    state: &mut HubState,
    reason: &str,
    scope: ingest::Scope,
    source_id: &str,
    ids: Vec<String>,
    cooldown_sec: f64,
    now: f64,
) {
    if ids.is_empty() {
        return;
    }
    let Some(conn) = state.connections.get(source_id) else {
        return;
    };
    let scope_key = match scope {
        ingest::Scope::Players => "players",
        ingest::Scope::Entities => "entities",
    };
    let key = (scope_key.to_string(), source_id.to_string());
    if let Some(last) = state.refresh_cooldowns.get(&key) {
        if now - last < cooldown_sec {
            return;
        }
    }

    let msg = match scope {
        ingest::Scope::Players => ServerMessage::RefreshReq {
            reason: reason.to_string(),
            server_time: now,
            rev: state.revision,
            players: ids,
            entities: Vec::new(),
        },
        ingest::Scope::Entities => ServerMessage::RefreshReq {
            reason: reason.to_string(),
            server_time: now,
            rev: state.revision,
            players: Vec::new(),
            entities: ids,
        },
    };
    if conn.outbound.send(msg).is_ok() {
        state.refresh_cooldowns.insert(key, now);
    }
}

/// Reacts to a `*_patch` message whose upsert ids had no existing baseline:
/// sends a `missing_baseline_patch` refresh_req for that source/scope,
/// honoring (not bypassing) the per-source cooldown (spec.md §4 notes).
pub fn dispatch_missing_baseline(
    state: &mut HubState,
    config: &HubConfig,
    source_id: &str,
    scope: ingest::Scope,
    ids: Vec<String>,
    now: f64,
) {
    try_send_refresh(state, "missing_baseline_patch", scope, source_id, ids, config.refresh_req_cooldown_sec, now);
}

fn connected_sources(state: &HubState) -> HashSet<String> {
    state.connections.keys().cloned().collect()
}

fn pre_expiry_refresh_dispatch(state: &mut HubState, config: &HubConfig, now: f64) {
    let connected = connected_sources(state);
    let player_candidates = timeout::collect_refresh_candidates(
        &state.player_reports,
        &connected,
        config.player_timeout_sec,
        config.refresh_req_lead_sec,
        config.max_items_per_scope,
        now,
    );
    let entity_candidates = timeout::collect_refresh_candidates(
        &state.entity_reports,
        &connected,
        config.entity_timeout_sec,
        config.refresh_req_lead_sec,
        config.max_items_per_scope,
        now,
    );

    for (source_id, ids) in player_candidates {
        try_send_refresh(state, "pre_expiry", ingest::Scope::Players, &source_id, ids, config.refresh_req_cooldown_sec, now);
    }
    for (source_id, ids) in entity_candidates {
        try_send_refresh(state, "pre_expiry", ingest::Scope::Entities, &source_id, ids, config.refresh_req_cooldown_sec, now);
    }
}

fn build_tab_state(state: &HubState, config: &HubConfig, now: f64) -> TabState {
    let groups = visibility::compute_groups(&state.tab_reports, config.tab_report_timeout_sec, now);
    let mut by_root: HashMap<&str, Vec<String>> = HashMap::new();
    for (source_id, root) in &groups {
        by_root.entry(root.as_str()).or_default().push(source_id.clone());
    }
    let mut group_lists: Vec<Vec<String>> = by_root.into_values().collect();
    for group in &mut group_lists {
        group.sort();
    }
    group_lists.sort();

    TabState {
        enabled: state.same_server_filter_enabled,
        reports: state.tab_reports.iter().map(|(id, r)| (id.clone(), r.identity_keys.clone())).collect(),
        groups: group_lists,
    }
}

/// Builds the periodic unsolicited admin payload (spec.md §4.5 step 7 /
/// §6 admin channel).
pub fn build_admin_snapshot(state: &HubState, config: &HubConfig, now: f64) -> AdminSnapshot {
    AdminSnapshot {
        server_time: now,
        players: wire_map(&state.players),
        entities: wire_map(&state.entities),
        waypoints: wire_map(&state.waypoints),
        player_marks: state.player_marks.clone(),
        tab_state: build_tab_state(state, config, now),
        connections: state.connections.keys().cloned().collect(),
        connections_count: state.connections.len(),
        revision: state.revision,
    }
}

/// Sends a `snapshot_full` (or, for a legacy subscriber, a `positions`
/// message) directly to one subscriber, scoped to its current visibility —
/// the `resync_req` reaction (spec.md §6), which does not recompute
/// arbitration or touch any other subscriber.
pub fn send_snapshot_full_to(state: &mut HubState, config: &HubConfig, source_id: &str, now: f64) {
    let Some(cap) = state.connection_caps.get(source_id).copied() else {
        return;
    };
    let groups = visibility::compute_groups(&state.tab_reports, config.tab_report_timeout_sec, now);
    let allowed = visibility::allowed_sources_for(source_id, state.same_server_filter_enabled, &groups);
    let view_players = visibility::filter_resolved_view(&state.players, allowed.as_ref());
    let view_entities = visibility::filter_resolved_view(&state.entities, allowed.as_ref());
    let view_waypoints = visibility::filter_resolved_view(&state.waypoints, allowed.as_ref());

    let msg = if cap.delta_enabled {
        ServerMessage::SnapshotFull {
            rev: state.revision,
            players: compact_map(&view_players),
            entities: compact_map(&view_entities),
            waypoints: compact_map(&view_waypoints),
            player_marks: None,
        }
    } else {
        ServerMessage::Positions {
            players: wire_map(&view_players),
            entities: wire_map(&view_entities),
            waypoints: wire_map(&view_waypoints),
            player_marks: state.player_marks.clone(),
        }
    };

    if send_to(state, source_id, msg).is_err() {
        state.remove_connection(source_id);
    }
}

pub fn push_admin_snapshot(state: &mut HubState, config: &HubConfig, now: f64) {
    let snapshot = build_admin_snapshot(state, config, now);
    let broken: Vec<String> = state
        .admin_connections
        .iter()
        .filter(|(_, handle)| handle.snapshot_outbound.send(snapshot.clone()).is_err())
        .map(|(id, _)| id.clone())
        .collect();
    for id in broken {
        state.admin_connections.remove(&id);
    }
}

/// Runs one full broadcast tick: refresh dispatch, cleanup, resolve, revision
/// bump, per-subscriber dispatch, broken-subscriber pruning, admin fan-out.
pub fn run_tick(state: &mut HubState, config: &HubConfig, now: f64) {
    // 1. Pre-expiry refresh dispatch.
    pre_expiry_refresh_dispatch(state, config, now);

    // 2. Cleanup.
    timeout::cleanup_timeouts(
        &mut state.player_reports,
        &mut state.entity_reports,
        &mut state.waypoint_reports,
        config.player_timeout_sec,
        config.entity_timeout_sec,
        config.waypoint_timeout_sec,
        now,
    );

    // 3. Resolve + patches.
    let new_players = arbitrator::resolve_report_map(
        &state.player_reports,
        &mut state.player_selected_sources,
        config.source_switch_threshold_sec,
        true,
    );
    let new_entities = arbitrator::resolve_report_map(
        &state.entity_reports,
        &mut state.entity_selected_sources,
        config.source_switch_threshold_sec,
        false,
    );
    let new_waypoints = arbitrator::resolve_report_map(
        &state.waypoint_reports,
        &mut state.waypoint_selected_sources,
        config.source_switch_threshold_sec,
        false,
    );

    let players_patch = arbitrator::compute_scope_patch(&state.players, &new_players);
    let entities_patch = arbitrator::compute_scope_patch(&state.entities, &new_entities);
    let waypoints_patch = arbitrator::compute_scope_patch(&state.waypoints, &new_waypoints);

    state.players = new_players;
    state.entities = new_entities;
    state.waypoints = new_waypoints;

    // 4. Revision.
    let changed = scope_changed(&players_patch) || scope_changed(&entities_patch) || scope_changed(&waypoints_patch);
    let rev = if changed { state.next_revision() } else { state.revision };

    // 5. Dispatch.
    let groups = visibility::compute_groups(&state.tab_reports, config.tab_report_timeout_sec, now);
    let subscriber_ids: Vec<String> = state.connections.keys().cloned().collect();
    let mut broken = Vec::new();

    for source_id in subscriber_ids {
        let Some(cap) = state.connection_caps.get(&source_id).copied() else {
            continue;
        };
        let allowed = visibility::allowed_sources_for(&source_id, state.same_server_filter_enabled, &groups);

        let mut send_failed = false;
        if cap.delta_enabled {
            if let Some(allowed) = &allowed {
                if changed || cap.force_full {
                    let view_players = visibility::filter_resolved_view(&state.players, Some(allowed));
                    let view_entities = visibility::filter_resolved_view(&state.entities, Some(allowed));
                    let view_waypoints = visibility::filter_resolved_view(&state.waypoints, Some(allowed));
                    let msg = ServerMessage::SnapshotFull {
                        rev,
                        players: compact_map(&view_players),
                        entities: compact_map(&view_entities),
                        waypoints: compact_map(&view_waypoints),
                        player_marks: None,
                    };
                    send_failed |= send_to(state, &source_id, msg).is_err();
                }
            } else if cap.force_full {
                let msg = ServerMessage::SnapshotFull {
                    rev,
                    players: compact_map(&state.players),
                    entities: compact_map(&state.entities),
                    waypoints: compact_map(&state.waypoints),
                    player_marks: None,
                };
                send_failed |= send_to(state, &source_id, msg).is_err();
            } else if changed {
                let msg = ServerMessage::Patch {
                    rev,
                    players: players_patch.clone(),
                    entities: entities_patch.clone(),
                    waypoints: waypoints_patch.clone(),
                };
                send_failed |= send_to(state, &source_id, msg).is_err();
            }

            if !send_failed {
                let due = now - cap.last_digest_sent >= config.digest_interval_sec as f64;
                if due {
                    let view_players = visibility::filter_resolved_view(&state.players, allowed.as_ref());
                    let view_entities = visibility::filter_resolved_view(&state.entities, allowed.as_ref());
                    let view_waypoints = visibility::filter_resolved_view(&state.waypoints, allowed.as_ref());
                    let hashes = DigestHashes {
                        players: protocol::state_digest(&compact_map(&view_players)),
                        entities: protocol::state_digest(&compact_map(&view_entities)),
                        waypoints: protocol::state_digest(&compact_map(&view_waypoints)),
                    };
                    let msg = ServerMessage::Digest { rev, hashes };
                    send_failed |= send_to(state, &source_id, msg).is_err();
                    if !send_failed {
                        if let Some(c) = state.connection_caps.get_mut(&source_id) {
                            c.last_digest_sent = now;
                        }
                    }
                }
            }
        } else if changed {
            let view_players = visibility::filter_resolved_view(&state.players, allowed.as_ref());
            let view_entities = visibility::filter_resolved_view(&state.entities, allowed.as_ref());
            let view_waypoints = visibility::filter_resolved_view(&state.waypoints, allowed.as_ref());
            let msg = ServerMessage::Positions {
                players: wire_map(&view_players),
                entities: wire_map(&view_entities),
                waypoints: wire_map(&view_waypoints),
                player_marks: state.player_marks.clone(),
            };
            send_failed |= send_to(state, &source_id, msg).is_err();
        }

        if send_failed {
            broken.push(source_id);
        }
    }

    // Forced-full is a one-shot: clear it for every subscriber that still
    // exists once this tick's dispatch loop has run.
    for cap in state.connection_caps.values_mut() {
        cap.force_full = false;
    }

    // 6. Prune broken subscribers.
    for source_id in broken {
        state.remove_connection(&source_id);
    }

    // 7. Admin fan-out.
    push_admin_snapshot(state, config, now);
}

fn send_to(state: &HubState, source_id: &str, msg: ServerMessage) -> Result<(), ()> {
    match state.connections.get(source_id) {
        Some(conn) => conn.outbound.send(msg).map_err(|_| ()),
        None => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool;
    use crate::state::{AdminHandle, ConnectionCapability, ConnectionHandle};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn make_connection(state: &mut HubState, id: &str, delta: bool) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.connections.insert(id.to_string(), ConnectionHandle { outbound: tx });
        state.connection_caps.insert(
            id.to_string(),
            ConnectionCapability { protocol_version: 2, delta_enabled: delta, last_digest_sent: 0.0, force_full: true },
        );
        rx
    }

    #[test]
    fn first_tick_after_handshake_sends_a_full_snapshot() {
        let mut state = HubState::default();
        let config = HubConfig::default();
        let mut rx = make_connection(&mut state, "sub", true);
        pool::upsert(
            &mut state.player_reports,
            "p1",
            "p1",
            pool::ReportNode { timestamp: 1.0, submit_player_id: Some("p1".into()), data: json!({"x": 1.0}) },
        );

        run_tick(&mut state, &config, 1.0);

        let msg = rx.try_recv().expect("expected a message");
        assert!(matches!(msg, ServerMessage::SnapshotFull { .. }));
    }

    #[test]
    fn open_delta_subscriber_receives_patch_after_first_full() {
        let mut state = HubState::default();
        let config = HubConfig::default();
        let mut rx = make_connection(&mut state, "sub", true);
        pool::upsert(
            &mut state.player_reports,
            "p1",
            "p1",
            pool::ReportNode { timestamp: 1.0, submit_player_id: Some("p1".into()), data: json!({"x": 1.0}) },
        );
        run_tick(&mut state, &config, 1.0);
        rx.try_recv().unwrap(); // the forced-full snapshot

        pool::upsert(
            &mut state.player_reports,
            "p2",
            "p2",
            pool::ReportNode { timestamp: 2.0, submit_player_id: Some("p2".into()), data: json!({"x": 2.0}) },
        );
        run_tick(&mut state, &config, 2.0);
        let msg = rx.try_recv().expect("expected a patch");
        assert!(matches!(msg, ServerMessage::Patch { .. }));
    }

    #[test]
    fn legacy_subscriber_never_receives_a_patch() {
        let mut state = HubState::default();
        let config = HubConfig::default();
        let mut rx = make_connection(&mut state, "legacy", false);
        pool::upsert(
            &mut state.player_reports,
            "p1",
            "p1",
            pool::ReportNode { timestamp: 1.0, submit_player_id: Some("p1".into()), data: json!({"x": 1.0}) },
        );
        run_tick(&mut state, &config, 1.0);
        let msg = rx.try_recv().expect("expected a positions message");
        assert!(matches!(msg, ServerMessage::Positions { .. }));
    }

    #[test]
    fn unchanged_tick_with_no_forced_full_sends_nothing_but_admin() {
        let mut state = HubState::default();
        let config = HubConfig::default();
        let mut rx = make_connection(&mut state, "sub", true);
        run_tick(&mut state, &config, 1.0);
        rx.try_recv().unwrap(); // forced full on connect with empty state
        if let Some(c) = state.connection_caps.get_mut("sub") {
            c.force_full = false;
            c.last_digest_sent = 1.0;
        }
        run_tick(&mut state, &config, 2.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn broken_subscriber_is_pruned_after_the_dispatch_loop() {
        let mut state = HubState::default();
        let config = HubConfig::default();
        let rx = make_connection(&mut state, "sub", true);
        drop(rx);
        run_tick(&mut state, &config, 1.0);
        assert!(!state.connections.contains_key("sub"));
    }

    #[test]
    fn admin_snapshot_is_pushed_every_tick() {
        let mut state = HubState::default();
        let config = HubConfig::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let (snap_tx, mut snap_rx) = mpsc::unbounded_channel();
        state.admin_connections.insert("admin".to_string(), AdminHandle { outbound: tx, snapshot_outbound: snap_tx });
        let _ = rx;
        run_tick(&mut state, &config, 1.0);
        assert!(snap_rx.try_recv().is_ok());
    }
}
