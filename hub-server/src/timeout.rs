//! Scope timeout cleanup and pre-expiry refresh candidate collection, per
//! spec.md §4.3.
//!
//! A node is pruned once `now - node.timestamp > scope_timeout`, flat across
//! every source regardless of connection state (spec.md §8 "Timeout
//! correctness": age > T at cleanup time implies absent from the next
//! resolved view, for any configured T — no online-owner exception).

use crate::pool::{ReportMap, ReportNode};
use std::collections::{HashMap, HashSet};

/// A waypoint's own `ttlSeconds`, when present, overrides the scope default,
/// clamped to `[5, 86400]` (spec.md §4.3 / §6).
fn effective_waypoint_timeout(node: &ReportNode, default_timeout: f64) -> f64 {
    node.data
        .get("ttlSeconds")
        .and_then(|v| v.as_i64())
        .map(|ttl| protocol::config::clamp_waypoint_ttl(ttl) as f64)
        .unwrap_or(default_timeout)
}

/// Drops every report bucket whose effective timeout has elapsed, pruning
/// empty object buckets as it goes.
fn cleanup_report_map(
    map: &mut ReportMap,
    now: f64,
    timeout_for: impl Fn(&ReportNode) -> f64,
) {
    map.retain(|_object_id, bucket| {
        bucket.retain(|_source_id, node| now - node.timestamp <= timeout_for(node));
        !bucket.is_empty()
    });
}

/// Runs timeout cleanup over all three pools in place.
pub fn cleanup_timeouts(
    player_reports: &mut ReportMap,
    entity_reports: &mut ReportMap,
    waypoint_reports: &mut ReportMap,
    player_timeout_sec: f64,
    entity_timeout_sec: f64,
    waypoint_timeout_sec: f64,
    now: f64,
) {
    cleanup_report_map(player_reports, now, |_node| player_timeout_sec);
    cleanup_report_map(entity_reports, now, |_node| entity_timeout_sec);
    cleanup_report_map(waypoint_reports, now, |node| {
        effective_waypoint_timeout(node, waypoint_timeout_sec)
    });
}

/// `source_id -> object ids nearing expiry in that scope`, used to build the
/// pre-expiry `refresh_req` candidate list.
pub type RefreshCandidates = HashMap<String, Vec<String>>;

/// Collects `(object_id, source_id)` reports whose remaining time-to-live
/// falls within `(0, lead_sec]`, grouped by the source that reported them —
/// that source is the one asked to refresh. Only sources still connected
/// are worth notifying. Per spec.md §6, only players and entities
/// participate in pre-expiry refresh (waypoints have no `refresh_req` wire
/// field). Each source's candidate list is capped at `max_items_per_scope`.
pub fn collect_refresh_candidates(
    map: &ReportMap,
    connected: &HashSet<String>,
    base_timeout: f64,
    lead_sec: f64,
    max_items_per_scope: usize,
    now: f64,
) -> RefreshCandidates {
    let mut candidates: RefreshCandidates = HashMap::new();
    for (object_id, bucket) in map {
        for (source_id, node) in bucket {
            if !connected.contains(source_id) {
                continue;
            }
            let remaining = base_timeout - (now - node.timestamp);
            if remaining > 0.0 && remaining <= lead_sec {
                let ids = candidates.entry(source_id.clone()).or_default();
                if ids.len() < max_items_per_scope {
                    ids.push(object_id.clone());
                }
            }
        }
    }
    candidates
}
