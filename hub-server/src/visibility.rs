//! Partitions subscribers into visibility groups, per spec.md §4.4.
//!
//! Two modes: **open** (everyone sees everything) and **same-server
//! grouping**, an opt-in union-find over each connected source's latest
//! reported player-identity set. Sources whose identity sets overlap are
//! assumed to be observing the same game instance and are grouped together;
//! a source with no identity report fails open rather than being isolated.

use crate::state::{ResolvedMap, TabIdentityReport};
use std::collections::{HashMap, HashSet};

/// A disjoint-set forest over source ids, used only to build `groupId`s for
/// one tick — rebuilt from scratch every time rather than kept live, since
/// identity reports expire and sources connect/disconnect continuously.
struct UnionFind {
    parent: HashMap<String, String>,
}

impl UnionFind {
    fn new() -> Self {
        UnionFind { parent: HashMap::new() }
    }

    fn find(&mut self, id: &str) -> String {
        let next = match self.parent.get(id) {
            Some(p) if p != id => p.clone(),
            Some(_) => return id.to_string(),
            None => {
                self.parent.insert(id.to_string(), id.to_string());
                return id.to_string();
            }
        };
        let root = self.find(&next);
        self.parent.insert(id.to_string(), root.clone());
        root
    }

    fn union(&mut self, a: &str, b: &str) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }
}

/// `source_id -> groupId` for every source with a live (non-expired) identity
/// report. Sources that never sent one, or whose report expired, are simply
/// absent from the map — callers treat an absent source as fail-open.
pub fn compute_groups(
    tab_reports: &HashMap<String, TabIdentityReport>,
    tab_report_timeout_sec: f64,
    now: f64,
) -> HashMap<String, String> {
    let mut uf = UnionFind::new();
    let mut keys_by_source: HashMap<&str, &[String]> = HashMap::new();

    for (source_id, report) in tab_reports {
        if now - report.timestamp > tab_report_timeout_sec {
            continue;
        }
        uf.find(source_id);
        keys_by_source.insert(source_id.as_str(), &report.identity_keys);
    }

    let sources: Vec<&str> = keys_by_source.keys().copied().collect();
    for i in 0..sources.len() {
        for j in (i + 1)..sources.len() {
            let a = sources[i];
            let b = sources[j];
            let a_keys: HashSet<&String> = keys_by_source[a].iter().collect();
            if keys_by_source[b].iter().any(|k| a_keys.contains(k)) {
                uf.union(a, b);
            }
        }
    }

    sources
        .iter()
        .map(|&id| (id.to_string(), uf.find(id)))
        .collect()
}

/// The set of source ids a given subscriber is allowed to see, or `None` if
/// it should see everything (open mode, or same-server filter disabled, or
/// the subscriber itself has no identity report — fail-open so a brand-new
/// client is never isolated before it reports its own identity).
pub fn allowed_sources_for(
    subscriber_id: &str,
    same_server_filter_enabled: bool,
    groups: &HashMap<String, String>,
) -> Option<HashSet<String>> {
    if !same_server_filter_enabled {
        return None;
    }
    let subscriber_group = groups.get(subscriber_id)?;
    Some(
        groups
            .iter()
            .filter(|(_, group)| *group == subscriber_group)
            .map(|(source_id, _)| source_id.clone())
            .collect(),
    )
}

/// Filters a resolved view down to nodes reported by an allowed source.
/// `allowed = None` means open visibility — every node passes. A node with
/// no `submitPlayerId` also always passes (treated as open, per spec.md
/// §4.4: "or absent, treated as open").
pub fn filter_resolved_view(view: &ResolvedMap, allowed: Option<&HashSet<String>>) -> ResolvedMap {
    let Some(allowed) = allowed else {
        return view.clone();
    };
    view.iter()
        .filter(|(_, node)| match node.submit_player_id.as_deref() {
            Some(owner) => allowed.contains(owner),
            None => true,
        })
        .map(|(id, node)| (id.clone(), node.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ReportNode;
    use serde_json::json;

    fn report(now: f64, keys: &[&str]) -> TabIdentityReport {
        TabIdentityReport {
            timestamp: now,
            identity_keys: keys.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn overlapping_identities_join_the_same_group() {
        let mut reports = HashMap::new();
        reports.insert("src-a".to_string(), report(10.0, &["uuid:abc"]));
        reports.insert("src-b".to_string(), report(10.0, &["uuid:abc", "name:zed"]));
        reports.insert("src-c".to_string(), report(10.0, &["name:other"]));

        let groups = compute_groups(&reports, 45.0, 10.0);
        assert_eq!(groups["src-a"], groups["src-b"]);
        assert_ne!(groups["src-a"], groups["src-c"]);
    }

    #[test]
    fn expired_reports_are_excluded_from_grouping() {
        let mut reports = HashMap::new();
        reports.insert("src-a".to_string(), report(0.0, &["uuid:abc"]));
        let groups = compute_groups(&reports, 45.0, 100.0);
        assert!(groups.is_empty());
    }

    #[test]
    fn subscriber_without_identity_report_fails_open() {
        let groups = HashMap::new();
        let allowed = allowed_sources_for("newcomer", true, &groups);
        assert!(allowed.is_none());
    }

    #[test]
    fn open_mode_ignores_groups_entirely() {
        let mut groups = HashMap::new();
        groups.insert("src-a".to_string(), "root-a".to_string());
        let allowed = allowed_sources_for("src-a", false, &groups);
        assert!(allowed.is_none());
    }

    #[test]
    fn filter_keeps_only_allowed_owners_and_ownerless_nodes() {
        let mut view = ResolvedMap::new();
        view.insert(
            "obj1".to_string(),
            ReportNode { timestamp: 1.0, submit_player_id: Some("src-a".to_string()), data: json!({}) },
        );
        view.insert(
            "obj2".to_string(),
            ReportNode { timestamp: 1.0, submit_player_id: Some("src-b".to_string()), data: json!({}) },
        );
        view.insert(
            "obj3".to_string(),
            ReportNode { timestamp: 1.0, submit_player_id: None, data: json!({}) },
        );

        let mut allowed = HashSet::new();
        allowed.insert("src-a".to_string());
        let filtered = filter_resolved_view(&view, Some(&allowed));
        assert!(filtered.contains_key("obj1"));
        assert!(!filtered.contains_key("obj2"));
        assert!(filtered.contains_key("obj3"));
    }
}
