//! Shared hub state: the report pools, resolved views, connection/capability
//! tables, marks, identity reports, admin connections and revision counter.
//!
//! Everything here lives behind one [`tokio::sync::Mutex`] inside [`AppState`]
//! so a broadcast tick runs start-to-finish without another task mutating the
//! pools mid-tick — the single-owner model spec.md §9 asks for, done with a
//! lock rather than a dedicated actor task because every per-tick send goes
//! through an unbounded channel (`ConnectionHandle::outbound`), which never
//! awaits, so nothing blocks while the lock is held.

use crate::pool::{self, ReportMap};
use protocol::{HubConfig, PlayerMark};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

/// `object_id -> node`, the arbitrated view for one scope.
pub type ResolvedMap = HashMap<String, pool::ReportNode>;

/// Negotiated behavior for one connected source, set at handshake.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionCapability {
    pub protocol_version: u32,
    pub delta_enabled: bool,
    pub last_digest_sent: f64,
    /// One-shot: set on handshake completion and on visibility-mode changes
    /// (spec.md §4.5 "Forced full"), cleared after the next tick dispatches it.
    pub force_full: bool,
}

/// A live subscriber connection: enough to push outbound messages and to
/// check liveness without touching the socket directly from the tick.
pub struct ConnectionHandle {
    pub outbound: UnboundedSender<protocol::ServerMessage>,
}

/// A live admin connection.
pub struct AdminHandle {
    pub outbound: UnboundedSender<protocol::AdminReply>,
    pub snapshot_outbound: UnboundedSender<protocol::AdminSnapshot>,
}

/// One source's most recent `tab_players_update`, used for same-server
/// grouping. Expires independently of the scope pools via
/// `TAB_REPORT_TIMEOUT_SEC`.
#[derive(Debug, Clone)]
pub struct TabIdentityReport {
    pub timestamp: f64,
    pub identity_keys: Vec<String>,
}

/// All mutable hub state, guarded by one mutex in [`AppState`].
#[derive(Default)]
pub struct HubState {
    pub player_reports: ReportMap,
    pub entity_reports: ReportMap,
    pub waypoint_reports: ReportMap,

    pub players: ResolvedMap,
    pub entities: ResolvedMap,
    pub waypoints: ResolvedMap,

    pub player_selected_sources: HashMap<String, String>,
    pub entity_selected_sources: HashMap<String, String>,
    pub waypoint_selected_sources: HashMap<String, String>,

    pub connections: HashMap<String, ConnectionHandle>,
    pub connection_caps: HashMap<String, ConnectionCapability>,
    pub admin_connections: HashMap<String, AdminHandle>,

    pub player_marks: HashMap<String, PlayerMark>,

    pub tab_reports: HashMap<String, TabIdentityReport>,
    pub same_server_filter_enabled: bool,

    /// `(scope, source_id) -> last refresh_req send time`, per spec.md §4.3.
    pub refresh_cooldowns: HashMap<(String, String), f64>,

    pub revision: u64,

    /// Monotonic counter backing generated admin connection ids — admin
    /// connections aren't self-identified the way sources are.
    pub next_admin_id: u64,
}

impl HubState {
    pub fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Removes every report a disconnecting source contributed across all
    /// three pools, and its connection/capability/identity entries.
    pub fn remove_connection(&mut self, source_id: &str) {
        self.connections.remove(source_id);
        self.connection_caps.remove(source_id);
        self.tab_reports.remove(source_id);
        pool::prune_source(&mut self.player_reports, source_id);
        pool::prune_source(&mut self.entity_reports, source_id);
        pool::prune_source(&mut self.waypoint_reports, source_id);
    }

    pub fn is_delta_client(&self, source_id: &str) -> bool {
        self.connection_caps
            .get(source_id)
            .is_some_and(|caps| caps.delta_enabled)
    }

    pub fn set_player_mark(
        &mut self,
        player_id: &str,
        team: protocol::Team,
        color: Option<String>,
        label: Option<String>,
        now_ms: i64,
    ) -> PlayerMark {
        let color = color.unwrap_or_else(|| team.default_color().to_string());
        let label = label.map(|l: String| l.chars().take(64).collect());
        let mark = PlayerMark {
            team,
            color,
            label,
            updated_at: now_ms,
        };
        self.player_marks.insert(player_id.to_string(), mark.clone());
        mark
    }

    pub fn clear_player_mark(&mut self, player_id: &str) -> bool {
        self.player_marks.remove(player_id).is_some()
    }

    pub fn clear_all_player_marks(&mut self) -> usize {
        let count = self.player_marks.len();
        self.player_marks.clear();
        count
    }
}

/// Top-level application state shared across every axum handler.
pub struct AppState {
    pub config: HubConfig,
    pub state: Mutex<HubState>,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn new(config: HubConfig) -> Arc<Self> {
        let state = HubState {
            same_server_filter_enabled: config.enable_same_server_filter,
            ..HubState::default()
        };
        Arc::new(AppState {
            config,
            state: Mutex::new(state),
            http_client: reqwest::Client::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ReportNode;

    fn node(ts: f64) -> ReportNode {
        ReportNode {
            timestamp: ts,
            submit_player_id: Some("s1".to_string()),
            data: serde_json::json!({"x": 1.0}),
        }
    }

    #[test]
    fn remove_connection_clears_reports_from_every_pool() {
        let mut state = HubState::default();
        pool::upsert(&mut state.player_reports, "p1", "s1", node(1.0));
        pool::upsert(&mut state.entity_reports, "e1", "s1", node(1.0));
        state.remove_connection("s1");
        assert!(state.player_reports.is_empty());
        assert!(state.entity_reports.is_empty());
    }

    #[test]
    fn marks_round_trip() {
        let mut state = HubState::default();
        let mark = state.set_player_mark("p1", protocol::Team::Enemy, None, Some("boss".into()), 1000);
        assert_eq!(mark.color, "#ef4444");
        assert_eq!(state.player_marks.len(), 1);
        assert!(state.clear_player_mark("p1"));
        assert_eq!(state.clear_all_player_marks(), 0);
    }
}
