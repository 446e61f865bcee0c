//! The JSON message envelope exchanged over the player/source WebSocket and
//! the admin WebSocket.
//!
//! Inbound messages are tagged on `"type"` and `rename_all = "snake_case"`,
//! which maps every variant name here onto the wire string spec.md names for
//! it (`PlayersPatch` -> `"players_patch"`, etc). Payload fields stay as
//! `serde_json::Value` where the hub only needs to pass them through a
//! [`crate::model::Schema`] normalizer rather than parse them itself.

use crate::model::{PlayerMark, TabPlayerEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A message sent by a player client or other report source.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Handshake {
        #[serde(rename = "submitPlayerId")]
        submit_player_id: String,
        #[serde(rename = "protocolVersion", default)]
        protocol_version: Option<u32>,
        #[serde(rename = "supportsDelta", default)]
        supports_delta: bool,
    },
    PlayersUpdate {
        #[serde(rename = "submitPlayerId")]
        submit_player_id: String,
        #[serde(default)]
        players: HashMap<String, Value>,
    },
    PlayersPatch {
        #[serde(rename = "submitPlayerId")]
        submit_player_id: String,
        #[serde(default)]
        upsert: HashMap<String, Value>,
        #[serde(default)]
        delete: Vec<String>,
    },
    EntitiesUpdate {
        #[serde(rename = "submitPlayerId")]
        submit_player_id: String,
        #[serde(default)]
        entities: HashMap<String, Value>,
    },
    EntitiesPatch {
        #[serde(rename = "submitPlayerId")]
        submit_player_id: String,
        #[serde(default)]
        upsert: HashMap<String, Value>,
        #[serde(default)]
        delete: Vec<String>,
    },
    WaypointsUpdate {
        #[serde(rename = "submitPlayerId")]
        submit_player_id: String,
        #[serde(default)]
        waypoints: HashMap<String, Value>,
    },
    WaypointsDelete {
        #[serde(rename = "submitPlayerId")]
        submit_player_id: String,
        #[serde(rename = "waypointIds", default)]
        waypoint_ids: Vec<String>,
    },
    /// Not tied to a single source: fired when an entity death is observed
    /// anywhere, so any `waypointKind: "entity_track"` waypoint targeting it
    /// can be cancelled regardless of which source owns the waypoint.
    WaypointsEntityDeathCancel {
        #[serde(rename = "targetEntityIds", default)]
        target_entity_ids: Vec<String>,
    },
    TabPlayersUpdate {
        #[serde(rename = "submitPlayerId")]
        submit_player_id: String,
        #[serde(rename = "tabPlayers", default)]
        tab_players: Vec<TabPlayerEntry>,
    },
    ResyncReq {
        #[serde(rename = "submitPlayerId")]
        submit_player_id: String,
    },
}

impl ClientMessage {
    /// The reporting source id, or `None` for messages that aren't
    /// attributed to a single source (currently only the death-cancel
    /// broadcast notice).
    pub fn submit_player_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Handshake { submit_player_id, .. }
            | ClientMessage::PlayersUpdate { submit_player_id, .. }
            | ClientMessage::PlayersPatch { submit_player_id, .. }
            | ClientMessage::EntitiesUpdate { submit_player_id, .. }
            | ClientMessage::EntitiesPatch { submit_player_id, .. }
            | ClientMessage::WaypointsUpdate { submit_player_id, .. }
            | ClientMessage::WaypointsDelete { submit_player_id, .. }
            | ClientMessage::TabPlayersUpdate { submit_player_id, .. }
            | ClientMessage::ResyncReq { submit_player_id } => Some(submit_player_id),
            ClientMessage::WaypointsEntityDeathCancel { .. } => None,
        }
    }

    /// `true` for the three `*_patch`-shaped messages, which need a baseline
    /// to merge onto and trigger `missing_baseline_patch` refresh requests
    /// when one isn't present yet.
    pub fn is_patch(&self) -> bool {
        matches!(
            self,
            ClientMessage::PlayersPatch { .. } | ClientMessage::EntitiesPatch { .. }
        )
    }
}

/// One scope's worth of additions/removals, as sent in a `patch` message.
/// `upsert` values are field-level deltas (only the changed keys), not full
/// objects, except for newly-appearing ids which carry their full data.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ScopePatch {
    pub upsert: HashMap<String, Value>,
    pub delete: Vec<String>,
}

/// A resolved object as sent in a `positions` message to legacy subscribers:
/// the winning source's data plus bookkeeping a client can use to notice a
/// source switch. `snapshot_full`/`patch` instead send compact `id -> data`
/// maps with this bookkeeping stripped, matching the original wire format.
#[derive(Debug, Clone, Serialize)]
pub struct NodeWire {
    pub timestamp: f64,
    #[serde(rename = "submitPlayerId", skip_serializing_if = "Option::is_none")]
    pub submit_player_id: Option<String>,
    pub data: Value,
}

/// The three scope digests sent in a `digest` message.
#[derive(Debug, Clone, Serialize)]
pub struct DigestHashes {
    pub players: String,
    pub entities: String,
    pub waypoints: String,
}

/// A message sent by the hub to a player client or other subscriber. Field
/// names match spec.md §6 exactly: the server-origin revision counter is
/// `rev` on every scope-carrying message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    HandshakeAck {
        ready: bool,
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
        #[serde(rename = "deltaEnabled")]
        delta_enabled: bool,
        #[serde(rename = "digestIntervalSec")]
        digest_interval_sec: u64,
        rev: u64,
    },
    /// `players`/`entities`/`waypoints` are compact `id -> data` maps (the
    /// resolved view with bookkeeping stripped); `playerMarks` is only sent
    /// to subscribers that asked for it (admin / marks-aware clients).
    SnapshotFull {
        rev: u64,
        players: HashMap<String, Value>,
        entities: HashMap<String, Value>,
        waypoints: HashMap<String, Value>,
        #[serde(rename = "playerMarks", skip_serializing_if = "Option::is_none")]
        player_marks: Option<HashMap<String, PlayerMark>>,
    },
    Patch {
        rev: u64,
        players: ScopePatch,
        entities: ScopePatch,
        waypoints: ScopePatch,
    },
    /// Full resolved view sent to legacy (non-delta) subscribers on every
    /// change; never replaced by a patch. Carries the raw resolved nodes
    /// (timestamp + submitPlayerId + data), unlike `snapshot_full`'s compact
    /// maps, so legacy clients can still see which source currently owns an
    /// object.
    Positions {
        players: HashMap<String, NodeWire>,
        entities: HashMap<String, NodeWire>,
        waypoints: HashMap<String, NodeWire>,
        #[serde(rename = "playerMarks")]
        player_marks: HashMap<String, PlayerMark>,
    },
    Digest {
        rev: u64,
        hashes: DigestHashes,
    },
    /// Sent to exactly one source, asking it to resend full `players_update`
    /// / `entities_update` payloads for the listed ids: either because a
    /// patch arrived with no baseline yet, or because cleanup found reports
    /// nearing expiry inside the lead window.
    RefreshReq {
        reason: String,
        #[serde(rename = "serverTime")]
        server_time: f64,
        rev: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        players: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        entities: Vec<String>,
    },
}

/// A message sent on the admin WebSocket (`/adminws` in the original).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminMessage {
    Ping,
    Health,
    CommandPlayerMarkSet {
        #[serde(rename = "playerId")]
        player_id: Option<String>,
        team: Option<String>,
        color: Option<String>,
        label: Option<String>,
    },
    CommandPlayerMarkClear {
        #[serde(rename = "playerId")]
        player_id: Option<String>,
    },
    CommandPlayerMarkClearAll,
    CommandSameServerFilterSet {
        #[serde(default)]
        enabled: bool,
    },
}

/// The hub's reply to one admin command.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminReply {
    Pong {
        #[serde(rename = "serverTime")]
        server_time: f64,
        revision: u64,
    },
    AdminAck {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(flatten)]
        extra: HashMap<String, Value>,
    },
}

/// Same-server grouping state as shown to the admin UI.
#[derive(Debug, Clone, Serialize, Default)]
pub struct TabState {
    pub enabled: bool,
    /// source_id -> identity keys it last reported.
    pub reports: HashMap<String, Vec<String>>,
    /// Connected-component groups of source ids sharing an identity key.
    pub groups: Vec<Vec<String>>,
}

/// The periodic unsolicited push to every admin connection, the full
/// resolved view plus the bookkeeping an operator UI needs.
#[derive(Debug, Clone, Serialize)]
pub struct AdminSnapshot {
    #[serde(rename = "serverTime")]
    pub server_time: f64,
    pub players: HashMap<String, NodeWire>,
    pub entities: HashMap<String, NodeWire>,
    pub waypoints: HashMap<String, NodeWire>,
    #[serde(rename = "playerMarks")]
    pub player_marks: HashMap<String, PlayerMark>,
    #[serde(rename = "tabState")]
    pub tab_state: TabState,
    pub connections: Vec<String>,
    #[serde(rename = "connectionsCount")]
    pub connections_count: usize,
    pub revision: u64,
}

impl AdminReply {
    pub fn ok(action: &str, extra: HashMap<String, Value>) -> Self {
        AdminReply::AdminAck {
            ok: true,
            action: Some(action.to_string()),
            error: None,
            extra,
        }
    }

    pub fn err(action: Option<&str>, error: &str) -> Self {
        AdminReply::AdminAck {
            ok: false,
            action: action.map(str::to_string),
            error: Some(error.to_string()),
            extra: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_tags_map_to_snake_case() {
        let raw = r#"{"type":"players_patch","submitPlayerId":"abc","upsert":{},"delete":[]}"#;
        let parsed: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed, ClientMessage::PlayersPatch { .. }));
        assert_eq!(parsed.submit_player_id(), Some("abc"));
        assert!(parsed.is_patch());
    }

    #[test]
    fn death_cancel_has_no_submit_player_id() {
        let raw = r#"{"type":"waypoints_entity_death_cancel","targetEntityIds":["e1"]}"#;
        let parsed: ClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.submit_player_id(), None);
    }

    #[test]
    fn server_message_serializes_with_snake_case_tag() {
        let msg = ServerMessage::RefreshReq {
            reason: "missing_baseline_patch".to_string(),
            server_time: 12.5,
            rev: 3,
            players: vec!["p1".to_string()],
            entities: Vec::new(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"refresh_req""#));
        assert!(json.contains(r#""reason":"missing_baseline_patch""#));
        assert!(!json.contains("entities"));
    }
}
