//! WebSocket handling for the admin channel: operator commands (player
//! marks, same-server filter toggle) plus the periodic unsolicited
//! [`protocol::AdminSnapshot`] push, mirroring the split send/receive task
//! pattern used for subscribers in [`crate::session`].

use crate::broadcast;
use crate::state::{AdminHandle, AppState};
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{normalize_mark_color, AdminMessage, AdminReply, AdminSnapshot, Team};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

pub async fn handle_socket(socket: WebSocket, app: Arc<AppState>) {
    let (sender, receiver) = socket.split();

    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<AdminReply>();
    let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel::<AdminSnapshot>();

    let admin_id = {
        let mut state = app.state.lock().await;
        state.next_admin_id += 1;
        let admin_id = format!("admin-{}", state.next_admin_id);
        state.admin_connections.insert(
            admin_id.clone(),
            AdminHandle { outbound: reply_tx, snapshot_outbound: snapshot_tx },
        );
        let now = now_secs();
        broadcast::push_admin_snapshot(&mut state, &app.config, now);
        admin_id
    };

    let admin_for_send = admin_id.clone();
    let mut send_task = tokio::spawn(async move { send_loop(sender, reply_rx, snapshot_rx, admin_for_send).await });

    let app_for_recv = app.clone();
    let admin_for_recv = admin_id.clone();
    let mut receive_task = tokio::spawn(async move { receive_loop(receiver, app_for_recv, admin_for_recv).await });

    let reason = tokio::select! {
        res = &mut send_task => { receive_task.abort(); res },
        res = &mut receive_task => { send_task.abort(); res },
    }
    .unwrap_or_else(|err| {
        tracing::error!(?err, admin_id, "panic in admin session");
        "Internal panic in admin session."
    });

    tracing::info!(admin_id, reason, "admin connection closed");

    let mut state = app.state.lock().await;
    state.admin_connections.remove(&admin_id);
}

async fn send_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut reply_rx: mpsc::UnboundedReceiver<AdminReply>,
    mut snapshot_rx: mpsc::UnboundedReceiver<AdminSnapshot>,
    admin_id: String,
) -> &'static str {
    loop {
        let payload = tokio::select! {
            reply = reply_rx.recv() => match reply {
                Some(reply) => serde_json::to_string(&reply),
                None => return "Internal channel closed.",
            },
            snapshot = snapshot_rx.recv() => match snapshot {
                Some(snapshot) => serde_json::to_string(&snapshot),
                None => return "Internal channel closed.",
            },
        };

        let text = match payload {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(?err, admin_id, "failed to serialize admin message, dropping");
                continue;
            }
        };

        if let Err(err) = sender.send(Message::Text(text.into())).await {
            tracing::warn!(?err, admin_id, "admin websocket send error");
            return "Connection lost.";
        }
    }
}

async fn receive_loop(mut receiver: SplitStream<WebSocket>, app: Arc<AppState>, admin_id: String) -> &'static str {
    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return "Admin closed the connection.",
            Ok(_) => continue,
            Err(err) => {
                tracing::warn!(?err, admin_id, "admin websocket receive error");
                return "Connection lost.";
            }
        };

        let msg: AdminMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(%err, admin_id, "malformed admin frame, ignoring");
                continue;
            }
        };

        let now = now_secs();
        let mut state = app.state.lock().await;
        let (reply, force_full) = handle_command(&mut state, msg, now);

        if let Some(handle) = state.admin_connections.get(&admin_id) {
            let _ = handle.outbound.send(reply);
        }

        if force_full {
            for cap in state.connection_caps.values_mut() {
                cap.force_full = true;
            }
            broadcast::run_tick(&mut state, &app.config, now);
        }
    }
    "Connection lost."
}

/// Applies one admin command to hub state and returns the reply to send
/// back plus whether it must force an immediate full broadcast to every
/// delta client (only `command_same_server_filter_set`, spec.md §4.5).
fn handle_command(state: &mut crate::state::HubState, msg: AdminMessage, now: f64) -> (AdminReply, bool) {
    match msg {
        AdminMessage::Ping => (
            AdminReply::Pong { server_time: now, revision: state.revision },
            false,
        ),
        AdminMessage::Health => {
            let mut extra = std::collections::HashMap::new();
            extra.insert("connections".to_string(), serde_json::json!(state.connections.len()));
            extra.insert("revision".to_string(), serde_json::json!(state.revision));
            (AdminReply::ok("health", extra), false)
        }
        AdminMessage::CommandPlayerMarkSet { player_id, team, color, label } => {
            let Some(player_id) = player_id else {
                return (AdminReply::err(Some("command_player_mark_set"), "missing playerId"), false);
            };
            let team = Team::normalize(team.as_deref());
            let color = color.and_then(|c| normalize_mark_color(Some(&c)));
            let now_ms = (now * 1000.0) as i64;
            let mark = state.set_player_mark(&player_id, team, color, label, now_ms);
            let mut extra = std::collections::HashMap::new();
            extra.insert("playerId".to_string(), serde_json::json!(player_id));
            extra.insert("mark".to_string(), serde_json::to_value(&mark).unwrap_or_default());
            (AdminReply::ok("command_player_mark_set", extra), false)
        }
        AdminMessage::CommandPlayerMarkClear { player_id } => {
            let Some(player_id) = player_id else {
                return (AdminReply::err(Some("command_player_mark_clear"), "missing playerId"), false);
            };
            let existed = state.clear_player_mark(&player_id);
            let mut extra = std::collections::HashMap::new();
            extra.insert("playerId".to_string(), serde_json::json!(player_id));
            extra.insert("existed".to_string(), serde_json::json!(existed));
            (AdminReply::ok("command_player_mark_clear", extra), false)
        }
        AdminMessage::CommandPlayerMarkClearAll => {
            let count = state.clear_all_player_marks();
            let mut extra = std::collections::HashMap::new();
            extra.insert("cleared".to_string(), serde_json::json!(count));
            (AdminReply::ok("command_player_mark_clear_all", extra), false)
        }
        AdminMessage::CommandSameServerFilterSet { enabled } => {
            state.same_server_filter_enabled = enabled;
            let mut extra = std::collections::HashMap::new();
            extra.insert("enabled".to_string(), serde_json::json!(enabled));
            (AdminReply::ok("command_same_server_filter_set", extra), true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::HubState;

    #[test]
    fn ping_replies_with_pong_and_current_revision() {
        let mut state = HubState { revision: 7, ..HubState::default() };
        let (reply, force_full) = handle_command(&mut state, AdminMessage::Ping, 100.0);
        assert!(!force_full);
        match reply {
            AdminReply::Pong { revision, .. } => assert_eq!(revision, 7),
            _ => panic!("expected pong"),
        }
    }

    #[test]
    fn same_server_filter_set_forces_full_and_updates_state() {
        let mut state = HubState::default();
        let (_, force_full) = handle_command(
            &mut state,
            AdminMessage::CommandSameServerFilterSet { enabled: true },
            100.0,
        );
        assert!(force_full);
        assert!(state.same_server_filter_enabled);
    }

    #[test]
    fn mark_set_then_clear_round_trips() {
        let mut state = HubState::default();
        let (reply, force_full) = handle_command(
            &mut state,
            AdminMessage::CommandPlayerMarkSet {
                player_id: Some("p1".to_string()),
                team: Some("enemy".to_string()),
                color: None,
                label: None,
            },
            100.0,
        );
        assert!(!force_full);
        assert!(matches!(reply, AdminReply::AdminAck { ok: true, .. }));
        assert_eq!(state.player_marks.len(), 1);

        let (reply, _) = handle_command(
            &mut state,
            AdminMessage::CommandPlayerMarkClear { player_id: Some("p1".to_string()) },
            100.0,
        );
        assert!(matches!(reply, AdminReply::AdminAck { ok: true, .. }));
        assert!(state.player_marks.is_empty());
    }

    #[test]
    fn mark_set_without_player_id_errors() {
        let mut state = HubState::default();
        let (reply, force_full) = handle_command(
            &mut state,
            AdminMessage::CommandPlayerMarkSet { player_id: None, team: None, color: None, label: None },
            100.0,
        );
        assert!(!force_full);
        assert!(matches!(reply, AdminReply::AdminAck { ok: false, .. }));
    }
}
