//! Per-connection WebSocket handling for the subscriber channel: the
//! `INIT`/`READY` handshake of spec.md §4.6, wired into [`crate::ingest`] and
//! [`crate::broadcast`], using the teacher's split send/receive task pattern
//! (`relay-server/src/processing_module.rs`): two tasks, `tokio::select!`
//! aborts whichever loses, and a `&'static str` reason is logged on exit.

use crate::state::{AppState, ConnectionCapability, ConnectionHandle};
use crate::{broadcast, ingest};
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, ServerMessage};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Drives one subscriber connection end to end: wait for a valid init
/// message, register capability, run the forced-full tick, then split into
/// send/receive tasks until either side ends.
pub async fn handle_socket(socket: WebSocket, app: Arc<AppState>) {
    let (sender, mut receiver) = socket.split();

    let Some((source_id, protocol_version, delta_enabled, first_msg)) = wait_for_init(&mut receiver).await else {
        return;
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

    {
        let mut state = app.state.lock().await;
        state.connections.insert(source_id.clone(), ConnectionHandle { outbound: outbound_tx.clone() });
        state.connection_caps.insert(
            source_id.clone(),
            ConnectionCapability { protocol_version, delta_enabled, last_digest_sent: 0.0, force_full: true },
        );

        let rev = state.revision;
        let ack = ServerMessage::HandshakeAck {
            ready: true,
            protocol_version,
            delta_enabled,
            digest_interval_sec: app.config.digest_interval_sec,
            rev,
        };
        let _ = outbound_tx.send(ack);

        let now = now_secs();
        let effect = ingest::apply(&mut state, &app.config, &source_id, &first_msg, now);
        if let Some((scope, ids)) = effect.missing_baseline {
            broadcast::dispatch_missing_baseline(&mut state, &app.config, &source_id, scope, ids, now);
        }
        // Handshake completion always forces a full rebase (spec.md §4.5),
        // independent of whether the init message itself changed anything.
        broadcast::run_tick(&mut state, &app.config, now);
    }

    let source_for_send = source_id.clone();
    let mut send_task = tokio::spawn(async move { send_loop(sender, outbound_rx, source_for_send).await });

    let app_for_recv = app.clone();
    let source_for_recv = source_id.clone();
    let mut receive_task = tokio::spawn(async move { receive_loop(receiver, app_for_recv, source_for_recv).await });

    let reason = tokio::select! {
        res = &mut send_task => { receive_task.abort(); res },
        res = &mut receive_task => { send_task.abort(); res },
    }
    .unwrap_or_else(|err| {
        tracing::error!(?err, source_id, "panic in subscriber session");
        "Internal panic in subscriber session."
    });

    tracing::info!(source_id, reason, "subscriber connection closed");

    let mut state = app.state.lock().await;
    state.remove_connection(&source_id);
    let now = now_secs();
    broadcast::run_tick(&mut state, &app.config, now);
}

/// Waits for the first valid init message: either a real `handshake`, or
/// (backward-compatibility path) any data message carrying `submitPlayerId`,
/// registered as a legacy (protocol 1, no delta) subscriber. Malformed
/// frames and frames without a usable source id are logged and skipped
/// without closing the connection (spec.md §7).
async fn wait_for_init(receiver: &mut SplitStream<WebSocket>) -> Option<(String, u32, bool, ClientMessage)> {
    loop {
        let frame = receiver.next().await?;
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(err) => {
                tracing::warn!(?err, "websocket error before handshake");
                return None;
            }
        };

        let msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(%err, "malformed init frame, ignoring");
                continue;
            }
        };

        let Some(source_id) = msg.submit_player_id().map(str::to_string) else {
            tracing::debug!("init frame without submitPlayerId, ignoring");
            continue;
        };

        let (protocol_version, delta_enabled) = match &msg {
            ClientMessage::Handshake { protocol_version, supports_delta, .. } => (protocol_version.unwrap_or(1), *supports_delta),
            _ => (1, false),
        };

        return Some((source_id, protocol_version, delta_enabled, msg));
    }
}

async fn send_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<ServerMessage>,
    source_id: String,
) -> &'static str {
    while let Some(msg) = outbound_rx.recv().await {
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(?err, source_id, "failed to serialize outbound message, dropping");
                continue;
            }
        };
        if let Err(err) = sender.send(Message::Text(text.into())).await {
            tracing::warn!(?err, source_id, "websocket send error");
            return "Connection lost.";
        }
    }
    "Internal channel closed."
}

async fn receive_loop(mut receiver: SplitStream<WebSocket>, app: Arc<AppState>, source_id: String) -> &'static str {
    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return "Subscriber closed the connection.",
            Ok(_) => continue,
            Err(err) => {
                tracing::warn!(?err, source_id, "websocket receive error");
                return "Connection lost.";
            }
        };

        let msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(%err, source_id, "malformed frame, ignoring");
                continue;
            }
        };

        if msg.submit_player_id().is_some_and(|id| id != source_id) {
            tracing::debug!(source_id, "ignoring message attributed to a different source id");
            continue;
        }

        let now = now_secs();
        let mut state = app.state.lock().await;

        if matches!(msg, ClientMessage::ResyncReq { .. }) {
            broadcast::send_snapshot_full_to(&mut state, &app.config, &source_id, now);
            continue;
        }

        let effect = ingest::apply(&mut state, &app.config, &source_id, &msg, now);
        if let Some((scope, ids)) = effect.missing_baseline {
            broadcast::dispatch_missing_baseline(&mut state, &app.config, &source_id, scope, ids, now);
        }
        if effect.broadcast {
            broadcast::run_tick(&mut state, &app.config, now);
        } else if effect.admin_snapshot_only {
            broadcast::push_admin_snapshot(&mut state, &app.config, now);
        }
    }
    "Connection lost."
}
