//! HTTP pass-through for the external tile map origin, plus the `/health`
//! and `/snapshot` debug endpoints — explicitly out of core scope (spec.md
//! §1), kept as thin real routes so the binary runs end to end, mirroring
//! `original_source`'s `nodemc_proxy.py` reduced to a basic method/status/
//! content-type passthrough (no HTML overlay injection, no header-by-header
//! fidelity).

use crate::broadcast;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn target_origin() -> String {
    std::env::var("NODEMC_TARGET_ORIGIN").unwrap_or_else(|_| "https://map.nodemc.cc".to_string())
}

/// `GET /health`: liveness plus a glance at current load, for an operator's
/// uptime check.
pub async fn health(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    let state = app.state.lock().await;
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.connections.len(),
        "adminConnections": state.admin_connections.len(),
        "revision": state.revision,
    }))
}

/// `GET /snapshot`: the same payload pushed to admins each tick, available
/// on demand over plain HTTP for debugging without opening a WebSocket.
pub async fn snapshot(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    let mut state = app.state.lock().await;
    let now = now_secs();
    let snapshot = broadcast::build_admin_snapshot(&state, &app.config, now);
    // Debug reads shouldn't silently miss a tick's worth of timeout cleanup.
    broadcast::run_tick(&mut state, &app.config, now);
    Json(snapshot)
}

/// `GET/HEAD /nodemc-proxy/*path`: forwards to the external map origin and
/// relays status, content-type and body back untouched.
pub async fn nodemc_proxy(
    State(app): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let mut url = format!("{}/{}", target_origin().trim_end_matches('/'), path.trim_start_matches('/'));
    if !query.is_empty() {
        let qs: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
        url.push('?');
        url.push_str(&qs.join("&"));
    }

    let mut request = app.http_client.get(&url);
    for name in ["cookie", "range", "if-none-match", "if-modified-since", "accept-encoding"] {
        if let Some(value) = headers.get(name) {
            request = request.header(name, value.clone());
        }
    }

    match request.send().await {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = upstream
                .headers()
                .get("content-type")
                .cloned()
                .unwrap_or_else(|| "application/octet-stream".parse().unwrap());
            match upstream.bytes().await {
                Ok(body) => {
                    let mut response = Response::builder().status(status);
                    response = response.header("content-type", content_type);
                    response.body(axum::body::Body::from(body)).unwrap_or_else(|_| {
                        StatusCode::INTERNAL_SERVER_ERROR.into_response()
                    })
                }
                Err(err) => {
                    tracing::warn!(%err, url, "nodemc proxy failed reading upstream body");
                    StatusCode::BAD_GATEWAY.into_response()
                }
            }
        }
        Err(err) => {
            tracing::warn!(%err, url, "nodemc proxy request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
