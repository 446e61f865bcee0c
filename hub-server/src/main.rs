mod admin;
mod arbitrator;
mod broadcast;
mod ingest;
mod pool;
mod proxy;
mod session;
mod state;
mod timeout;
mod visibility;

use crate::state::AppState;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use protocol::HubConfig;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tower_http::services::{ServeDir, ServeFile};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[tokio::main]
/// Initializes tracing, spawns the safety-net cleanup ticker, then wires up
/// the subscriber/admin WebSocket routes plus the `/health`, `/snapshot` and
/// tile-proxy HTTP routes. Listens on port 8080.
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=trace", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let app_state = AppState::new(HubConfig::from_env());

    let watchdog_state = app_state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            let mut state = watchdog_state.state.lock().await;
            let now = now_secs();
            broadcast::run_tick(&mut state, &watchdog_state.config, now);
        }
    });

    let app = Router::new()
        .route("/ws", get(subscriber_handler))
        .route("/adminws", get(admin_handler))
        .route("/health", get(proxy::health))
        .route("/snapshot", get(proxy::snapshot))
        .route("/nodemc-proxy/{*path}", get(proxy::nodemc_proxy))
        .with_state(app_state)
        .fallback_service(ServeDir::new(".").not_found_service(ServeFile::new("index.html")));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await.unwrap();

    tracing::info!("hub listening on 127.0.0.1:8080");
    axum::serve(listener, app).await.unwrap();
}

async fn subscriber_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| session::handle_socket(socket, state))
}

async fn admin_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| admin::handle_socket(socket, state))
}
