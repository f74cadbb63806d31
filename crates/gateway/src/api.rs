//! HTTP surface — the WebSocket upgrade route and the read-only health
//! endpoint. Everything else speaks the frame protocol over the socket.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::state::AppState;
use crate::ws;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::client_ws))
        .route("/healthz", get(healthz))
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(status_payload(&state))
}

/// The read-only status report, shared by `/healthz` and the `status`
/// frame method.
pub fn status_payload(state: &AppState) -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": state.uptime_seconds(),
        "connections": state.channels.count(),
        "sessions": state.sessions.snapshots(),
        "session_count": state.sessions.session_count(),
        "pending_permissions": state.broker.pending_count(),
        "active_runs": state.runs.non_terminal_count(),
        "schedules": state.schedules.count(),
        "memory_items": state.memory.item_count(),
        "event_log_bytes": state.log.current_size(),
    })
}
