//! WebSocket endpoint for client channels.
//!
//! Flow:
//! 1. Client connects to `/ws`
//! 2. The first frame must be a `connect` request with the protocol
//!    version (and token when the gateway requires one)
//! 3. The gateway replies, replays missed events from the client's
//!    `last_seq`, and re-emits still-pending permission requests
//! 4. Request/response loop; events fan out through the channel registry
//!
//! A malformed first frame or JSON closes the connection.

use axum::extract::ws::{Message as WsFrame, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use uuid::Uuid;

use ab_domain::event::{EventFilter, EventKind};
use ab_domain::run::{RunKind, RunOrigin};
use ab_protocol::{
    AgentParams, ConnectParams, Frame, MemoryDeleteParams, MemoryListParams, MemoryPinParams,
    MemorySearchParams, Method, PermissionRespondParams, RunStopParams, ScheduleCreateParams,
    ScheduleDeleteParams, ScheduleUpdateParams, PROTOCOL_VERSION,
};

use crate::channels::{event_frame, ConnectedChannel};
use crate::runtime::scheduler::ScheduleKind;
use crate::sessions::Admission;
use crate::state::AppState;
use crate::{api, commands, runtime};

/// Constant-time token comparison via SHA-256 digest.
/// Hashing normalizes lengths so ct_eq always compares 32 bytes.
fn token_matches(expected_hash: &[u8], provided: &str) -> bool {
    let provided_hash = Sha256::digest(provided.as_bytes());
    provided_hash.as_slice().ct_eq(expected_hash).into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn client_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // ── Handshake ───────────────────────────────────────────────────
    let (connect_id, params) = match wait_for_connect(&mut ws_stream).await {
        Ok(handshake) => handshake,
        Err(message) => {
            tracing::warn!(error = %message, "handshake failed, closing");
            let _ = send_frame(&mut ws_sink, &Frame::err("connect", message)).await;
            return;
        }
    };

    if params.protocol_version != PROTOCOL_VERSION {
        let _ = send_frame(
            &mut ws_sink,
            &Frame::err(
                connect_id,
                format!(
                    "protocol: version {} unsupported (gateway speaks {PROTOCOL_VERSION})",
                    params.protocol_version
                ),
            ),
        )
        .await;
        return;
    }

    if let Some(expected) = &state.gateway_token_hash {
        let provided = params.token.as_deref().unwrap_or("");
        if !token_matches(expected, provided) {
            let _ = send_frame(
                &mut ws_sink,
                &Frame::err(connect_id, "protocol: invalid or missing token"),
            )
            .await;
            return;
        }
    }

    // The client identity is the channel id, so a reconnecting client
    // resumes its session and pending permission prompts.
    let channel_id = params.client.clone();
    let session_id = format!("chan:{channel_id}");

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(256);
    state.channels.register(ConnectedChannel {
        channel_id: channel_id.clone(),
        client: params.client.clone(),
        connected_at: Utc::now(),
        sink: outbound_tx.clone(),
    });

    tracing::info!(channel_id = %channel_id, "channel connected");

    // Writer task: forwards outbound frames to the WS sink.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if send_frame(&mut ws_sink, &frame).await.is_err() {
                break;
            }
        }
    });

    let _ = outbound_tx
        .send(Frame::ok(
            connect_id,
            serde_json::json!({
                "channel_id": channel_id,
                "protocol_version": PROTOCOL_VERSION,
                "gateway_version": env!("CARGO_PKG_VERSION"),
            }),
        ))
        .await;

    // ── Replay after reconnect ──────────────────────────────────────
    if let Some(last_seq) = params.last_seq {
        replay(&state, &channel_id, last_seq, &outbound_tx).await;
    }
    for pending in state.broker.pending_for_channel(&channel_id) {
        let payload = serde_json::to_value(&pending).unwrap_or_default();
        let _ = outbound_tx
            .send(Frame::event("permission.request", payload, None))
            .await;
    }

    // ── Request loop ────────────────────────────────────────────────
    while let Some(Ok(frame)) = ws_stream.next().await {
        match frame {
            WsFrame::Text(text) => {
                let parsed: Frame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(channel_id = %channel_id, error = %e, "malformed frame, closing");
                        break;
                    }
                };
                if let Frame::Req { id, method, params } = parsed {
                    let res =
                        dispatch(&state, &channel_id, &session_id, &id, &method, params).await;
                    if outbound_tx.send(res).await.is_err() {
                        break;
                    }
                }
                // res/event frames from a client are ignored.
            }
            WsFrame::Close(_) => break,
            WsFrame::Ping(_) | WsFrame::Pong(_) => {}
            _ => {}
        }
    }

    // Cleanup. A replacement sink from a reconnect stays registered;
    // runs keep executing and their events stay replayable.
    writer.abort();
    state.channels.remove_if_same(&channel_id, &outbound_tx);
    tracing::info!(channel_id = %channel_id, "channel disconnected");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handshake & replay
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn wait_for_connect(
    stream: &mut (impl StreamExt<Item = Result<WsFrame, axum::Error>> + Unpin),
) -> Result<(String, ConnectParams), String> {
    let first = tokio::time::timeout(std::time::Duration::from_secs(10), stream.next())
        .await
        .map_err(|_| "protocol: no handshake within 10s".to_string())?;

    let Some(Ok(WsFrame::Text(text))) = first else {
        return Err("protocol: connection closed before handshake".into());
    };
    let frame: Frame =
        serde_json::from_str(&text).map_err(|e| format!("protocol: malformed handshake: {e}"))?;
    let Frame::Req { id, method, params } = frame else {
        return Err("protocol: first frame must be a request".into());
    };
    if method != "connect" {
        return Err(format!("protocol: first request must be connect, got {method}"));
    }
    let params: ConnectParams = serde_json::from_value(params)
        .map_err(|e| format!("protocol: bad connect params: {e}"))?;
    Ok((id, params))
}

/// Replay events for this channel after `last_seq`, bounded by the
/// configured window. When more were missed than the window holds, only
/// the newest are sent (the client resyncs from its own history).
async fn replay(state: &AppState, channel_id: &str, last_seq: u64, sink: &mpsc::Sender<Frame>) {
    let filter = EventFilter::for_channel(channel_id);
    match state.log.scan(&filter, last_seq + 1) {
        Ok(mut events) => {
            let window = state.config.server.replay_window;
            let skipped = events.len().saturating_sub(window);
            if skipped > 0 {
                events.drain(..skipped);
                tracing::debug!(channel_id, skipped, "replay window exceeded");
            }
            for event in &events {
                if sink.send(event_frame(event)).await.is_err() {
                    return;
                }
            }
            tracing::debug!(channel_id, replayed = events.len(), "replay complete");
        }
        Err(e) => tracing::warn!(error = %e, "event replay failed"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn dispatch(
    state: &AppState,
    channel_id: &str,
    session_id: &str,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> Frame {
    let Some(method) = Method::parse(method) else {
        return Frame::err(id, format!("protocol: unknown method {method}"));
    };

    match method {
        Method::Connect => Frame::err(id, "protocol: already connected"),
        Method::Agent => handle_agent(state, channel_id, session_id, id, params),
        Method::RunStop => handle_run_stop(state, session_id, id, params),
        Method::PermissionRespond => handle_permission_respond(state, id, params),
        Method::MemorySearch => handle_memory_search(state, id, params).await,
        Method::MemoryList => handle_memory_list(state, id, params),
        Method::MemoryDelete => handle_memory_delete(state, channel_id, id, params),
        Method::MemoryPin => handle_memory_pin(state, channel_id, id, params),
        Method::SchedulesList => Frame::ok(
            id,
            serde_json::json!({ "schedules": state.schedules.list() }),
        ),
        Method::SchedulesCreate => handle_schedule_create(state, id, params),
        Method::SchedulesUpdate => handle_schedule_update(state, id, params),
        Method::SchedulesDelete => handle_schedule_delete(state, id, params),
        Method::WorkersList => Frame::ok(
            id,
            serde_json::json!({ "workers": state.workers.list_recent() }),
        ),
        Method::Status => Frame::ok(id, api::status_payload(state)),
    }
}

fn handle_agent(
    state: &AppState,
    channel_id: &str,
    session_id: &str,
    id: &str,
    params: serde_json::Value,
) -> Frame {
    let params: AgentParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return Frame::err(id, format!("protocol: bad agent params: {e}")),
    };

    // `/` commands are a gateway concern; clients forward text verbatim.
    if commands::is_command(&params.text) {
        if let Some(payload) = commands::handle(state, session_id, &params.text) {
            return Frame::ok(id, payload);
        }
    }

    let session_id = params.session_id.as_deref().unwrap_or(session_id);
    let admitted = runtime::admit(
        state,
        session_id,
        RunOrigin::Channel {
            channel_id: channel_id.to_string(),
        },
        RunKind::Interactive,
        &params.text,
        params.attachments,
    );

    match admitted {
        Ok((run_id, Admission::Started)) => Frame::ok(
            id,
            serde_json::json!({ "run_id": run_id, "accepted": true, "status": "started" }),
        ),
        Ok((run_id, Admission::Queued(position))) => Frame::ok(
            id,
            serde_json::json!({
                "run_id": run_id,
                "accepted": true,
                "status": "queued",
                "position": position,
            }),
        ),
        Err(e) => Frame::err(id, e.to_string()),
    }
}

fn handle_run_stop(
    state: &AppState,
    session_id: &str,
    id: &str,
    params: serde_json::Value,
) -> Frame {
    let params: RunStopParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return Frame::err(id, format!("protocol: bad run.stop params: {e}")),
    };
    let Some(run_id) = params
        .run_id
        .or_else(|| state.sessions.active_run(session_id))
    else {
        return Frame::err(id, "state conflict: no active run to stop");
    };
    match runtime::stop(state, &run_id) {
        Ok(()) => Frame::ok(id, serde_json::json!({ "run_id": run_id, "stopping": true })),
        Err(e) => Frame::err(id, e.to_string()),
    }
}

fn handle_permission_respond(state: &AppState, id: &str, params: serde_json::Value) -> Frame {
    let params: PermissionRespondParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return Frame::err(id, format!("protocol: bad permission.respond params: {e}")),
    };

    // A second response for an already-resolved id is dropped silently.
    let applied = runtime::respond_permission(state, &params.perm_id, params.decision);
    Frame::ok(id, serde_json::json!({ "applied": applied }))
}

async fn handle_memory_search(state: &AppState, id: &str, params: serde_json::Value) -> Frame {
    let params: MemorySearchParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return Frame::err(id, format!("protocol: bad memory.search params: {e}")),
    };
    let limit = params.limit.unwrap_or(10);
    match state.memory.search(&params.query, limit).await {
        Ok(hits) => Frame::ok(id, serde_json::json!({ "hits": hits })),
        Err(e) => Frame::err(id, e.to_string()),
    }
}

fn handle_memory_list(state: &AppState, id: &str, params: serde_json::Value) -> Frame {
    let params: MemoryListParams = serde_json::from_value(params).unwrap_or_default();
    let limit = params.limit.unwrap_or(50);
    match state.memory.list_recent(limit) {
        Ok(items) => {
            let items: Vec<serde_json::Value> = items
                .into_iter()
                .map(|i| {
                    serde_json::json!({
                        "item_id": i.item_id,
                        "text": i.text,
                        "importance": i.importance,
                        "created_at": i.created_at,
                        "last_seen_at": i.last_seen_at,
                    })
                })
                .collect();
            Frame::ok(
                id,
                serde_json::json!({ "items": items, "pinned": state.memory.pinned_items() }),
            )
        }
        Err(e) => Frame::err(id, e.to_string()),
    }
}

fn handle_memory_delete(
    state: &AppState,
    channel_id: &str,
    id: &str,
    params: serde_json::Value,
) -> Frame {
    let params: MemoryDeleteParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return Frame::err(id, format!("protocol: bad memory.delete params: {e}")),
    };
    match state.memory.delete(&params.item_id) {
        Ok(Some(_)) => {
            runtime::emit(
                state,
                Uuid::nil(),
                Some(channel_id.to_string()),
                EventKind::MemoryRemoved {
                    item_id: params.item_id,
                },
            );
            Frame::ok(id, serde_json::json!({ "deleted": true }))
        }
        Ok(None) => Frame::ok(id, serde_json::json!({ "deleted": false })),
        Err(e) => Frame::err(id, e.to_string()),
    }
}

fn handle_memory_pin(
    state: &AppState,
    channel_id: &str,
    id: &str,
    params: serde_json::Value,
) -> Frame {
    let params: MemoryPinParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return Frame::err(id, format!("protocol: bad memory.pin params: {e}")),
    };
    match state.memory.pin(&params.text) {
        Ok(change) => {
            let (kind, item_id, created) = match change {
                ab_memory::MemoryChange::Added { item_id, text } => (
                    EventKind::MemoryAdded { item_id, text },
                    item_id,
                    true,
                ),
                ab_memory::MemoryChange::Modified { item_id } => {
                    (EventKind::MemoryModified { item_id }, item_id, false)
                }
                ab_memory::MemoryChange::Removed { item_id } => {
                    (EventKind::MemoryRemoved { item_id }, item_id, false)
                }
            };
            runtime::emit(state, Uuid::nil(), Some(channel_id.to_string()), kind);
            Frame::ok(
                id,
                serde_json::json!({ "item_id": item_id, "created": created }),
            )
        }
        Err(e) => Frame::err(id, e.to_string()),
    }
}

fn handle_schedule_create(state: &AppState, id: &str, params: serde_json::Value) -> Frame {
    let params: ScheduleCreateParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return Frame::err(id, format!("protocol: bad schedules.create params: {e}")),
    };
    let kind = match params.kind.as_str() {
        "interval" => ScheduleKind::Interval,
        "daily" => ScheduleKind::Daily,
        "cron" => ScheduleKind::Cron,
        other => return Frame::err(id, format!("protocol: unknown schedule kind {other}")),
    };
    let timezone = params
        .timezone
        .unwrap_or_else(|| state.config.scheduler.timezone.clone());
    match state.schedules.create(
        &params.name,
        kind,
        &params.spec,
        &params.prompt,
        &timezone,
        params.enabled,
    ) {
        Ok(schedule) => Frame::ok(id, serde_json::json!({ "schedule": schedule })),
        Err(e) => Frame::err(id, e.to_string()),
    }
}

fn handle_schedule_update(state: &AppState, id: &str, params: serde_json::Value) -> Frame {
    let params: ScheduleUpdateParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return Frame::err(id, format!("protocol: bad schedules.update params: {e}")),
    };
    if let Some(spec) = &params.spec {
        let Some(schedule) = state.schedules.get(&params.schedule_id) else {
            return Frame::err(id, "unknown schedule");
        };
        if let Err(e) = crate::runtime::scheduler::ScheduleStore::validate_spec(schedule.kind, spec)
        {
            return Frame::err(id, e.to_string());
        }
    }
    let updated = state.schedules.update(&params.schedule_id, |s| {
        if let Some(prompt) = &params.prompt {
            s.prompt = prompt.clone();
        }
        if let Some(spec) = &params.spec {
            s.spec = spec.clone();
            // Recompute the boundary for the new cadence.
            s.next_run_at = crate::runtime::scheduler::next_boundary(
                s.kind,
                spec,
                s.tz(),
                &Utc::now(),
            );
        }
        if let Some(enabled) = params.enabled {
            s.enabled = enabled;
        }
    });
    match updated {
        Ok(Some(schedule)) => Frame::ok(id, serde_json::json!({ "schedule": schedule })),
        Ok(None) => Frame::err(id, "unknown schedule"),
        Err(e) => Frame::err(id, e.to_string()),
    }
}

fn handle_schedule_delete(state: &AppState, id: &str, params: serde_json::Value) -> Frame {
    let params: ScheduleDeleteParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return Frame::err(id, format!("protocol: bad schedules.delete params: {e}")),
    };
    match state.schedules.delete(&params.schedule_id) {
        Ok(deleted) => Frame::ok(id, serde_json::json!({ "deleted": deleted })),
        Err(e) => Frame::err(id, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn send_frame(
    sink: &mut (impl SinkExt<WsFrame> + Unpin),
    frame: &Frame,
) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    sink.send(WsFrame::Text(json)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_check_is_exact() {
        let hash = Sha256::digest(b"secret").to_vec();
        assert!(token_matches(&hash, "secret"));
        assert!(!token_matches(&hash, "wrong"));
        assert!(!token_matches(&hash, ""));
    }
}
