//! Telegram adapter — a long-polling chat frontend.
//!
//! Inbound messages become `agent` requests with the adapter as origin;
//! outbound token deltas are coalesced under a rate-limited edit cadence
//! so streamed answers respect the upstream edit limits. Permission
//! requests render as inline Allow/Deny buttons whose callbacks map to
//! `permission.respond`. The last processed update id is persisted as a
//! JSON cursor file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use ab_domain::event::{Event, EventKind, PermissionDecision};
use ab_domain::run::{RunKind, RunOrigin, RunState};
use ab_protocol::Frame;

use crate::channels::ConnectedChannel;
use crate::state::AppState;
use crate::{commands, runtime};

/// The adapter's channel id — the unit of event fanout, like any client.
pub const TELEGRAM_CHANNEL: &str = "telegram";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cursor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cursor {
    /// Last processed Telegram update id.
    pub last_update_id: i64,
    /// Pinned chat once the first message arrives (single-user system).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
}

impl Cursor {
    pub fn load(path: &PathBuf) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &PathBuf) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(raw) = serde_json::to_vec_pretty(self) {
            let tmp = path.with_extension("json.tmp");
            if std::fs::write(&tmp, raw).is_ok() {
                let _ = std::fs::rename(&tmp, path);
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delta coalescing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RunRender {
    message_id: Option<i64>,
    text: String,
    dirty: bool,
    last_flush: Instant,
}

/// Per-run buffers of streamed text, flushed at the edit cadence.
pub struct Coalescer {
    edit_interval: Duration,
    runs: HashMap<Uuid, RunRender>,
}

/// What the flusher should do for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flush {
    Send { run_id: Uuid, text: String },
    Edit {
        run_id: Uuid,
        message_id: i64,
        text: String,
    },
}

impl Coalescer {
    pub fn new(edit_interval: Duration) -> Self {
        Self {
            edit_interval,
            runs: HashMap::new(),
        }
    }

    pub fn push_token(&mut self, run_id: Uuid, text: &str) {
        let render = self.runs.entry(run_id).or_insert_with(|| RunRender {
            message_id: None,
            text: String::new(),
            dirty: false,
            last_flush: Instant::now() - self.edit_interval,
        });
        render.text.push_str(text);
        render.dirty = true;
    }

    pub fn set_message_id(&mut self, run_id: Uuid, message_id: i64) {
        if let Some(render) = self.runs.get_mut(&run_id) {
            render.message_id = Some(message_id);
        }
    }

    /// Buffers due for a flush at `now` (cadence elapsed and dirty).
    pub fn due(&mut self, now: Instant) -> Vec<Flush> {
        let mut out = Vec::new();
        for (run_id, render) in self.runs.iter_mut() {
            if !render.dirty || now.duration_since(render.last_flush) < self.edit_interval {
                continue;
            }
            render.dirty = false;
            render.last_flush = now;
            out.push(match render.message_id {
                Some(message_id) => Flush::Edit {
                    run_id: *run_id,
                    message_id,
                    text: render.text.clone(),
                },
                None => Flush::Send {
                    run_id: *run_id,
                    text: render.text.clone(),
                },
            });
        }
        out
    }

    /// Final flush for a finished run; the buffer is dropped.
    pub fn finish(&mut self, run_id: &Uuid, final_text: Option<&str>) -> Option<Flush> {
        let render = self.runs.remove(run_id)?;
        let text = final_text.unwrap_or(&render.text).to_string();
        if text.is_empty() {
            return None;
        }
        Some(match render.message_id {
            Some(message_id) => Flush::Edit {
                run_id: *run_id,
                message_id,
                text,
            },
            None => Flush::Send { run_id: *run_id, text },
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bot API client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct BotClient {
    http: reqwest::Client,
    base: String,
}

impl BotClient {
    fn new(api_base: &str, token: &str) -> Option<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .ok()?;
        Some(Self {
            http,
            base: format!("{api_base}/bot{token}"),
        })
    }

    async fn call(&self, method: &str, body: Value) -> Option<Value> {
        let url = format!("{}/{method}", self.base);
        match self.http.post(&url).json(&body).send().await {
            Ok(resp) => match resp.json::<Value>().await {
                Ok(value) if value["ok"] == true => Some(value["result"].clone()),
                Ok(value) => {
                    tracing::warn!(method, error = %value["description"], "telegram call rejected");
                    None
                }
                Err(e) => {
                    tracing::warn!(method, error = %e, "telegram response unreadable");
                    None
                }
            },
            Err(e) => {
                tracing::debug!(method, error = %e, "telegram call failed");
                None
            }
        }
    }

    async fn get_updates(&self, offset: i64, timeout_s: u64) -> Vec<Value> {
        self.call(
            "getUpdates",
            json!({ "offset": offset, "timeout": timeout_s }),
        )
        .await
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default()
    }

    async fn send_message(&self, chat_id: i64, text: &str, reply_markup: Option<Value>) -> Option<i64> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(markup) = reply_markup {
            body["reply_markup"] = markup;
        }
        self.call("sendMessage", body)
            .await
            .and_then(|r| r["message_id"].as_i64())
    }

    async fn edit_message(&self, chat_id: i64, message_id: i64, text: &str) {
        let _ = self
            .call(
                "editMessageText",
                json!({ "chat_id": chat_id, "message_id": message_id, "text": text }),
            )
            .await;
    }

    async fn answer_callback(&self, callback_id: &str) {
        let _ = self
            .call("answerCallbackQuery", json!({ "callback_query_id": callback_id }))
            .await;
    }
}

/// Inline keyboard for a permission prompt.
pub fn permission_keyboard(perm_id: &Uuid) -> Value {
    json!({
        "inline_keyboard": [[
            { "text": "Allow", "callback_data": format!("perm:{perm_id}:allow") },
            { "text": "Deny", "callback_data": format!("perm:{perm_id}:deny") },
        ]]
    })
}

/// Parse a permission callback payload.
pub fn parse_permission_callback(data: &str) -> Option<(Uuid, PermissionDecision)> {
    let mut parts = data.split(':');
    if parts.next()? != "perm" {
        return None;
    }
    let perm_id: Uuid = parts.next()?.parse().ok()?;
    let decision = match parts.next()? {
        "allow" => PermissionDecision::Allow,
        "deny" => PermissionDecision::Deny,
        _ => return None,
    };
    Some((perm_id, decision))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Start the adapter when enabled and a token is present. Registers the
/// `telegram` channel and spawns the poll + render loops.
pub fn spawn_telegram_adapter(state: &AppState) -> bool {
    let config = state.config.frontends.adapters.telegram.clone();
    if !config.enabled {
        return false;
    }
    let Ok(token) = std::env::var(&config.token_env) else {
        tracing::warn!(
            env = %config.token_env,
            "telegram adapter enabled but token env is unset"
        );
        return false;
    };
    let Some(client) = BotClient::new(&config.api_base, &token) else {
        return false;
    };
    let client = std::sync::Arc::new(client);

    let cursor_path = state.config.workspace.state_dir.join("telegram_cursor.json");

    // Register the adapter as a channel so runtime fanout reaches it.
    let (event_tx, event_rx) = mpsc::channel::<Frame>(256);
    state.channels.register(ConnectedChannel {
        channel_id: TELEGRAM_CHANNEL.into(),
        client: TELEGRAM_CHANNEL.into(),
        connected_at: Utc::now(),
        sink: event_tx,
    });

    tokio::spawn(poll_loop(
        state.clone(),
        client.clone(),
        config.clone(),
        cursor_path,
    ));
    tokio::spawn(render_loop(client, config, event_rx));
    tracing::info!("telegram adapter started");
    true
}

async fn poll_loop(
    state: AppState,
    client: std::sync::Arc<BotClient>,
    config: ab_domain::config::TelegramConfig,
    cursor_path: PathBuf,
) {
    let mut cursor = Cursor::load(&cursor_path);
    if cursor.chat_id.is_none() {
        cursor.chat_id = config.chat_id;
    }

    loop {
        let updates = client
            .get_updates(cursor.last_update_id + 1, config.poll_timeout_s)
            .await;
        if updates.is_empty() {
            // Long poll returned empty or errored; avoid a hot loop.
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }

        for update in updates {
            if let Some(update_id) = update["update_id"].as_i64() {
                cursor.last_update_id = cursor.last_update_id.max(update_id);
            }

            // Inline Allow/Deny callbacks.
            if let Some(callback) = update.get("callback_query") {
                if let Some(data) = callback["data"].as_str() {
                    if let Some((perm_id, decision)) = parse_permission_callback(data) {
                        runtime::respond_permission(&state, &perm_id, decision);
                    }
                }
                if let Some(callback_id) = callback["id"].as_str() {
                    client.answer_callback(callback_id).await;
                }
                continue;
            }

            let Some(message) = update.get("message") else {
                continue;
            };
            let Some(text) = message["text"].as_str() else {
                continue;
            };
            let Some(chat_id) = message["chat"]["id"].as_i64() else {
                continue;
            };

            // Single-user: pin the first chat, ignore everything else.
            match cursor.chat_id {
                None => cursor.chat_id = Some(chat_id),
                Some(pinned) if pinned != chat_id => {
                    tracing::warn!(chat_id, "ignoring message from unknown chat");
                    continue;
                }
                _ => {}
            }

            let session_id = format!("chan:{TELEGRAM_CHANNEL}");
            if commands::is_command(text) {
                if let Some(payload) = commands::handle(&state, &session_id, text) {
                    let rendered =
                        serde_json::to_string_pretty(&payload).unwrap_or_default();
                    client.send_message(chat_id, &rendered, None).await;
                }
                continue;
            }

            let admitted = runtime::admit(
                &state,
                &session_id,
                RunOrigin::Channel {
                    channel_id: TELEGRAM_CHANNEL.into(),
                },
                RunKind::Interactive,
                text,
                Vec::new(),
            );
            match admitted {
                Ok((_, crate::sessions::Admission::Queued(position))) => {
                    client
                        .send_message(chat_id, &format!("accepted, queued at {position}"), None)
                        .await;
                }
                Ok(_) => {}
                Err(e) => {
                    client.send_message(chat_id, &format!("rejected: {e}"), None).await;
                }
            }
        }

        cursor.save(&cursor_path);
    }
}

async fn render_loop(
    client: std::sync::Arc<BotClient>,
    config: ab_domain::config::TelegramConfig,
    mut events: mpsc::Receiver<Frame>,
) {
    let mut coalescer = Coalescer::new(Duration::from_millis(config.edit_interval_ms));
    let mut chat_id = config.chat_id;
    let mut flush_tick = tokio::time::interval(Duration::from_millis(
        config.edit_interval_ms.max(100),
    ));

    loop {
        tokio::select! {
            frame = events.recv() => {
                let payload = match frame {
                    None => break,
                    Some(Frame::Event { payload, .. }) => payload,
                    Some(_) => continue,
                };
                let Ok(event) = serde_json::from_value::<Event>(payload) else {
                    continue;
                };
                // The chat is pinned by the poll loop's cursor; fall back
                // to the configured id for render-only sessions.
                let Some(chat) = chat_id.or(config.chat_id) else { continue };
                chat_id = Some(chat);

                match event.kind {
                    EventKind::Token { text } => {
                        coalescer.push_token(event.run_id, &text);
                    }
                    EventKind::PermissionRequest { perm_id, capability, preview, .. } => {
                        client
                            .send_message(
                                chat,
                                &format!("Permission needed: {capability}\n{preview}"),
                                Some(permission_keyboard(&perm_id)),
                            )
                            .await;
                    }
                    EventKind::RunFinal { state: run_state, content, error, .. } => {
                        let final_text = match run_state {
                            RunState::Failed => error.map(|e| format!("run failed: {e}")),
                            _ => content,
                        };
                        if let Some(flush) = coalescer.finish(&event.run_id, final_text.as_deref()) {
                            apply_flush(&client, chat, &mut coalescer, flush).await;
                        } else if let Some(text) = final_text {
                            if !text.is_empty() {
                                client.send_message(chat, &text, None).await;
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ = flush_tick.tick() => {
                let Some(chat) = chat_id.or(config.chat_id) else { continue };
                for flush in coalescer.due(Instant::now()) {
                    apply_flush(&client, chat, &mut coalescer, flush).await;
                }
            }
        }
    }
}

async fn apply_flush(
    client: &BotClient,
    chat_id: i64,
    coalescer: &mut Coalescer,
    flush: Flush,
) {
    match flush {
        Flush::Send { run_id, text } => {
            if let Some(message_id) = client.send_message(chat_id, &text, None).await {
                coalescer.set_message_id(run_id, message_id);
            }
        }
        Flush::Edit {
            message_id, text, ..
        } => {
            client.edit_message(chat_id, message_id, &text).await;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        let cursor = Cursor {
            last_update_id: 42,
            chat_id: Some(1234),
        };
        cursor.save(&path);

        let loaded = Cursor::load(&path);
        assert_eq!(loaded.last_update_id, 42);
        assert_eq!(loaded.chat_id, Some(1234));
    }

    #[test]
    fn cursor_missing_file_is_default() {
        let cursor = Cursor::load(&PathBuf::from("/nonexistent/cursor.json"));
        assert_eq!(cursor.last_update_id, 0);
        assert!(cursor.chat_id.is_none());
    }

    #[test]
    fn callback_parsing() {
        let perm_id = Uuid::new_v4();
        let (parsed, decision) =
            parse_permission_callback(&format!("perm:{perm_id}:allow")).unwrap();
        assert_eq!(parsed, perm_id);
        assert_eq!(decision, PermissionDecision::Allow);

        let (_, decision) =
            parse_permission_callback(&format!("perm:{perm_id}:deny")).unwrap();
        assert_eq!(decision, PermissionDecision::Deny);

        assert!(parse_permission_callback("perm:not-a-uuid:allow").is_none());
        assert!(parse_permission_callback(&format!("perm:{perm_id}:maybe")).is_none());
        assert!(parse_permission_callback("other:data").is_none());
    }

    #[test]
    fn keyboard_carries_both_choices() {
        let perm_id = Uuid::new_v4();
        let keyboard = permission_keyboard(&perm_id);
        let row = &keyboard["inline_keyboard"][0];
        assert_eq!(row[0]["text"], "Allow");
        assert_eq!(row[1]["text"], "Deny");
        assert!(row[0]["callback_data"]
            .as_str()
            .unwrap()
            .ends_with(":allow"));
    }

    #[test]
    fn coalescer_first_flush_is_send_then_edit() {
        let mut coalescer = Coalescer::new(Duration::from_millis(0));
        let run_id = Uuid::new_v4();

        coalescer.push_token(run_id, "hel");
        let due = coalescer.due(Instant::now());
        assert_eq!(due.len(), 1);
        assert!(matches!(due[0], Flush::Send { ref text, .. } if text == "hel"));

        coalescer.set_message_id(run_id, 99);
        coalescer.push_token(run_id, "lo");
        let due = coalescer.due(Instant::now());
        assert_eq!(due.len(), 1);
        assert!(
            matches!(due[0], Flush::Edit { message_id: 99, ref text, .. } if text == "hello")
        );
    }

    #[test]
    fn coalescer_respects_cadence() {
        let mut coalescer = Coalescer::new(Duration::from_secs(3600));
        let run_id = Uuid::new_v4();

        coalescer.push_token(run_id, "a");
        // First flush is allowed immediately (last_flush seeded in the past).
        assert_eq!(coalescer.due(Instant::now()).len(), 1);

        // Within the cadence window nothing further flushes.
        coalescer.push_token(run_id, "b");
        assert!(coalescer.due(Instant::now()).is_empty());

        // The final flush ignores the cadence.
        let flush = coalescer.finish(&run_id, Some("ab")).unwrap();
        assert!(matches!(flush, Flush::Send { ref text, .. } if text == "ab"));
    }

    #[test]
    fn coalescer_finish_without_content_is_none() {
        let mut coalescer = Coalescer::new(Duration::from_millis(0));
        let run_id = Uuid::new_v4();
        coalescer.push_token(run_id, "");
        assert!(coalescer.finish(&run_id, None).is_none());
        assert!(coalescer.finish(&Uuid::new_v4(), Some("x")).is_none());
    }
}
