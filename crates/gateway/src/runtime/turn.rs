//! The run executor — drives one run from admission to its terminal
//! state: context assembly, LLM streaming, permission-gated tool
//! dispatch, and cancellation at suspension points.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::oneshot;
use uuid::Uuid;

use ab_broker::{Decision, PendingPermission};
use ab_domain::event::{EventKind, PermissionDecision};
use ab_domain::provider::ChatRequest;
use ab_domain::run::RunState;
use ab_domain::stream::{StreamEvent, Usage};
use ab_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
use ab_tools::ToolOutcome;

use crate::context;
use crate::state::AppState;

use super::cancel::CancelToken;
use super::memory_tools;
use super::runs::{Run, Terminal};
use super::workers;
use super::{emit, finalize};

/// Maximum number of tool-call loops before the run is failed.
const MAX_TOOL_LOOPS: usize = 25;
/// Attempts to open the LLM stream before giving up.
const MAX_STREAM_ATTEMPTS: u32 = 3;
/// Base backoff between stream-open attempts.
const STREAM_BACKOFF: Duration = Duration::from_millis(250);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Spawn the executor task for an admitted run.
pub fn spawn_execute(state: AppState, run_id: Uuid) {
    let span = tracing::info_span!("run", %run_id);
    tokio::spawn(tracing::Instrument::instrument(
        async move {
            execute(state, run_id).await;
        },
        span,
    ));
}

async fn execute(state: AppState, run_id: Uuid) {
    let Some(run) = state.runs.get(&run_id) else {
        tracing::error!("executor spawned for unknown run");
        return;
    };
    if run.state.is_terminal() {
        return; // stopped while queued
    }

    let token = state.cancels.register(run_id);
    if let Some(parent) = run.parent_run_id {
        state.cancels.add_to_group(parent, run_id);
    }

    match state.runs.transition(&run_id, RunState::Running) {
        Ok(_) => {
            emit(
                &state,
                run_id,
                run.channel_id(),
                EventKind::RunStatus {
                    state: RunState::Running,
                },
            );
        }
        Err(_) => {
            // Raced with a stop between admission and start.
            finalize(&state, &run_id, Terminal::stopped("user", String::new()));
            return;
        }
    }

    tracing::debug!(kind = ?run.kind, session = %run.session_id, "run started");
    run_loop(state, run, token).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The tool loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_loop(state: AppState, run: Run, token: CancelToken) {
    let run_id = run.run_id;
    let channel = run.channel_id();

    // ── Context packet ───────────────────────────────────────────────
    let system_prompt = context::build_system_prompt(&state, &run).await;
    let mut messages = vec![Message::system(&system_prompt)];
    messages.extend(context::conversation_history(&state, &run));
    messages.push(Message::user(&run.input_text));

    let mut tool_defs: Vec<ToolDefinition> = state.tools.definitions();
    tool_defs.push(workers::delegate_definition());
    tool_defs.extend(memory_tools::definitions());

    let turn_timeout = Duration::from_secs(state.config.supervisor.turn_timeout_s);
    // Slightly above the shell tool's own timeout so the tool reports its
    // timeout as a structured result before the outer guard fires.
    let tool_timeout = Duration::from_secs(state.config.tools.shell.timeout_sec.max(1) + 5);
    let mut total_usage = Usage::default();

    for loop_idx in 0..MAX_TOOL_LOOPS {
        if token.is_cancelled() {
            finalize(&state, &run_id, Terminal::stopped("user", String::new()));
            return;
        }
        tracing::debug!(loop_idx, "tool loop iteration");

        let req = ChatRequest {
            messages: messages.clone(),
            tools: tool_defs.clone(),
            temperature: Some(0.2),
            max_tokens: None,
        };

        // ── Open the stream (bounded backoff on connect failures) ───
        let mut stream = None;
        for attempt in 0..MAX_STREAM_ATTEMPTS {
            match state.provider.chat_stream(req.clone()).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) if attempt + 1 < MAX_STREAM_ATTEMPTS => {
                    tracing::warn!(error = %e, attempt, "LLM stream open failed, retrying");
                    tokio::time::sleep(STREAM_BACKOFF * 2u32.pow(attempt)).await;
                }
                Err(e) => {
                    finalize(
                        &state,
                        &run_id,
                        Terminal::failed(format!("provider: {e}"), "provider"),
                    );
                    return;
                }
            }
        }
        let Some(mut stream) = stream else { return };

        // ── Consume chunks under the turn deadline ───────────────────
        let deadline = tokio::time::Instant::now() + turn_timeout;
        let mut text_buf = String::new();
        let mut pending_calls: Vec<ToolCall> = Vec::new();
        let mut turn_usage: Option<Usage> = None;

        loop {
            let next = match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    finalize(
                        &state,
                        &run_id,
                        Terminal::failed(
                            format!("timeout: turn exceeded {}s", turn_timeout.as_secs()),
                            "timeout",
                        ),
                    );
                    return;
                }
            };
            let Some(event) = next else { break };

            // Cancellation is observed at chunk boundaries: close the
            // stream and finalize with the partial text.
            if token.is_cancelled() {
                drop(stream);
                finalize(&state, &run_id, Terminal::stopped("user", text_buf));
                return;
            }

            match event {
                Ok(StreamEvent::Token { text }) => {
                    emit(
                        &state,
                        run_id,
                        channel.clone(),
                        EventKind::Token { text: text.clone() },
                    );
                    text_buf.push_str(&text);
                }
                Ok(StreamEvent::ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                }) => {
                    pending_calls.push(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                Ok(StreamEvent::Done { usage, .. }) => {
                    turn_usage = usage;
                }
                Ok(StreamEvent::Error { message }) | Err(ab_domain::Error::Provider(message)) => {
                    finalize(
                        &state,
                        &run_id,
                        Terminal::failed(format!("provider: {message}"), "provider"),
                    );
                    return;
                }
                Err(e) => {
                    finalize(
                        &state,
                        &run_id,
                        Terminal::failed(format!("provider: {e}"), "provider"),
                    );
                    return;
                }
            }
        }

        if let Some(usage) = &turn_usage {
            total_usage.add(usage);
        }

        // A stop between the last chunk and finalization still wins.
        if token.is_cancelled() {
            finalize(&state, &run_id, Terminal::stopped("user", text_buf));
            return;
        }

        // ── No tool calls: this is the final answer ──────────────────
        if pending_calls.is_empty() {
            finalize(
                &state,
                &run_id,
                Terminal::done(text_buf, Some(total_usage.clone())),
            );
            return;
        }

        // ── Serial tool dispatch (one in flight per run) ─────────────
        messages.push(assistant_with_tools(&text_buf, &pending_calls));

        for call in &pending_calls {
            if token.is_cancelled() {
                finalize(&state, &run_id, Terminal::stopped("user", text_buf));
                return;
            }

            let outcome =
                dispatch_gated(&state, &run, &token, call, tool_timeout).await;
            let Some(outcome) = outcome else {
                // The gate finalized the run (stop during the wait).
                return;
            };

            emit(
                &state,
                run_id,
                channel.clone(),
                EventKind::ToolResult {
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    content: outcome.content.clone(),
                    is_error: outcome.is_error,
                },
            );
            messages.push(Message::tool_result(&call.call_id, &outcome.content));
        }
    }

    finalize(
        &state,
        &run_id,
        Terminal::failed(
            format!("tool loop limit reached ({MAX_TOOL_LOOPS} iterations)"),
            "resource_exhausted",
        ),
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission gate + dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Route one tool call through the broker and execute it. Returns `None`
/// when the run was finalized during the wait (the caller must return).
async fn dispatch_gated(
    state: &AppState,
    run: &Run,
    token: &CancelToken,
    call: &ToolCall,
    tool_timeout: Duration,
) -> Option<ToolOutcome> {
    let is_delegate = call.tool_name == workers::DELEGATE_TOOL;
    let memory_capability = memory_tools::capability_of(&call.tool_name);
    let capability = if is_delegate {
        workers::DELEGATE_CAPABILITY.to_string()
    } else if let Some(capability) = memory_capability {
        capability.to_string()
    } else {
        match state.tools.capability_of(&call.tool_name) {
            Some(capability) => capability,
            None => {
                // Unregistered name: structured error, no permission round.
                emit_tool_call(state, run, call, "unknown");
                return Some(ToolOutcome::error(format!(
                    "unknown tool: {}",
                    call.tool_name
                )));
            }
        }
    };

    let preview = if is_delegate {
        workers::delegate_preview(&call.arguments)
    } else if memory_capability.is_some() {
        memory_tools::preview(&call.tool_name, &call.arguments)
    } else {
        state.tools.preview(&call.tool_name, &call.arguments)
    };

    // Fixed shell-write reclassification happens before policy matching.
    let capability = state.policy.effective_capability(&capability, &preview);

    match state.policy.check(&capability, &preview) {
        Decision::Allow => {}
        Decision::Deny => {
            emit_tool_call(state, run, call, &capability);
            return Some(ToolOutcome::error(format!(
                "permission denied by policy: {capability}"
            )));
        }
        Decision::Ask => {
            match ask_permission(state, run, token, call, &capability, &preview).await {
                AskOutcome::Allowed => {}
                AskOutcome::Denied => {
                    emit_tool_call(state, run, call, &capability);
                    return Some(ToolOutcome::error(format!(
                        "permission denied: {capability} ({})",
                        preview_snippet(&preview)
                    )));
                }
                AskOutcome::RunFinalized => return None,
            }
        }
    }

    emit_tool_call(state, run, call, &capability);

    if is_delegate {
        // Delegation has no per-call timeout; the child run is bounded by
        // its own turn timeouts and the cancel cascade.
        return Some(workers::delegate(state, run, &call.arguments).await);
    }
    if memory_capability.is_some() {
        return Some(memory_tools::dispatch(state, run, &call.tool_name, &call.arguments).await);
    }

    let invoked = tokio::time::timeout(
        tool_timeout,
        state.tools.invoke(&call.tool_name, &call.arguments),
    )
    .await;
    Some(match invoked {
        Ok(outcome) => outcome,
        Err(_) => ToolOutcome::error(format!(
            "tool timed out after {}s",
            tool_timeout.as_secs()
        )),
    })
}

enum AskOutcome {
    Allowed,
    Denied,
    /// A stop arrived during the wait and the run is already finalized.
    RunFinalized,
}

/// The ask flow: suspend the run, surface a `permission.request` on the
/// origin channel only, and wait for the human (or expiry, or stop).
async fn ask_permission(
    state: &AppState,
    run: &Run,
    token: &CancelToken,
    call: &ToolCall,
    capability: &str,
    preview: &str,
) -> AskOutcome {
    let run_id = run.run_id;
    let channel = run.channel_id();

    if state
        .runs
        .transition(&run_id, RunState::WaitingPermission)
        .is_ok()
    {
        emit(
            state,
            run_id,
            channel.clone(),
            EventKind::RunStatus {
                state: RunState::WaitingPermission,
            },
        );
    }

    let perm_id = Uuid::new_v4();
    let (respond_tx, respond_rx) = oneshot::channel();
    let info = state.broker.insert(PendingPermission {
        perm_id,
        run_id,
        channel_id: channel.clone(),
        capability: capability.to_string(),
        tool_name: call.tool_name.clone(),
        preview: preview.to_string(),
        created_at: chrono::Utc::now(),
        respond: respond_tx,
    });
    emit(
        state,
        run_id,
        channel.clone(),
        EventKind::PermissionRequest {
            perm_id: info.perm_id,
            capability: info.capability.clone(),
            tool_name: info.tool_name.clone(),
            preview: info.preview.clone(),
        },
    );

    // A stop that raced the insert above must not leave the request
    // dangling: resolve it ourselves and finalize.
    if token.is_cancelled() {
        if let Some(pending) = state.broker.resolve(&perm_id) {
            emit(
                state,
                run_id,
                channel,
                EventKind::PermissionResponse {
                    perm_id,
                    decision: PermissionDecision::Deny,
                    expired: false,
                },
            );
            pending.send(PermissionDecision::Deny);
        }
        finalize(state, &run_id, Terminal::stopped("user", String::new()));
        return AskOutcome::RunFinalized;
    }

    let decision = respond_rx
        .await
        .unwrap_or(PermissionDecision::Deny);

    if token.is_cancelled() {
        finalize(state, &run_id, Terminal::stopped("user", String::new()));
        return AskOutcome::RunFinalized;
    }

    if state.runs.transition(&run_id, RunState::Running).is_ok() {
        emit(
            state,
            run_id,
            channel,
            EventKind::RunStatus {
                state: RunState::Running,
            },
        );
    }

    match decision {
        PermissionDecision::Allow => AskOutcome::Allowed,
        PermissionDecision::Deny => AskOutcome::Denied,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn emit_tool_call(state: &AppState, run: &Run, call: &ToolCall, capability: &str) {
    emit(
        state,
        run.run_id,
        run.channel_id(),
        EventKind::ToolCall {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            capability: capability.to_string(),
            arguments: call.arguments.clone(),
        },
    );
}

fn assistant_with_tools(text: &str, calls: &[ToolCall]) -> Message {
    let mut parts = Vec::new();
    if !text.is_empty() {
        parts.push(ContentPart::Text {
            text: text.to_string(),
        });
    }
    for call in calls {
        parts.push(ContentPart::ToolUse {
            id: call.call_id.clone(),
            name: call.tool_name.clone(),
            input: call.arguments.clone(),
        });
    }
    Message {
        role: Role::Assistant,
        content: MessageContent::Parts(parts),
    }
}

fn preview_snippet(preview: &str) -> String {
    let mut end = preview.len().min(80);
    while !preview.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    preview[..end].to_string()
}
