//! The runtime — run admission, event emission, stop semantics, and the
//! terminal-state plumbing shared by the executor, scheduler, and worker
//! manager.

pub mod cancel;
pub mod memory_tools;
pub mod runs;
pub mod scheduler;
pub mod turn;
pub mod workers;

use uuid::Uuid;

use ab_domain::event::{Event, EventKind, PermissionDecision};
use ab_domain::run::{RunKind, RunOrigin, RunState};
use ab_domain::{Error, Result};

use crate::sessions::Admission;
use crate::state::AppState;

use runs::{Run, Terminal};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event emission
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Append an event to the log and fan it out to the run's origin channel.
/// Returns the assigned seq (0 when the log write failed, which is logged
/// and never fatal to the run).
pub fn emit(state: &AppState, run_id: Uuid, channel_id: Option<String>, kind: EventKind) -> u64 {
    let mut event = Event::new(run_id, channel_id, kind);
    event.run_seq = state.runs.next_run_seq(&run_id);
    match state.log.append(event.clone()) {
        Ok(seq) => {
            event.seq = seq;
            state.runs.update(&run_id, |r| r.last_event_seq = seq);
            state.channels.deliver(&event);
            seq
        }
        Err(e) => {
            tracing::error!(error = %e, run_id = %run_id, "event append failed");
            0
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Admission
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Create a run, record its input, and admit it into its session's FIFO.
/// When the session is idle the executor is spawned immediately.
pub fn admit(
    state: &AppState,
    session_id: &str,
    origin: RunOrigin,
    kind: RunKind,
    input_text: &str,
    attachments: Vec<String>,
) -> Result<(Uuid, Admission)> {
    let mut run = Run::new(session_id, origin, kind, input_text);
    run.attachments = attachments;
    admit_prepared(state, run)
}

/// Admission for a pre-built run (workers carry depth and parent links).
pub fn admit_prepared(state: &AppState, run: Run) -> Result<(Uuid, Admission)> {
    let run_id = run.run_id;
    let session_id = run.session_id.clone();
    let channel_id = run.channel_id();
    let input_text = run.input_text.clone();
    let attachments = run.attachments.clone();

    // Reserve the session slot first so a full queue never leaves a
    // phantom run behind.
    let admission = state.sessions.admit(&session_id, run_id)?;
    state.runs.insert(run);

    emit(
        state,
        run_id,
        channel_id.clone(),
        EventKind::RunInput {
            text: input_text,
            attachments,
        },
    );
    emit(
        state,
        run_id,
        channel_id,
        EventKind::RunStatus {
            state: RunState::Queued,
        },
    );

    if admission == Admission::Started {
        turn::spawn_execute(state.clone(), run_id);
    }
    Ok((run_id, admission))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stop a run. Idempotent: stopping an already-stopped run is a no-op;
/// stopping a run that completed or failed is a state conflict.
pub fn stop(state: &AppState, run_id: &Uuid) -> Result<()> {
    let run = state
        .runs
        .get(run_id)
        .ok_or_else(|| Error::StateConflict(format!("unknown run {run_id}")))?;

    if run.state.is_terminal() {
        if run.state == RunState::Stopped {
            return Ok(());
        }
        return Err(Error::StateConflict(format!(
            "run {run_id} already finished as {:?}",
            run.state
        )));
    }

    if run.state == RunState::Queued && !state.cancels.is_running(run_id) {
        // Never started: drop it from the queue and finalize directly.
        state.sessions.remove_queued(&run.session_id, run_id);
        finalize(state, run_id, Terminal::stopped("user", String::new()));
        return Ok(());
    }

    // Mark the transient superstate, signal the executor, and resolve any
    // open permission request as deny so the wait unblocks.
    let _ = state.runs.transition(run_id, RunState::Stopping);
    state.cancels.cancel(run_id);
    if let Some(pending) = state.broker.resolve_for_run(run_id) {
        emit(
            state,
            pending.run_id,
            pending.channel_id.clone(),
            EventKind::PermissionResponse {
                perm_id: pending.perm_id,
                decision: PermissionDecision::Deny,
                expired: false,
            },
        );
        pending.send(PermissionDecision::Deny);
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Apply a human decision to a pending request. Returns `false` for
/// unknown or already-resolved ids (the idempotent no-op). The single
/// `permission.response` event is appended before the executor resumes,
/// so replay always shows the response ahead of the run continuing.
pub fn respond_permission(
    state: &AppState,
    perm_id: &Uuid,
    decision: PermissionDecision,
) -> bool {
    let Some(pending) = state.broker.resolve(perm_id) else {
        return false;
    };
    emit(
        state,
        pending.run_id,
        pending.channel_id.clone(),
        EventKind::PermissionResponse {
            perm_id: pending.perm_id,
            decision,
            expired: false,
        },
    );
    pending.send(decision);
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Finalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drive a run to its terminal state: exactly one `run.final`, with a
/// preceding `run.status=stopped` on the stop path. The session FIFO
/// advances and the next queued run (if any) starts.
///
/// The earliest terminal event decides — a second finalization attempt is
/// silently dropped by the store.
pub fn finalize(state: &AppState, run_id: &Uuid, terminal: Terminal) {
    let Some(run) = state.runs.try_finalize(run_id, terminal) else {
        return;
    };
    let channel_id = run.channel_id();

    if run.state == RunState::Stopped {
        emit(
            state,
            run.run_id,
            channel_id.clone(),
            EventKind::RunStatus {
                state: RunState::Stopped,
            },
        );
    }

    emit(
        state,
        run.run_id,
        channel_id,
        EventKind::RunFinal {
            state: run.state,
            content: run.final_content.clone(),
            error: run.error.clone(),
            error_kind: run.error_kind.clone(),
            stop_reason: run.stop_reason.clone(),
            usage: run.usage.clone(),
        },
    );

    state.cancels.remove(&run.run_id);
    if let Some(parent) = run.parent_run_id {
        state.cancels.remove_from_group(&parent, &run.run_id);
    }

    if run.kind == RunKind::Worker {
        state.workers.on_terminal(&run);
    }

    // Post-run memory ingestion (done runs only, fire-and-forget).
    if run.state == RunState::Done {
        let state = state.clone();
        let origin_label = run.origin.label();
        let run_id = run.run_id;
        let channel_id = run.channel_id();
        let input = run.input_text.clone();
        let output = run.final_content.clone().unwrap_or_default();
        tokio::spawn(async move {
            let ingested = state
                .memory
                .ingest(
                    &run_id,
                    &origin_label,
                    &input,
                    &output,
                    Some(state.provider.as_ref()),
                )
                .await;
            match ingested {
                Ok(report) => {
                    for change in &report.changes {
                        let kind = match change {
                            ab_memory::MemoryChange::Added { item_id, text } => {
                                EventKind::MemoryAdded {
                                    item_id: *item_id,
                                    text: text.clone(),
                                }
                            }
                            ab_memory::MemoryChange::Modified { item_id } => {
                                EventKind::MemoryModified { item_id: *item_id }
                            }
                            ab_memory::MemoryChange::Removed { item_id } => {
                                EventKind::MemoryRemoved { item_id: *item_id }
                            }
                        };
                        emit(&state, run_id, channel_id.clone(), kind);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "post-run memory ingest failed"),
            }
        });
    }

    // Advance the session FIFO.
    if let Some(next) = state.sessions.advance(&run.session_id, &run.run_id) {
        turn::spawn_execute(state.clone(), next);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Maintenance
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One maintenance sweep: permission expiry, embedding backlog, log
/// pruning, snapshot eviction, stale-run auto-close, idle session prune.
pub async fn run_maintenance(state: &AppState) {
    // Expire old permission requests as deny.
    let max_age = chrono::Duration::seconds(state.config.permissions.max_age_s as i64);
    for pending in state.broker.expired(max_age) {
        emit(
            state,
            pending.run_id,
            pending.channel_id.clone(),
            EventKind::PermissionResponse {
                perm_id: pending.perm_id,
                decision: PermissionDecision::Deny,
                expired: true,
            },
        );
        pending.send(PermissionDecision::Deny);
    }

    // Embedding backlog.
    state.memory.run_maintenance().await;

    // Event-log archives.
    if let Err(e) = state.log.prune_archives() {
        tracing::warn!(error = %e, "event log pruning failed");
    }

    // Terminal-run snapshot retention.
    state.runs.evict_terminal(
        state.config.tasks.keep_done_days,
        state.config.tasks.keep_done_max,
    );

    // Auto-close stale non-terminal runs (waiting_permission exempt).
    let idle = chrono::Duration::seconds(state.config.tasks.auto_close_after_s as i64);
    for run in state.runs.stale_non_terminal(idle) {
        tracing::info!(run_id = %run.run_id, "auto-closing stale run");
        if let Err(e) = stop(state, &run.run_id) {
            tracing::debug!(error = %e, "stale run already finished");
        }
    }

    state.sessions.prune_idle(chrono::Duration::hours(12));
}
