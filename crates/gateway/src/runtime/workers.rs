//! Worker manager — the `delegate` pseudo-tool. A delegation creates a
//! child run in a worker-only session; the parent suspends on the handle
//! and receives the standard result envelope as its tool result.
//! Delegation depth is capped; terminated workers are retained (bounded)
//! for query.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use ab_domain::run::{RunKind, RunOrigin, RunState};
use ab_domain::tool::ToolDefinition;
use ab_tools::ToolOutcome;

use crate::state::AppState;

use super::runs::Run;

pub const DELEGATE_TOOL: &str = "delegate";
pub const DELEGATE_CAPABILITY: &str = "worker.delegate";

/// Maximum delegation depth: a top-level run may delegate, and its
/// workers may delegate once more.
const D_MAX: u32 = 2;
/// Terminated workers retained for `workers.list`.
const RECENT_WORKERS: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope & records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The standard worker result envelope.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerEnvelope {
    pub summary: String,
    pub artifacts: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub worker_id: Uuid,
    pub parent_run_id: Uuid,
    pub role: String,
    pub state: RunState,
    pub summary: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WorkerManager {
    waiters: Mutex<HashMap<Uuid, oneshot::Sender<WorkerEnvelope>>>,
    roles: Mutex<HashMap<Uuid, String>>,
    recent: Mutex<VecDeque<WorkerRecord>>,
}

impl Default for WorkerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerManager {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            roles: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    fn register_waiter(&self, worker_id: Uuid, role: &str) -> oneshot::Receiver<WorkerEnvelope> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(worker_id, tx);
        self.roles.lock().insert(worker_id, role.to_string());
        rx
    }

    /// Called by run finalization for every worker-kind run: build the
    /// envelope, retain the record, and wake the awaiting parent.
    pub fn on_terminal(&self, run: &Run) {
        let envelope = envelope_for(run);
        let role = self
            .roles
            .lock()
            .remove(&run.run_id)
            .unwrap_or_else(|| "worker".into());

        {
            let mut recent = self.recent.lock();
            recent.push_back(WorkerRecord {
                worker_id: run.run_id,
                parent_run_id: run.parent_run_id.unwrap_or(run.run_id),
                role,
                state: run.state,
                summary: envelope.summary.clone(),
            });
            while recent.len() > RECENT_WORKERS {
                recent.pop_front();
            }
        }

        if let Some(waiter) = self.waiters.lock().remove(&run.run_id) {
            let _ = waiter.send(envelope);
        }
    }

    /// Recently terminated workers, newest first.
    pub fn list_recent(&self) -> Vec<WorkerRecord> {
        self.recent.lock().iter().rev().cloned().collect()
    }
}

fn envelope_for(run: &Run) -> WorkerEnvelope {
    match run.state {
        RunState::Done => WorkerEnvelope {
            summary: run.final_content.clone().unwrap_or_default(),
            artifacts: run.attachments.clone(),
            errors: Vec::new(),
        },
        RunState::Failed => WorkerEnvelope {
            summary: String::new(),
            artifacts: Vec::new(),
            errors: vec![run.error.clone().unwrap_or_else(|| "worker failed".into())],
        },
        _ => WorkerEnvelope {
            summary: run.final_content.clone().unwrap_or_default(),
            artifacts: Vec::new(),
            errors: vec![format!(
                "worker stopped ({})",
                run.stop_reason.as_deref().unwrap_or("unknown")
            )],
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The delegate pseudo-tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn delegate_definition() -> ToolDefinition {
    ToolDefinition {
        name: DELEGATE_TOOL.into(),
        description: "Delegate a task to a sub-worker run. Suspends until the worker \
                      finishes and returns its result envelope."
            .into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "role": { "type": "string", "description": "Free-form worker role label" },
                "task": { "type": "string", "description": "The task for the worker" }
            },
            "required": ["role", "task"]
        }),
    }
}

pub fn delegate_preview(arguments: &Value) -> String {
    let role = arguments.get("role").and_then(Value::as_str).unwrap_or("?");
    let task = arguments.get("task").and_then(Value::as_str).unwrap_or("");
    format!("{role}: {task}")
}

/// Create and await a child worker run. Depth past the cap is denied.
pub async fn delegate(state: &AppState, parent: &Run, arguments: &Value) -> ToolOutcome {
    let role = arguments
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("worker")
        .to_string();
    let Some(task) = arguments.get("task").and_then(Value::as_str) else {
        return ToolOutcome::error("missing required argument: task");
    };

    let depth = parent.depth + 1;
    if depth > D_MAX {
        return ToolOutcome::error(format!(
            "delegation denied: depth limit {D_MAX} reached"
        ));
    }

    let mut child = Run::new(
        String::new(), // session assigned below from the child id
        RunOrigin::Parent {
            run_id: parent.run_id,
        },
        RunKind::Worker,
        task,
    );
    child.session_id = format!("worker:{}", child.run_id);
    child.depth = depth;
    child.parent_run_id = Some(parent.run_id);
    let worker_id = child.run_id;

    // Register interest before admission so a fast worker cannot finish
    // unobserved, and wire the cancel cascade before the child starts.
    let rx = state.workers.register_waiter(worker_id, &role);
    state.cancels.add_to_group(parent.run_id, worker_id);

    if let Err(e) = super::admit_prepared(state, child) {
        state.workers.waiters.lock().remove(&worker_id);
        return ToolOutcome::error(format!("delegation failed: {e}"));
    }

    tracing::info!(
        worker_id = %worker_id,
        parent = %parent.run_id,
        role = %role,
        "worker delegated"
    );

    match rx.await {
        Ok(envelope) => {
            let is_error = !envelope.errors.is_empty();
            match serde_json::to_string(&envelope) {
                Ok(content) => ToolOutcome { content, is_error },
                Err(e) => ToolOutcome::error(format!("envelope encoding failed: {e}")),
            }
        }
        Err(_) => ToolOutcome::error("worker terminated without a result envelope"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
