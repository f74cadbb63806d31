//! Per-session FIFO queues — at most one non-terminal run per session;
//! further requests wait in admission order behind a soft cap.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use ab_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Session {
    active_run: Option<Uuid>,
    queue: VecDeque<Uuid>,
    last_activity: DateTime<Utc>,
}

impl Session {
    fn new() -> Self {
        Self {
            active_run: None,
            queue: VecDeque::new(),
            last_activity: Utc::now(),
        }
    }
}

/// Admission outcome for a new run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The session was idle; the run may start immediately.
    Started,
    /// A run is active; this one waits at the given 1-based position.
    Queued(usize),
}

/// Status snapshot of one session (for the health endpoint).
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_run_id: Option<Uuid>,
    pub queue_depth: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    soft_cap: usize,
}

impl SessionManager {
    pub fn new(soft_cap: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            soft_cap: soft_cap.max(1),
        }
    }

    /// Admit a run into a session. Returns `queue_full` when the FIFO is
    /// at the soft cap, leaving the queue unchanged.
    pub fn admit(&self, session_id: &str, run_id: Uuid) -> Result<Admission> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(Session::new);
        session.last_activity = Utc::now();

        if session.active_run.is_none() {
            session.active_run = Some(run_id);
            return Ok(Admission::Started);
        }
        if session.queue.len() >= self.soft_cap {
            return Err(Error::ResourceExhausted(format!(
                "queue_full: session {session_id} has {} pending runs",
                session.queue.len()
            )));
        }
        session.queue.push_back(run_id);
        Ok(Admission::Queued(session.queue.len()))
    }

    /// Called when the active run of a session reaches a terminal state.
    /// Pops the next queued run (it becomes active) for the caller to
    /// start. Empty sessions linger until pruned.
    pub fn advance(&self, session_id: &str, terminal_run: &Uuid) -> Option<Uuid> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(session_id)?;
        if session.active_run != Some(*terminal_run) {
            // A queued run was stopped before it ever became active.
            session.queue.retain(|id| id != terminal_run);
            return None;
        }
        session.last_activity = Utc::now();
        session.active_run = session.queue.pop_front();
        session.active_run
    }

    /// Remove a queued (not yet active) run. Returns true when found.
    pub fn remove_queued(&self, session_id: &str, run_id: &Uuid) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        let before = session.queue.len();
        session.queue.retain(|id| id != run_id);
        session.queue.len() < before
    }

    /// The run `run.stop` without an id targets: the session's active run.
    pub fn active_run(&self, session_id: &str) -> Option<Uuid> {
        self.sessions.lock().get(session_id)?.active_run
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.lock();
        let mut out: Vec<SessionSnapshot> = sessions
            .iter()
            .map(|(id, s)| SessionSnapshot {
                session_id: id.clone(),
                active_run_id: s.active_run,
                queue_depth: s.queue.len(),
            })
            .collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }

    /// Drop idle sessions with no active run and an empty queue.
    pub fn prune_idle(&self, older_than: chrono::Duration) {
        let cutoff = Utc::now() - older_than;
        self.sessions.lock().retain(|_, s| {
            s.active_run.is_some() || !s.queue.is_empty() || s.last_activity > cutoff
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
