//! Run tracking — the persistent record of every unit of work.
//!
//! Runs are kept in a bounded in-memory ring with an O(1) id index and
//! appended to a JSONL snapshot on terminal transition. The store owns the
//! lifecycle guardrails: transitions out of a terminal state are rejected,
//! and the first terminal transition wins.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ab_domain::run::{RunKind, RunOrigin, RunState};
use ab_domain::stream::Usage;
use ab_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub session_id: String,
    pub origin: RunOrigin,
    pub kind: RunKind,
    pub state: RunState,
    pub input_text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    /// Delegation depth: 0 for top-level runs, parent depth + 1 for
    /// workers.
    #[serde(default)]
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Seq of the latest event appended for this run.
    #[serde(default)]
    pub last_event_seq: u64,
    /// Number of events emitted for this run (its gapless `run_seq`).
    #[serde(default)]
    pub event_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure classification tag (`provider`, `timeout`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Run {
    pub fn new(
        session_id: impl Into<String>,
        origin: RunOrigin,
        kind: RunKind,
        input_text: impl Into<String>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            session_id: session_id.into(),
            origin,
            kind,
            state: RunState::Queued,
            input_text: input_text.into(),
            attachments: Vec::new(),
            depth: 0,
            parent_run_id: None,
            started_at: Utc::now(),
            updated_at: Utc::now(),
            last_event_seq: 0,
            event_count: 0,
            final_content: None,
            error: None,
            error_kind: None,
            stop_reason: None,
            usage: None,
        }
    }

    pub fn channel_id(&self) -> Option<String> {
        self.origin.channel_id().map(String::from)
    }
}

/// The payload applied by the single terminal transition.
#[derive(Debug, Clone, Default)]
pub struct Terminal {
    pub state: Option<RunState>,
    pub content: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub stop_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl Terminal {
    pub fn done(content: String, usage: Option<Usage>) -> Self {
        Self {
            state: Some(RunState::Done),
            content: Some(content),
            usage,
            ..Self::default()
        }
    }

    pub fn failed(error: String, error_kind: &str) -> Self {
        Self {
            state: Some(RunState::Failed),
            error: Some(error),
            error_kind: Some(error_kind.to_string()),
            ..Self::default()
        }
    }

    pub fn stopped(reason: &str, partial: String) -> Self {
        Self {
            state: Some(RunState::Stopped),
            content: if partial.is_empty() {
                None
            } else {
                Some(partial)
            },
            stop_reason: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MAX_RUNS_IN_MEMORY: usize = 2000;

pub struct RunStore {
    inner: RwLock<RunStoreInner>,
    log_path: PathBuf,
}

/// VecDeque ring plus a HashMap index mapping run_id to a logical
/// sequence number; `base_seq` tracks front pops so index values never
/// need bulk adjustment.
struct RunStoreInner {
    runs: VecDeque<Run>,
    index: HashMap<Uuid, usize>,
    base_seq: usize,
}

impl RunStoreInner {
    fn new(runs: VecDeque<Run>) -> Self {
        let mut index = HashMap::with_capacity(runs.len());
        for (i, run) in runs.iter().enumerate() {
            index.insert(run.run_id, i);
        }
        Self {
            runs,
            index,
            base_seq: 0,
        }
    }

    fn get(&self, run_id: &Uuid) -> Option<&Run> {
        let seq = *self.index.get(run_id)?;
        self.runs.get(seq - self.base_seq)
    }

    fn get_mut(&mut self, run_id: &Uuid) -> Option<&mut Run> {
        let seq = *self.index.get(run_id)?;
        self.runs.get_mut(seq - self.base_seq)
    }

    fn push_back(&mut self, run: Run) {
        let seq = self.base_seq + self.runs.len();
        self.index.insert(run.run_id, seq);
        self.runs.push_back(run);
    }

    fn pop_front(&mut self) -> Option<Run> {
        let run = self.runs.pop_front()?;
        self.index.remove(&run.run_id);
        self.base_seq += 1;
        Some(run)
    }
}

impl RunStore {
    /// Create a store, reloading the recent snapshot from JSONL. Runs
    /// that were non-terminal at crash time reload as `failed`.
    pub fn new(state_dir: &Path) -> Self {
        let dir = state_dir.join("runs");
        std::fs::create_dir_all(&dir).ok();
        let log_path = dir.join("runs.jsonl");

        let mut runs = VecDeque::new();
        if let Ok(content) = std::fs::read_to_string(&log_path) {
            let lines: Vec<&str> = content.lines().collect();
            for line in lines.iter().rev().take(MAX_RUNS_IN_MEMORY) {
                if let Ok(mut run) = serde_json::from_str::<Run>(line) {
                    if !run.state.is_terminal() {
                        run.state = RunState::Failed;
                        run.error = Some("process restarted mid-run".into());
                        run.error_kind = Some("other".into());
                    }
                    runs.push_front(run);
                }
            }
        }

        Self {
            inner: RwLock::new(RunStoreInner::new(runs)),
            log_path,
        }
    }

    pub fn insert(&self, run: Run) -> Uuid {
        let run_id = run.run_id;
        let mut inner = self.inner.write();
        inner.push_back(run);
        if inner.runs.len() > MAX_RUNS_IN_MEMORY {
            inner.pop_front();
        }
        run_id
    }

    pub fn get(&self, run_id: &Uuid) -> Option<Run> {
        self.inner.read().get(run_id).cloned()
    }

    /// Allocate the next per-run event sequence number (1-based, no
    /// gaps). Zero for unknown runs (store-level events).
    pub fn next_run_seq(&self, run_id: &Uuid) -> u64 {
        let mut inner = self.inner.write();
        match inner.get_mut(run_id) {
            Some(run) => {
                run.event_count += 1;
                run.event_count
            }
            None => 0,
        }
    }

    /// Apply a non-lifecycle update (event seq, usage accumulation).
    pub fn update<F>(&self, run_id: &Uuid, f: F) -> bool
    where
        F: FnOnce(&mut Run),
    {
        let mut inner = self.inner.write();
        if let Some(run) = inner.get_mut(run_id) {
            f(run);
            run.updated_at = Utc::now();
            return true;
        }
        false
    }

    /// Attempt a lifecycle transition. Rejects illegal moves with
    /// `StateConflict`; returns the run's channel for event emission.
    pub fn transition(&self, run_id: &Uuid, to: RunState) -> Result<Run> {
        let mut inner = self.inner.write();
        let run = inner
            .get_mut(run_id)
            .ok_or_else(|| Error::StateConflict(format!("unknown run {run_id}")))?;
        if !run.state.can_transition_to(to) {
            return Err(Error::StateConflict(format!(
                "run {run_id}: {:?} -> {to:?} is not a legal transition",
                run.state
            )));
        }
        run.state = to;
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    /// The single terminal transition. Returns `None` when the run is
    /// already terminal (the earliest terminal event decided) or unknown;
    /// the finalized run otherwise. Persists the snapshot line.
    pub fn try_finalize(&self, run_id: &Uuid, terminal: Terminal) -> Option<Run> {
        let run = {
            let mut inner = self.inner.write();
            let run = inner.get_mut(run_id)?;
            if run.state.is_terminal() {
                return None;
            }
            let state = terminal.state.unwrap_or(RunState::Failed);
            debug_assert!(state.is_terminal());
            run.state = state;
            run.final_content = terminal.content;
            run.error = terminal.error;
            run.error_kind = terminal.error_kind;
            run.stop_reason = terminal.stop_reason;
            if terminal.usage.is_some() {
                run.usage = terminal.usage;
            }
            run.updated_at = Utc::now();
            run.clone()
        };
        self.persist(&run);
        Some(run)
    }

    fn persist(&self, run: &Run) {
        if let Ok(json) = serde_json::to_string(run) {
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
            {
                let _ = writeln!(file, "{json}");
            }
        }
    }

    /// Newest-first listing with an optional session filter.
    pub fn list(&self, session_id: Option<&str>, limit: usize) -> Vec<Run> {
        let inner = self.inner.read();
        inner
            .runs
            .iter()
            .rev()
            .filter(|r| session_id.is_none_or(|s| r.session_id == s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Recent terminal runs of a session, oldest first (conversation
    /// context for the next run).
    pub fn recent_terminal(&self, session_id: &str, limit: usize) -> Vec<Run> {
        let inner = self.inner.read();
        let mut out: Vec<Run> = inner
            .runs
            .iter()
            .rev()
            .filter(|r| r.session_id == session_id && r.state.is_terminal())
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    /// Non-terminal runs idle since before the cutoff, excluding runs
    /// awaiting a permission decision (those wait for a human or expiry).
    pub fn stale_non_terminal(&self, idle_for: chrono::Duration) -> Vec<Run> {
        let cutoff = Utc::now() - idle_for;
        let inner = self.inner.read();
        inner
            .runs
            .iter()
            .filter(|r| {
                !r.state.is_terminal()
                    && r.state != RunState::WaitingPermission
                    && r.updated_at < cutoff
            })
            .cloned()
            .collect()
    }

    /// Evict terminal runs beyond the retention policy from the ring and
    /// rewrite the snapshot file.
    pub fn evict_terminal(&self, keep_days: u32, keep_max: usize) {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(keep_days));
        let mut inner = self.inner.write();

        let terminal_count = inner.runs.iter().filter(|r| r.state.is_terminal()).count();
        let mut over_max = terminal_count.saturating_sub(keep_max);

        let kept: VecDeque<Run> = inner
            .runs
            .drain(..)
            .filter(|r| {
                if !r.state.is_terminal() {
                    return true;
                }
                if over_max > 0 {
                    over_max -= 1;
                    return false;
                }
                r.updated_at >= cutoff
            })
            .collect();
        *inner = RunStoreInner::new(kept);

        // Rewrite the snapshot to match (tmp + rename).
        let tmp = self.log_path.with_extension("jsonl.tmp");
        let mut ok = false;
        if let Ok(mut f) = std::fs::File::create(&tmp) {
            ok = true;
            for run in inner.runs.iter().filter(|r| r.state.is_terminal()) {
                if let Ok(json) = serde_json::to_string(run) {
                    if writeln!(f, "{json}").is_err() {
                        ok = false;
                        break;
                    }
                }
            }
        }
        if ok {
            let _ = std::fs::rename(&tmp, &self.log_path);
        } else {
            let _ = std::fs::remove_file(&tmp);
        }
    }

    pub fn non_terminal_count(&self) -> usize {
        let inner = self.inner.read();
        inner.runs.iter().filter(|r| !r.state.is_terminal()).count()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn interactive_run(session: &str) -> Run {
        Run::new(
            session,
            RunOrigin::Channel {
                channel_id: "ws-1".into(),
            },
            RunKind::Interactive,
            "hello",
        )
    }

    fn store() -> (RunStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (RunStore::new(dir.path()), dir)
    }

    #[test]
    fn lifecycle_happy_path() {
        let (store, _dir) = store();
        let run = interactive_run("s");
        let run_id = store.insert(run);

        store.transition(&run_id, RunState::Running).unwrap();
        let finalized = store
            .try_finalize(&run_id, Terminal::done("answer".into(), None))
            .unwrap();
        assert_eq!(finalized.state, RunState::Done);
        assert_eq!(finalized.final_content.as_deref(), Some("answer"));
    }

    #[test]
    fn earliest_terminal_wins() {
        let (store, _dir) = store();
        let run_id = store.insert(interactive_run("s"));
        store.transition(&run_id, RunState::Running).unwrap();

        assert!(store
            .try_finalize(&run_id, Terminal::stopped("user", String::new()))
            .is_some());
        // A later completion attempt must not overwrite the stop.
        assert!(store
            .try_finalize(&run_id, Terminal::done("late answer".into(), None))
            .is_none());
        assert_eq!(store.get(&run_id).unwrap().state, RunState::Stopped);
    }

    #[test]
    fn transitions_out_of_terminal_are_rejected() {
        let (store, _dir) = store();
        let run_id = store.insert(interactive_run("s"));
        store.transition(&run_id, RunState::Running).unwrap();
        store
            .try_finalize(&run_id, Terminal::done("x".into(), None))
            .unwrap();

        let err = store.transition(&run_id, RunState::Running).unwrap_err();
        assert!(matches!(err, Error::StateConflict(_)));
    }

    #[test]
    fn waiting_permission_roundtrip() {
        let (store, _dir) = store();
        let run_id = store.insert(interactive_run("s"));
        store.transition(&run_id, RunState::Running).unwrap();
        store
            .transition(&run_id, RunState::WaitingPermission)
            .unwrap();
        store.transition(&run_id, RunState::Running).unwrap();
        assert_eq!(store.get(&run_id).unwrap().state, RunState::Running);
    }

    #[test]
    fn terminal_runs_reload_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = {
            let store = RunStore::new(dir.path());
            let run_id = store.insert(interactive_run("s"));
            store.transition(&run_id, RunState::Running).unwrap();
            store
                .try_finalize(&run_id, Terminal::done("persisted".into(), None))
                .unwrap();
            run_id
        };

        let store = RunStore::new(dir.path());
        let run = store.get(&run_id).unwrap();
        assert_eq!(run.state, RunState::Done);
        assert_eq!(run.final_content.as_deref(), Some("persisted"));
    }

    #[test]
    fn recent_terminal_is_per_session_oldest_first() {
        let (store, _dir) = store();
        for i in 0..3 {
            let mut run = interactive_run("s");
            run.input_text = format!("q{i}");
            let run_id = store.insert(run);
            store.transition(&run_id, RunState::Running).unwrap();
            store
                .try_finalize(&run_id, Terminal::done(format!("a{i}"), None))
                .unwrap();
        }
        store.insert(interactive_run("other"));

        let recent = store.recent_terminal("s", 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].input_text, "q1");
        assert_eq!(recent[1].input_text, "q2");
    }

    #[test]
    fn stale_sweep_excludes_waiting_permission() {
        let (store, _dir) = store();

        let stuck = store.insert(interactive_run("s1"));
        store.transition(&stuck, RunState::Running).unwrap();

        let waiting = store.insert(interactive_run("s2"));
        store.transition(&waiting, RunState::Running).unwrap();
        store
            .transition(&waiting, RunState::WaitingPermission)
            .unwrap();

        // Negative idle duration makes everything "stale" immediately.
        let stale = store.stale_non_terminal(chrono::Duration::seconds(-1));
        let ids: Vec<Uuid> = stale.iter().map(|r| r.run_id).collect();
        assert!(ids.contains(&stuck));
        assert!(!ids.contains(&waiting), "waiting_permission is exempt");
    }

    #[test]
    fn evict_respects_keep_max() {
        let (store, _dir) = store();
        for _ in 0..5 {
            let run_id = store.insert(interactive_run("s"));
            store.transition(&run_id, RunState::Running).unwrap();
            store
                .try_finalize(&run_id, Terminal::done("x".into(), None))
                .unwrap();
        }
        store.evict_terminal(30, 2);
        assert_eq!(store.list(None, 100).len(), 2);
    }

    #[test]
    fn unknown_run_is_state_conflict() {
        let (store, _dir) = store();
        assert!(store.transition(&Uuid::new_v4(), RunState::Running).is_err());
        assert!(store
            .try_finalize(&Uuid::new_v4(), Terminal::done("x".into(), None))
            .is_none());
    }
}
