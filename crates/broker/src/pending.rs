//! Pending permission requests — suspended-run control records awaiting a
//! human allow/deny.
//!
//! Resolution is a two-step dance owned by the caller: `resolve` removes
//! the record (idempotently — a second call finds nothing), the caller
//! appends the `permission.response` event, and only then fires the
//! record's `respond` sender so the suspended executor always resumes
//! after the response is durable.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use ab_domain::event::PermissionDecision;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A request waiting for human review.
pub struct PendingPermission {
    pub perm_id: Uuid,
    pub run_id: Uuid,
    /// Channel the request was surfaced on (re-emitted there on reconnect).
    pub channel_id: Option<String>,
    pub capability: String,
    pub tool_name: String,
    pub preview: String,
    pub created_at: DateTime<Utc>,
    pub respond: oneshot::Sender<PermissionDecision>,
}

impl PendingPermission {
    /// Fire the decision into the suspended executor. The receiver may be
    /// gone when the run was stopped concurrently; that is fine.
    pub fn send(self, decision: PermissionDecision) {
        let _ = self.respond.send(decision);
    }
}

/// Serializable snapshot of a pending request (for status queries and
/// reconnect re-emission).
#[derive(Debug, Clone, Serialize)]
pub struct PermissionInfo {
    pub perm_id: Uuid,
    pub run_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub capability: String,
    pub tool_name: String,
    pub preview: String,
    pub created_at: DateTime<Utc>,
}

impl From<&PendingPermission> for PermissionInfo {
    fn from(p: &PendingPermission) -> Self {
        Self {
            perm_id: p.perm_id,
            run_id: p.run_id,
            channel_id: p.channel_id.clone(),
            capability: p.capability.clone(),
            tool_name: p.tool_name.clone(),
            preview: p.preview.clone(),
            created_at: p.created_at,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Broker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Thread-safe store of pending permission requests.
pub struct PermissionBroker {
    pending: RwLock<HashMap<Uuid, PendingPermission>>,
}

impl Default for PermissionBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionBroker {
    pub fn new() -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new pending request. Returns the snapshot the caller
    /// emits as a `permission.request` event.
    pub fn insert(&self, pending: PendingPermission) -> PermissionInfo {
        let info = PermissionInfo::from(&pending);
        self.pending.write().insert(pending.perm_id, pending);
        info
    }

    /// Take a pending request out for resolution. `None` for unknown or
    /// already-resolved ids — the idempotent no-op path.
    pub fn resolve(&self, perm_id: &Uuid) -> Option<PendingPermission> {
        self.pending.write().remove(perm_id)
    }

    /// Take the open request of a run (the stop path).
    pub fn resolve_for_run(&self, run_id: &Uuid) -> Option<PendingPermission> {
        let perm_id = {
            let pending = self.pending.read();
            pending
                .values()
                .find(|p| p.run_id == *run_id)
                .map(|p| p.perm_id)
        }?;
        self.resolve(&perm_id)
    }

    /// Take all requests older than `max_age`; the caller resolves them
    /// as deny with the expired flag.
    pub fn expired(&self, max_age: Duration) -> Vec<PendingPermission> {
        let cutoff = Utc::now() - max_age;
        let stale: Vec<Uuid> = {
            let pending = self.pending.read();
            pending
                .values()
                .filter(|p| p.created_at < cutoff)
                .map(|p| p.perm_id)
                .collect()
        };
        stale.iter().filter_map(|id| self.resolve(id)).collect()
    }

    /// Pending requests surfaced on a channel, oldest first (re-emitted on
    /// reconnect of the same channel).
    pub fn pending_for_channel(&self, channel_id: &str) -> Vec<PermissionInfo> {
        let mut infos: Vec<PermissionInfo> = self
            .pending
            .read()
            .values()
            .filter(|p| p.channel_id.as_deref() == Some(channel_id))
            .map(PermissionInfo::from)
            .collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    /// The open request of a run, when one exists. A run in
    /// `waiting_permission` references exactly one.
    pub fn pending_for_run(&self, run_id: &Uuid) -> Option<PermissionInfo> {
        self.pending
            .read()
            .values()
            .find(|p| p.run_id == *run_id)
            .map(PermissionInfo::from)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pending(
        run_id: Uuid,
        channel_id: Option<&str>,
    ) -> (PendingPermission, oneshot::Receiver<PermissionDecision>) {
        let (tx, rx) = oneshot::channel();
        let pending = PendingPermission {
            perm_id: Uuid::new_v4(),
            run_id,
            channel_id: channel_id.map(String::from),
            capability: "shell.run".into(),
            tool_name: "shell_run".into(),
            preview: "echo hi".into(),
            created_at: Utc::now(),
            respond: tx,
        };
        (pending, rx)
    }

    #[tokio::test]
    async fn resolve_then_send_unblocks_the_waiter() {
        let broker = PermissionBroker::new();
        let (pending, rx) = make_pending(Uuid::new_v4(), Some("ws-1"));
        let perm_id = pending.perm_id;
        broker.insert(pending);

        let resolved = broker.resolve(&perm_id).unwrap();
        resolved.send(PermissionDecision::Allow);
        assert_eq!(rx.await.unwrap(), PermissionDecision::Allow);
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn second_resolve_is_a_no_op() {
        let broker = PermissionBroker::new();
        let (pending, _rx) = make_pending(Uuid::new_v4(), None);
        let perm_id = pending.perm_id;
        broker.insert(pending);

        assert!(broker.resolve(&perm_id).is_some());
        assert!(broker.resolve(&perm_id).is_none());
    }

    #[test]
    fn resolve_unknown_id_is_a_no_op() {
        let broker = PermissionBroker::new();
        assert!(broker.resolve(&Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn resolve_for_run_finds_the_open_request() {
        let broker = PermissionBroker::new();
        let run_id = Uuid::new_v4();
        let (pending, rx) = make_pending(run_id, None);
        broker.insert(pending);

        let resolved = broker.resolve_for_run(&run_id).unwrap();
        resolved.send(PermissionDecision::Deny);
        assert_eq!(rx.await.unwrap(), PermissionDecision::Deny);
        assert!(broker.resolve_for_run(&run_id).is_none());
    }

    #[tokio::test]
    async fn dropping_a_resolved_request_errors_the_waiter() {
        let broker = PermissionBroker::new();
        let (pending, rx) = make_pending(Uuid::new_v4(), None);
        let perm_id = pending.perm_id;
        broker.insert(pending);

        drop(broker.resolve(&perm_id));
        assert!(rx.await.is_err(), "waiters treat a dropped sender as deny");
    }

    #[test]
    fn expired_takes_only_old_requests() {
        let broker = PermissionBroker::new();
        let (mut old, _old_rx) = make_pending(Uuid::new_v4(), None);
        old.created_at = Utc::now() - Duration::seconds(120);
        let old_id = old.perm_id;
        broker.insert(old);

        let (fresh, _fresh_rx) = make_pending(Uuid::new_v4(), None);
        broker.insert(fresh);

        let expired = broker.expired(Duration::seconds(60));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].perm_id, old_id);
        assert_eq!(broker.pending_count(), 1);
    }

    #[test]
    fn pending_for_channel_is_scoped_and_ordered() {
        let broker = PermissionBroker::new();

        let (mut first, _rx1) = make_pending(Uuid::new_v4(), Some("a"));
        first.created_at = Utc::now() - Duration::seconds(10);
        let first_id = first.perm_id;
        broker.insert(first);

        let (second, _rx2) = make_pending(Uuid::new_v4(), Some("a"));
        broker.insert(second);

        let (other, _rx3) = make_pending(Uuid::new_v4(), Some("b"));
        broker.insert(other);

        let infos = broker.pending_for_channel("a");
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].perm_id, first_id, "oldest first");
        assert!(broker.pending_for_channel("c").is_empty());
    }

    #[test]
    fn pending_for_run_finds_the_single_request() {
        let broker = PermissionBroker::new();
        let run_id = Uuid::new_v4();
        let (pending, _rx) = make_pending(run_id, None);
        let perm_id = pending.perm_id;
        broker.insert(pending);

        let info = broker.pending_for_run(&run_id).unwrap();
        assert_eq!(info.perm_id, perm_id);
        assert!(broker.pending_for_run(&Uuid::new_v4()).is_none());
    }
}
