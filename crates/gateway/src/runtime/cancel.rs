//! Per-run cancellation tokens with parent→child fan-out.
//!
//! Each executing run holds a `CancelToken`. `stop` sets it; the executor
//! observes it only at suspension points (chunk boundaries, permission
//! waits, tool returns). Worker runs register in their parent's group so
//! stopping a parent cascades.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

/// A cancellation token checked by the run loop.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Tracks active tokens per run, with groups for cascading cancellation.
pub struct CancelMap {
    tokens: Mutex<HashMap<Uuid, CancelToken>>,
    /// parent run → child runs.
    groups: Mutex<HashMap<Uuid, HashSet<Uuid>>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, run_id: Uuid) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(run_id, token.clone());
        token
    }

    /// Cancel a run and all children in its group. Returns true when a
    /// token was found (false = the run was not executing).
    pub fn cancel(&self, run_id: &Uuid) -> bool {
        let found = if let Some(token) = self.tokens.lock().get(run_id) {
            token.cancel();
            true
        } else {
            false
        };

        let children: Vec<Uuid> = self
            .groups
            .lock()
            .get(run_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for child in children {
            // Recursive: a worker's own workers stop too.
            self.cancel(&child);
        }

        found
    }

    pub fn remove(&self, run_id: &Uuid) {
        self.tokens.lock().remove(run_id);
        self.groups.lock().remove(run_id);
    }

    pub fn is_running(&self, run_id: &Uuid) -> bool {
        self.tokens.lock().contains_key(run_id)
    }

    pub fn add_to_group(&self, parent: Uuid, child: Uuid) {
        self.groups.lock().entry(parent).or_default().insert(child);
    }

    pub fn remove_from_group(&self, parent: &Uuid, child: &Uuid) {
        let mut groups = self.groups.lock();
        if let Some(children) = groups.get_mut(parent) {
            children.remove(child);
            if children.is_empty() {
                groups.remove(parent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        // Clones share state.
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let map = CancelMap::new();
        let run = Uuid::new_v4();
        let token = map.register(run);

        assert!(map.cancel(&run));
        assert!(map.cancel(&run), "second cancel finds the same token");
        assert!(token.is_cancelled());

        map.remove(&run);
        assert!(!map.cancel(&run));
    }

    #[test]
    fn cascade_reaches_grandchildren() {
        let map = CancelMap::new();
        let parent = Uuid::new_v4();
        let child = Uuid::new_v4();
        let grandchild = Uuid::new_v4();

        let parent_token = map.register(parent);
        let child_token = map.register(child);
        let grandchild_token = map.register(grandchild);
        map.add_to_group(parent, child);
        map.add_to_group(child, grandchild);

        map.cancel(&parent);
        assert!(parent_token.is_cancelled());
        assert!(child_token.is_cancelled());
        assert!(grandchild_token.is_cancelled());
    }

    #[test]
    fn removed_child_is_not_cancelled() {
        let map = CancelMap::new();
        let parent = Uuid::new_v4();
        let child = Uuid::new_v4();
        let _p = map.register(parent);
        let child_token = map.register(child);

        map.add_to_group(parent, child);
        map.remove_from_group(&parent, &child);
        map.cancel(&parent);
        assert!(!child_token.is_cancelled());
    }

    #[test]
    fn is_running_tracks_registration() {
        let map = CancelMap::new();
        let run = Uuid::new_v4();
        assert!(!map.is_running(&run));
        map.register(run);
        assert!(map.is_running(&run));
        map.remove(&run);
        assert!(!map.is_running(&run));
    }
}
