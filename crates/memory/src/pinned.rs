//! Pinned memory — a small always-loaded set, persisted as one JSON
//! snapshot file. Pins deduplicate by normalized hash; re-pinning the same
//! text bumps `last_seen_at`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ab_domain::Result;

use crate::consolidate::norm_hash;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinnedItem {
    pub item_id: Uuid,
    pub text: String,
    pub norm_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

pub struct PinnedSet {
    path: PathBuf,
    items: RwLock<Vec<PinnedItem>>,
}

/// Result of a pin operation.
pub enum PinOutcome {
    Added(PinnedItem),
    /// Identical text was already pinned; `last_seen_at` was updated.
    Touched(PinnedItem),
}

impl PinnedSet {
    pub fn load(path: &Path) -> Result<Self> {
        let items = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "pinned snapshot unreadable, starting empty");
                Vec::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            items: RwLock::new(items),
        })
    }

    pub fn pin(&self, text: &str) -> Result<PinOutcome> {
        let hash = norm_hash(text);
        let mut items = self.items.write();

        if let Some(existing) = items.iter_mut().find(|i| i.norm_hash == hash) {
            existing.last_seen_at = Utc::now();
            let snapshot = existing.clone();
            self.persist(&items)?;
            return Ok(PinOutcome::Touched(snapshot));
        }

        let item = PinnedItem {
            item_id: Uuid::new_v4(),
            text: text.to_string(),
            norm_hash: hash,
            created_at: Utc::now(),
            last_seen_at: Utc::now(),
        };
        items.push(item.clone());
        self.persist(&items)?;
        Ok(PinOutcome::Added(item))
    }

    pub fn remove(&self, item_id: &Uuid) -> Result<bool> {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|i| i.item_id != *item_id);
        let removed = items.len() < before;
        if removed {
            self.persist(&items)?;
        }
        Ok(removed)
    }

    /// All pinned items (always loaded into every packet).
    pub fn all(&self) -> Vec<PinnedItem> {
        self.items.read().clone()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Atomic snapshot write (tmp + rename).
    fn persist(&self, items: &[PinnedItem]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(items)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_twice_touches_not_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let set = PinnedSet::load(&dir.path().join("pinned.json")).unwrap();

        let first = set.pin("Telegram client is an adapter frontend.").unwrap();
        assert!(matches!(first, PinOutcome::Added(_)));
        assert_eq!(set.len(), 1);

        let second = set.pin("Telegram client is an adapter frontend.").unwrap();
        match second {
            PinOutcome::Touched(item) => {
                assert_eq!(set.len(), 1);
                assert!(item.last_seen_at >= item.created_at);
            }
            PinOutcome::Added(_) => panic!("identical text must not add a second pin"),
        }
    }

    #[test]
    fn pins_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pinned.json");
        {
            let set = PinnedSet::load(&path).unwrap();
            set.pin("persisted pin").unwrap();
        }
        let set = PinnedSet::load(&path).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.all()[0].text, "persisted pin");
    }

    #[test]
    fn remove_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let set = PinnedSet::load(&dir.path().join("pinned.json")).unwrap();
        let PinOutcome::Added(item) = set.pin("to remove").unwrap() else {
            panic!("expected Added");
        };
        assert!(set.remove(&item.item_id).unwrap());
        assert!(!set.remove(&item.item_id).unwrap());
        assert!(set.is_empty());
    }
}
