//! Lazy embedding backlog — items inserted without an embedding are
//! batched by the maintenance sweep and embedded in groups of `B`.
//! Failures back off exponentially and never block retrieval; unembedded
//! items simply stay lexical-only.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

use ab_domain::provider::EmbeddingProvider;

use crate::store::MemoryStore;

const MAX_BACKOFF_MINUTES: i64 = 60;

struct BacklogState {
    consecutive_failures: u32,
    cooldown_until: Option<DateTime<Utc>>,
}

pub struct EmbeddingBacklog {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    state: Mutex<BacklogState>,
}

/// Backoff duration in minutes: 2^(failures - 1), capped at one hour.
fn backoff_minutes(consecutive_failures: u32) -> i64 {
    if consecutive_failures == 0 {
        return 0;
    }
    let exp = (consecutive_failures - 1).min(10);
    (1i64 << exp).min(MAX_BACKOFF_MINUTES)
}

impl EmbeddingBacklog {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, batch_size: usize) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
            state: Mutex::new(BacklogState {
                consecutive_failures: 0,
                cooldown_until: None,
            }),
        }
    }

    /// Embed one batch of backlogged items. Returns how many were
    /// embedded (0 while cooling down or when the backlog is empty).
    pub async fn drain_once(&self, store: &MemoryStore) -> usize {
        {
            let state = self.state.lock();
            if let Some(until) = state.cooldown_until {
                if Utc::now() < until {
                    return 0;
                }
            }
        }

        let pending = match store.items_without_embedding(self.batch_size) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(error = %e, "embedding backlog query failed");
                return 0;
            }
        };
        if pending.is_empty() {
            return 0;
        }

        let texts: Vec<String> = pending.iter().map(|i| i.text.clone()).collect();
        match self.provider.embed(&texts).await {
            Ok(vectors) => {
                let mut embedded = 0;
                for (item, vector) in pending.iter().zip(vectors) {
                    match store.set_embedding(&item.item_id, &vector) {
                        Ok(true) => embedded += 1,
                        Ok(false) => {} // item deleted meanwhile
                        Err(e) => {
                            tracing::warn!(error = %e, item_id = %item.item_id, "failed to store embedding");
                        }
                    }
                }
                let mut state = self.state.lock();
                state.consecutive_failures = 0;
                state.cooldown_until = None;
                tracing::debug!(embedded, "embedding backlog batch complete");
                embedded
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.consecutive_failures += 1;
                let minutes = backoff_minutes(state.consecutive_failures);
                state.cooldown_until = Some(Utc::now() + Duration::minutes(minutes));
                tracing::warn!(
                    error = %e,
                    failures = state.consecutive_failures,
                    backoff_minutes = minutes,
                    "embedding batch failed, backing off"
                );
                0
            }
        }
    }
}
