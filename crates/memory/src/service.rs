//! The memory service facade — packet building, post-run ingestion with
//! consolidation, search, and the maintenance hooks.
//!
//! The service is storage-pure: it returns [`MemoryChange`] records and
//! leaves event emission to the gateway, which owns the event log.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use ab_domain::config::MemoryConfig;
use ab_domain::provider::{EmbeddingProvider, LlmProvider};
use ab_domain::Result;

use crate::consolidate::{cosine, norm_hash};
use crate::embed::EmbeddingBacklog;
use crate::extract::{extract_facts, FactCandidate};
use crate::packet::{MemoryPacket, TurnPair};
use crate::pinned::{PinOutcome, PinnedSet};
use crate::retrieval::{self, tokenize, MemoryHit};
use crate::store::{MemoryItem, MemoryStore, TurnRecord};

/// Cosine threshold above which two items are considered near-duplicates.
const TAU_SIM: f64 = 0.92;
/// Neighbours checked in the near-duplicate pass.
const NEAR_DUP_TOP_M: usize = 8;
/// Window of recent turns scanned for related-turn candidates.
const RELATED_SCAN_WINDOW: usize = 200;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Change records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A store mutation the caller turns into a `memory.*` event.
#[derive(Debug, Clone)]
pub enum MemoryChange {
    Added { item_id: Uuid, text: String },
    Modified { item_id: Uuid },
    Removed { item_id: Uuid },
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub changes: Vec<MemoryChange>,
    /// True when this run was already ingested (the call was a no-op).
    pub already_ingested: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MemoryService {
    store: MemoryStore,
    pinned: PinnedSet,
    config: MemoryConfig,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    backlog: Option<EmbeddingBacklog>,
}

impl MemoryService {
    /// Open the service under `dir` (item store + pinned snapshot).
    pub fn open(
        dir: &Path,
        config: MemoryConfig,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let store = MemoryStore::open(&dir.join("memory.db"))?;
        let pinned = PinnedSet::load(&dir.join("pinned.json"))?;
        let embedder = if config.embeddings.enabled {
            embedder
        } else {
            None
        };
        let backlog = embedder
            .clone()
            .map(|e| EmbeddingBacklog::new(e, config.embeddings.batch_size));
        Ok(Self {
            store,
            pinned,
            config,
            embedder,
            backlog,
        })
    }

    /// In-memory service for tests.
    pub fn open_ephemeral(
        config: MemoryConfig,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        pinned_path: &Path,
    ) -> Result<Self> {
        let store = MemoryStore::open_in_memory()?;
        let pinned = PinnedSet::load(pinned_path)?;
        let backlog = embedder
            .clone()
            .map(|e| EmbeddingBacklog::new(e, config.embeddings.batch_size));
        Ok(Self {
            store,
            pinned,
            config,
            embedder,
            backlog,
        })
    }

    // ── packet building ────────────────────────────────────────────

    /// Assemble the bounded context packet for a run: pinned items, the
    /// origin's recent turns, related turns by similarity, and top-K
    /// long-term hits for the query.
    pub async fn build_packet(&self, origin: &str, query: &str) -> MemoryPacket {
        let retrieval = &self.config.retrieval;

        let pinned = self.pinned.all().into_iter().map(|p| p.text).collect();

        let recent = self
            .store
            .recent_turns(origin, retrieval.recent_turns_limit)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "recent turns lookup failed");
                Vec::new()
            });
        let recent_inputs: Vec<String> = recent.iter().map(|t| t.input.clone()).collect();
        let recent_turns = recent
            .into_iter()
            .map(|t| TurnPair {
                input: t.input,
                output: t.output,
            })
            .collect();

        let related_turns = self.related_turns(origin, query, &recent_inputs);

        let long_term = self
            .search(query, retrieval.structured_limit)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "long-term retrieval failed");
                Vec::new()
            });

        MemoryPacket {
            pinned,
            recent_turns,
            related_turns,
            long_term,
        }
    }

    /// Token-overlap scored turns from other conversations.
    fn related_turns(&self, origin: &str, query: &str, exclude_inputs: &[String]) -> Vec<TurnPair> {
        let limit = self.config.retrieval.related_turns_limit;
        if limit == 0 {
            return Vec::new();
        }
        let query_tokens: std::collections::HashSet<String> =
            tokenize(query).into_iter().collect();
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let candidates = match self.store.latest_turns(RELATED_SCAN_WINDOW) {
            Ok(turns) => turns,
            Err(e) => {
                tracing::warn!(error = %e, "related turns scan failed");
                return Vec::new();
            }
        };

        let mut scored: Vec<(usize, TurnRecord)> = candidates
            .into_iter()
            .filter(|t| t.origin != origin && !exclude_inputs.contains(&t.input))
            .map(|t| {
                let overlap = tokenize(&t.input)
                    .into_iter()
                    .filter(|tok| query_tokens.contains(tok))
                    .count();
                (overlap, t)
            })
            .filter(|(overlap, _)| *overlap > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(limit)
            .map(|(_, t)| TurnPair {
                input: t.input,
                output: t.output,
            })
            .collect()
    }

    // ── ingestion ──────────────────────────────────────────────────

    /// Ingest a completed run: record the turn pair, extract durable
    /// facts, and consolidate them into the store. A second call for the
    /// same `run_id` is a no-op.
    pub async fn ingest(
        &self,
        run_id: &Uuid,
        origin: &str,
        input: &str,
        output: &str,
        extractor: Option<&dyn LlmProvider>,
    ) -> Result<IngestReport> {
        if !self.store.mark_ingested(run_id)? {
            return Ok(IngestReport {
                changes: Vec::new(),
                already_ingested: true,
            });
        }

        self.store.record_turn(&TurnRecord {
            origin: origin.to_string(),
            input: input.to_string(),
            output: output.to_string(),
            created_at: Utc::now(),
        })?;

        let candidates = match extractor {
            Some(provider) => extract_facts(provider, input, output).await,
            None => Vec::new(),
        };

        let mut changes = Vec::new();
        for candidate in candidates {
            if candidate.importance < self.config.importance_min {
                continue;
            }
            if let Some(change) = self.consolidate(&candidate).await? {
                changes.push(change);
            }
        }

        tracing::debug!(
            run_id = %run_id,
            changes = changes.len(),
            "run ingested into memory"
        );
        Ok(IngestReport {
            changes,
            already_ingested: false,
        })
    }

    /// Consolidate one candidate: exact-hash dedup, then near-duplicate
    /// merge, then insert.
    async fn consolidate(&self, candidate: &FactCandidate) -> Result<Option<MemoryChange>> {
        let hash = norm_hash(&candidate.text);

        // Exact-hash hit: update last_seen_at.
        if let Some(existing) = self.store.find_by_hash(&hash)? {
            self.store.touch(&existing.item_id, Utc::now())?;
            return Ok(Some(MemoryChange::Modified {
                item_id: existing.item_id,
            }));
        }

        // Near-duplicate check needs a candidate embedding; without one
        // (embedder absent or down) we fall through to a plain insert.
        let embedding = self.embed_one(&candidate.text).await;
        if let Some(qe) = &embedding {
            let neighbours = self
                .store
                .recent_embedded(self.config.embeddings.vector_scan_limit)?;
            let mut best: Option<(f64, MemoryItem)> = None;
            for item in neighbours.into_iter().take(NEAR_DUP_TOP_M.max(
                self.config.embeddings.vector_top_k,
            )) {
                if let Some(e) = &item.embedding {
                    let sim = cosine(qe, e);
                    if sim >= TAU_SIM && best.as_ref().map_or(true, |(s, _)| sim > *s) {
                        best = Some((sim, item));
                    }
                }
            }
            if let Some((_, twin)) = best {
                // Merge: keep the longer text, take the max importance.
                let text = if candidate.text.len() > twin.text.len() {
                    candidate.text.clone()
                } else {
                    twin.text.clone()
                };
                let importance = candidate.importance.max(twin.importance);
                self.store.update_merged(&twin.item_id, &text, importance)?;
                return Ok(Some(MemoryChange::Modified {
                    item_id: twin.item_id,
                }));
            }
        }

        let item = MemoryItem {
            item_id: Uuid::new_v4(),
            text: candidate.text.clone(),
            norm_hash: hash,
            importance: candidate.importance,
            created_at: Utc::now(),
            last_seen_at: Utc::now(),
            embedding,
        };
        self.store.insert(&item)?;
        Ok(Some(MemoryChange::Added {
            item_id: item.item_id,
            text: item.text,
        }))
    }

    /// Embed a single text, degrading to `None` on any failure.
    async fn embed_one(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(&[text.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => Some(vectors.remove(0)),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "inline embedding failed, deferring to backlog");
                None
            }
        }
    }

    // ── queries & mutations ────────────────────────────────────────

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryHit>> {
        let query_embedding = self.embed_one(query).await;
        retrieval::search(
            &self.store,
            query,
            query_embedding.as_deref(),
            self.config.embeddings.vector_scan_limit,
            limit,
        )
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<MemoryItem>> {
        self.store.list_recent(limit)
    }

    /// Delete by id from the item store or the pinned set.
    pub fn delete(&self, item_id: &Uuid) -> Result<Option<MemoryChange>> {
        if self.store.delete(item_id)? || self.pinned.remove(item_id)? {
            return Ok(Some(MemoryChange::Removed { item_id: *item_id }));
        }
        Ok(None)
    }

    /// Pin a text into the always-loaded set.
    pub fn pin(&self, text: &str) -> Result<MemoryChange> {
        match self.pinned.pin(text)? {
            PinOutcome::Added(item) => Ok(MemoryChange::Added {
                item_id: item.item_id,
                text: item.text,
            }),
            PinOutcome::Touched(item) => Ok(MemoryChange::Modified {
                item_id: item.item_id,
            }),
        }
    }

    pub fn pinned_items(&self) -> Vec<crate::pinned::PinnedItem> {
        self.pinned.all()
    }

    pub fn item_count(&self) -> usize {
        self.store.count().unwrap_or(0)
    }

    /// Maintenance hook: embed one backlog batch.
    pub async fn run_maintenance(&self) -> usize {
        match &self.backlog {
            Some(backlog) => backlog.drain_once(&self.store).await,
            None => 0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
