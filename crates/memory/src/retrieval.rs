//! Hybrid retrieval — a lexical BM25 scan over the token index and a
//! vector scan over the most recent embedded items, unioned and re-scored
//! with a recency bias. Recall cost is bounded independent of store size.

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use ab_domain::Result;

use crate::consolidate::cosine;
use crate::store::MemoryStore;

/// Blend weights: `ALPHA·bm25 + (1-ALPHA)·cosine + BETA·recency`.
const ALPHA: f64 = 0.55;
const BETA: f64 = 0.15;

/// BM25 shape parameters (standard Okapi values).
const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// Recency half-life in days for the bias term.
const RECENCY_HALF_LIFE_DAYS: f64 = 14.0;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct MemoryHit {
    pub item_id: Uuid,
    pub text: String,
    pub importance: f64,
    pub score: f64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tokenizer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lowercase alphanumeric words, minimum 2 characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 2)
        .map(String::from)
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Search
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run the hybrid search. `query_embedding` is `None` when embeddings are
/// disabled or the embedder is unavailable, in which case recall is
/// lexical only.
pub fn search(
    store: &MemoryStore,
    query: &str,
    query_embedding: Option<&[f32]>,
    vector_scan_limit: usize,
    limit: usize,
) -> Result<Vec<MemoryHit>> {
    let total_docs = store.count()?;
    if total_docs == 0 {
        return Ok(Vec::new());
    }

    let query_tokens = tokenize(query);

    // ── Lexical candidates (BM25) ─────────────────────────────────
    let mut bm25: HashMap<Uuid, f64> = HashMap::new();
    if !query_tokens.is_empty() {
        let postings = store.postings(&query_tokens)?;
        let mut df: HashMap<&str, usize> = HashMap::new();
        for token in &query_tokens {
            df.insert(token.as_str(), store.doc_frequency(token)?);
        }
        for (item_id, token, tf) in &postings {
            let n = *df.get(token.as_str()).unwrap_or(&0);
            if n == 0 {
                continue;
            }
            let idf = (((total_docs as f64 - n as f64 + 0.5) / (n as f64 + 0.5)) + 1.0).ln();
            // Length normalization is skipped — items are short facts of
            // comparable size, so the tf saturation term dominates.
            let tf = f64::from(*tf);
            let score = idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * BM25_B);
            *bm25.entry(*item_id).or_insert(0.0) += score;
        }
    }

    // ── Vector candidates (bounded scan) ──────────────────────────
    let mut cos: HashMap<Uuid, f64> = HashMap::new();
    if let Some(qe) = query_embedding {
        for item in store.recent_embedded(vector_scan_limit)? {
            if let Some(e) = &item.embedding {
                let sim = cosine(qe, e);
                if sim > 0.0 {
                    cos.insert(item.item_id, sim);
                }
            }
        }
    }

    // ── Union + blend ─────────────────────────────────────────────
    let bm25_max = bm25.values().cloned().fold(0.0f64, f64::max);
    let mut candidates: Vec<Uuid> = bm25.keys().chain(cos.keys()).cloned().collect();
    candidates.sort();
    candidates.dedup();

    let now = Utc::now();
    let mut hits = Vec::with_capacity(candidates.len());
    for item_id in candidates {
        let Some(item) = store.get(&item_id)? else {
            continue;
        };
        let lexical = if bm25_max > 0.0 {
            bm25.get(&item_id).copied().unwrap_or(0.0) / bm25_max
        } else {
            0.0
        };
        let vector = cos.get(&item_id).copied().unwrap_or(0.0);
        let age_days = (now - item.last_seen_at).num_seconds().max(0) as f64 / 86_400.0;
        let recency = 0.5f64.powf(age_days / RECENCY_HALF_LIFE_DAYS);

        let score = ALPHA * lexical + (1.0 - ALPHA) * vector + BETA * recency;
        hits.push(MemoryHit {
            item_id,
            text: item.text,
            importance: item.importance,
            score,
        });
    }

    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    Ok(hits)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidate::norm_hash;
    use crate::store::MemoryItem;

    fn insert(store: &MemoryStore, text: &str, embedding: Option<Vec<f32>>) -> Uuid {
        let item = MemoryItem {
            item_id: Uuid::new_v4(),
            text: text.into(),
            norm_hash: norm_hash(text),
            importance: 0.5,
            created_at: Utc::now(),
            last_seen_at: Utc::now(),
            embedding,
        };
        store.insert(&item).unwrap();
        item.item_id
    }

    #[test]
    fn tokenize_skips_short_words() {
        assert_eq!(tokenize("I am a bot"), vec!["am", "bot"]);
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn lexical_search_ranks_matching_items() {
        let store = MemoryStore::open_in_memory().unwrap();
        let wanted = insert(&store, "the telegram adapter polls for updates", None);
        insert(&store, "the scheduler fires cron jobs", None);

        let hits = search(&store, "telegram updates", None, 256, 8).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].item_id, wanted);
    }

    #[test]
    fn empty_store_returns_nothing() {
        let store = MemoryStore::open_in_memory().unwrap();
        assert!(search(&store, "anything", None, 256, 8).unwrap().is_empty());
    }

    #[test]
    fn vector_candidates_join_the_union() {
        let store = MemoryStore::open_in_memory().unwrap();
        // Shares no tokens with the query, but is cosine-close.
        let vec_only = insert(&store, "likes dark colour schemes", Some(vec![1.0, 0.0]));
        insert(&store, "unrelated lexical item", Some(vec![0.0, 1.0]));

        let hits = search(&store, "preference themes", Some(&[1.0, 0.0]), 256, 8).unwrap();
        assert!(hits.iter().any(|h| h.item_id == vec_only));
        let top = &hits[0];
        assert_eq!(top.item_id, vec_only);
    }

    #[test]
    fn unembedded_items_participate_in_lexical_recall_only() {
        let store = MemoryStore::open_in_memory().unwrap();
        let lexical = insert(&store, "gateway port is 7420", None);

        let hits = search(&store, "gateway port", Some(&[1.0, 0.0]), 256, 8).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item_id, lexical);
    }

    #[test]
    fn limit_is_respected() {
        let store = MemoryStore::open_in_memory().unwrap();
        for i in 0..10 {
            insert(&store, &format!("gateway fact number {i}"), None);
        }
        let hits = search(&store, "gateway", None, 256, 3).unwrap();
        assert_eq!(hits.len(), 3);
    }
}
