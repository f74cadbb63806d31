//! Long-term memory: pinned + structured items with hybrid retrieval and
//! post-run consolidation.
//!
//! The item store is SQLite (`memory_items` plus a token index); pinned
//! items live in a small always-loaded JSON snapshot. Retrieval unions a
//! lexical BM25 scan with a bounded vector scan and re-scores with a
//! recency bias. Consolidation deduplicates extracted facts by normalized
//! hash, then by cosine near-duplicate merge.

mod consolidate;
mod embed;
mod extract;
mod packet;
mod pinned;
mod retrieval;
mod service;
mod store;

pub use consolidate::{cosine, normalize_text, norm_hash};
pub use embed::EmbeddingBacklog;
pub use extract::{extract_facts, FactCandidate};
pub use packet::{MemoryPacket, TurnPair};
pub use pinned::{PinnedItem, PinnedSet};
pub use retrieval::MemoryHit;
pub use service::{IngestReport, MemoryChange, MemoryService};
pub use store::{MemoryItem, MemoryStore};
