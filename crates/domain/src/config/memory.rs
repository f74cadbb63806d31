use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Directory holding the item store and pinned snapshot
    /// (relative paths resolve against the state dir).
    #[serde(default = "d_memory_dir")]
    pub dir: PathBuf,
    /// Extracted candidates below this importance are dropped.
    #[serde(default = "d_importance_min")]
    pub importance_min: f64,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dir: d_memory_dir(),
            importance_min: d_importance_min(),
            retrieval: RetrievalConfig::default(),
            embeddings: EmbeddingsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Last `R` turn pairs of the requesting origin.
    #[serde(default = "d_8")]
    pub recent_turns_limit: usize,
    /// Related turns pulled in by similarity.
    #[serde(default = "d_4")]
    pub related_turns_limit: usize,
    /// Top-`K` long-term hits in the packet.
    #[serde(default = "d_8")]
    pub structured_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            recent_turns_limit: d_8(),
            related_turns_limit: d_4(),
            structured_limit: d_8(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Items embedded per maintenance sweep.
    #[serde(default = "d_16")]
    pub batch_size: usize,
    /// The vector scan covers only the most recent N embedded items,
    /// bounding recall cost independent of store size.
    #[serde(default = "d_256")]
    pub vector_scan_limit: usize,
    #[serde(default = "d_8")]
    pub vector_top_k: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: d_16(),
            vector_scan_limit: d_256(),
            vector_top_k: d_8(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_memory_dir() -> PathBuf {
    PathBuf::from("memory")
}
fn d_importance_min() -> f64 {
    0.3
}
fn d_true() -> bool {
    true
}
fn d_4() -> usize {
    4
}
fn d_8() -> usize {
    8
}
fn d_16() -> usize {
    16
}
fn d_256() -> usize {
    256
}
