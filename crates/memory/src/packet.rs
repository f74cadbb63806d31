//! The memory packet — the bounded set of pinned + recent + related +
//! top-K long-term items injected into a model turn.

use serde::Serialize;

use crate::retrieval::MemoryHit;

#[derive(Debug, Clone, Serialize)]
pub struct TurnPair {
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryPacket {
    pub pinned: Vec<String>,
    /// Last `R` turn pairs of the requesting origin, oldest first.
    pub recent_turns: Vec<TurnPair>,
    /// Turns from other conversations pulled in by similarity.
    pub related_turns: Vec<TurnPair>,
    /// Top-K long-term hits from the hybrid search.
    pub long_term: Vec<MemoryHit>,
}

impl MemoryPacket {
    pub fn is_empty(&self) -> bool {
        self.pinned.is_empty()
            && self.recent_turns.is_empty()
            && self.related_turns.is_empty()
            && self.long_term.is_empty()
    }

    /// Render as a system-prompt section.
    pub fn render(&self) -> String {
        let mut out = String::new();

        if !self.pinned.is_empty() {
            out.push_str("## Pinned memory\n");
            for text in &self.pinned {
                out.push_str("- ");
                out.push_str(text);
                out.push('\n');
            }
        }

        if !self.long_term.is_empty() {
            out.push_str("## Relevant memory\n");
            for hit in &self.long_term {
                out.push_str("- ");
                out.push_str(&hit.text);
                out.push('\n');
            }
        }

        if !self.related_turns.is_empty() {
            out.push_str("## Related earlier exchanges\n");
            for turn in &self.related_turns {
                out.push_str(&format!("User: {}\nAssistant: {}\n", turn.input, turn.output));
            }
        }

        if !self.recent_turns.is_empty() {
            out.push_str("## Recent conversation\n");
            for turn in &self.recent_turns {
                out.push_str(&format!("User: {}\nAssistant: {}\n", turn.input, turn.output));
            }
        }

        out
    }
}
