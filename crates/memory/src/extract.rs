//! Fact extraction — asks the LLM to distill durable facts from a finished
//! run's input and output. Failures degrade to "no facts", never to an
//! error that would block run finalization.

use futures_util::StreamExt;
use serde::Deserialize;

use ab_domain::provider::{ChatRequest, LlmProvider};
use ab_domain::stream::StreamEvent;
use ab_domain::tool::Message;

const EXTRACT_SYSTEM_PROMPT: &str = "You distill durable facts from a conversation turn. \
Return a JSON array of objects with fields \"text\" (one self-contained fact) and \
\"importance\" (0.0 to 1.0). Only include facts worth remembering across sessions: \
preferences, identities, standing instructions, project details. Return [] when \
nothing qualifies. Return only the JSON array.";

#[derive(Debug, Clone, Deserialize)]
pub struct FactCandidate {
    pub text: String,
    #[serde(default = "default_importance")]
    pub importance: f64,
}

fn default_importance() -> f64 {
    0.5
}

/// Run the extractor over one turn. Returns an empty list on any provider
/// or parse failure.
pub async fn extract_facts(
    provider: &dyn LlmProvider,
    input: &str,
    output: &str,
) -> Vec<FactCandidate> {
    let req = ChatRequest {
        messages: vec![
            Message::system(EXTRACT_SYSTEM_PROMPT),
            Message::user(format!("User: {input}\n---\nAssistant: {output}")),
        ],
        tools: Vec::new(),
        temperature: Some(0.0),
        max_tokens: Some(1024),
    };

    let mut stream = match provider.chat_stream(req).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "fact extraction stream failed to open");
            return Vec::new();
        }
    };

    let mut buf = String::new();
    while let Some(event) = stream.next().await {
        match event {
            Ok(StreamEvent::Token { text }) => buf.push_str(&text),
            Ok(StreamEvent::Done { .. }) => break,
            Ok(StreamEvent::Error { message }) => {
                tracing::warn!(error = %message, "fact extraction stream error");
                return Vec::new();
            }
            Ok(StreamEvent::ToolCall { .. }) => {}
            Err(e) => {
                tracing::warn!(error = %e, "fact extraction stream error");
                return Vec::new();
            }
        }
    }

    parse_candidates(&buf)
}

/// Parse the model's reply, tolerating prose around the JSON array.
fn parse_candidates(raw: &str) -> Vec<FactCandidate> {
    let trimmed = raw.trim();
    let json_slice = match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => return Vec::new(),
    };
    match serde_json::from_str::<Vec<FactCandidate>>(json_slice) {
        Ok(candidates) => candidates
            .into_iter()
            .filter(|c| !c.text.trim().is_empty())
            .map(|mut c| {
                c.importance = c.importance.clamp(0.0, 1.0);
                c
            })
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, "extractor reply was not a fact array");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_array() {
        let raw = r#"[{"text":"user lives in Lyon","importance":0.8}]"#;
        let facts = parse_candidates(raw);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].text, "user lives in Lyon");
        assert!((facts[0].importance - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn tolerates_surrounding_prose() {
        let raw = "Here are the facts:\n[{\"text\":\"x\"}]\nDone.";
        let facts = parse_candidates(raw);
        assert_eq!(facts.len(), 1);
        assert!((facts[0].importance - 0.5).abs() < f64::EPSILON, "default importance");
    }

    #[test]
    fn clamps_importance() {
        let raw = r#"[{"text":"a","importance":7.0},{"text":"b","importance":-1.0}]"#;
        let facts = parse_candidates(raw);
        assert!((facts[0].importance - 1.0).abs() < f64::EPSILON);
        assert!(facts[1].importance.abs() < f64::EPSILON);
    }

    #[test]
    fn garbage_yields_empty() {
        assert!(parse_candidates("no json here").is_empty());
        assert!(parse_candidates("").is_empty());
        assert!(parse_candidates("[not valid").is_empty());
    }

    #[test]
    fn blank_facts_are_dropped() {
        let raw = r#"[{"text":"  "},{"text":"real fact"}]"#;
        let facts = parse_candidates(raw);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].text, "real fact");
    }
}
