/// Shared error type used across all Agent Blob crates.
///
/// The variants mirror the failure taxonomy of the system: protocol faults
/// close connections, policy denials and tool failures are surfaced to the
/// model as structured results, provider faults terminate the run, state
/// conflicts and resource exhaustion are reported to the caller.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed frame, unknown method, or protocol version mismatch.
    #[error("protocol: {0}")]
    Protocol(String),

    /// A permission rule (or a human) denied the operation.
    #[error("permission denied: {0}")]
    PolicyDenied(String),

    /// A tool executed but returned failure, including timeouts.
    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    /// The LLM stream failed unrecoverably.
    #[error("provider: {0}")]
    Provider(String),

    /// Illegal lifecycle transition (e.g. stop after done).
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Queue full, delegation depth exceeded, and similar bounded-resource
    /// rejections. Never fatal to the session.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("config: {0}")]
    Config(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classification tag carried by `run.final` error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Protocol(_) => "protocol",
            Error::PolicyDenied(_) => "policy_denied",
            Error::Tool { .. } => "tool",
            Error::Provider(_) => "provider",
            Error::StateConflict(_) => "state_conflict",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Timeout(_) => "timeout",
            Error::Config(_) => "config",
            Error::Storage(_) => "storage",
            Error::Other(_) => "other",
        }
    }
}
