use std::sync::Arc;

use chrono::{DateTime, Utc};

use ab_broker::{PermissionBroker, PolicyEngine};
use ab_domain::config::Config;
use ab_domain::provider::LlmProvider;
use ab_eventlog::EventLog;
use ab_memory::MemoryService;
use ab_tools::ToolRegistry;

use crate::channels::ChannelRegistry;
use crate::runtime::cancel::CancelMap;
use crate::runtime::runs::RunStore;
use crate::runtime::scheduler::ScheduleStore;
use crate::runtime::workers::WorkerManager;
use crate::sessions::SessionManager;

/// Shared application state handed to every task and handler.
///
/// Fields are grouped by concern:
/// - **Core services** — config, event log, memory, policy, tools, LLM
/// - **Gateway** — channels, sessions
/// - **Runtime** — runs, cancellation, workers, schedules
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub started_at: DateTime<Utc>,
    pub log: Arc<EventLog>,
    pub memory: Arc<MemoryService>,
    pub policy: Arc<PolicyEngine>,
    pub broker: Arc<PermissionBroker>,
    pub tools: Arc<ToolRegistry>,
    pub provider: Arc<dyn LlmProvider>,

    // ── Gateway ───────────────────────────────────────────────────────
    pub channels: Arc<ChannelRegistry>,
    pub sessions: Arc<SessionManager>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub runs: Arc<RunStore>,
    pub cancels: Arc<CancelMap>,
    pub workers: Arc<WorkerManager>,
    pub schedules: Arc<ScheduleStore>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 of the gateway bearer token (read once at startup).
    /// `None` = local dev, handshake unauthenticated.
    pub gateway_token_hash: Option<Vec<u8>>,
}

impl AppState {
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}
