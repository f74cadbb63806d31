//! End-to-end runtime scenarios: permission ask/allow, shell-write
//! reclassification, stop during streaming, session FIFO ordering,
//! channel isolation, scheduler restart behaviour, and worker delegation
//! — all against scripted providers.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use ab_broker::{PermissionBroker, PolicyEngine};
use ab_domain::config::{Config, PermissionRule};
use ab_domain::event::{EventFilter, PermissionDecision};
use ab_domain::provider::{ChatRequest, LlmProvider};
use ab_domain::run::{RunKind, RunOrigin};
use ab_domain::stream::{BoxStream, StreamEvent, Usage};
use ab_eventlog::EventLog;
use ab_gateway::channels::{ChannelRegistry, ConnectedChannel};
use ab_gateway::runtime::cancel::CancelMap;
use ab_gateway::runtime::runs::RunStore;
use ab_gateway::runtime::scheduler::{self, ScheduleKind, ScheduleStore};
use ab_gateway::runtime::workers::WorkerManager;
use ab_gateway::runtime;
use ab_gateway::sessions::{Admission, SessionManager};
use ab_gateway::state::AppState;
use ab_memory::MemoryService;
use ab_protocol::Frame;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pops one scripted turn per `chat_stream` call. Memory-extraction
/// requests (recognized by their system prompt) get an empty reply so
/// post-run ingestion never consumes a scripted turn.
struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<StreamEvent>>>,
    token_delay: Duration,
}

impl ScriptedProvider {
    fn new(turns: Vec<Vec<StreamEvent>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            token_delay: Duration::ZERO,
        })
    }

    fn with_delay(turns: Vec<Vec<StreamEvent>>, token_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            token_delay,
        })
    }
}

fn done() -> StreamEvent {
    StreamEvent::Done {
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        finish_reason: Some("stop".into()),
    }
}

fn token(text: &str) -> StreamEvent {
    StreamEvent::Token { text: text.into() }
}

fn tool_call(call_id: &str, tool: &str, arguments: Value) -> StreamEvent {
    StreamEvent::ToolCall {
        call_id: call_id.into(),
        tool_name: tool.into(),
        arguments,
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> ab_domain::Result<BoxStream<'static, ab_domain::Result<StreamEvent>>> {
        let is_extraction = req
            .messages
            .first()
            .map(|m| m.content.extract_all_text().contains("distill durable facts"))
            .unwrap_or(false);

        let turn = if is_extraction {
            vec![token("[]"), done()]
        } else {
            self.turns
                .lock()
                .pop_front()
                .ok_or_else(|| ab_domain::Error::Provider("script exhausted".into()))?
        };

        let delay = self.token_delay;
        Ok(Box::pin(async_stream::stream! {
            for event in turn {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(event);
            }
        }))
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_state(dir: &Path, config: Config, provider: Arc<dyn LlmProvider>) -> AppState {
    let config = Arc::new(config);
    AppState {
        started_at: chrono::Utc::now(),
        log: Arc::new(EventLog::open(&dir.join("events"), config.logs.events.clone()).unwrap()),
        memory: Arc::new(
            MemoryService::open(&dir.join("memory"), config.memory.clone(), None).unwrap(),
        ),
        policy: Arc::new(PolicyEngine::new(&config.permissions).unwrap()),
        broker: Arc::new(PermissionBroker::new()),
        tools: Arc::new(ab_tools::builtin_registry(&config.tools)),
        provider,
        channels: Arc::new(ChannelRegistry::new()),
        sessions: Arc::new(SessionManager::new(config.server.queue_soft_cap)),
        runs: Arc::new(RunStore::new(dir)),
        cancels: Arc::new(CancelMap::new()),
        workers: Arc::new(WorkerManager::new()),
        schedules: Arc::new(ScheduleStore::load(dir).unwrap()),
        gateway_token_hash: None,
        config,
    }
}

fn register_channel(state: &AppState, channel_id: &str) -> mpsc::Receiver<Frame> {
    let (tx, rx) = mpsc::channel(1024);
    state.channels.register(ConnectedChannel {
        channel_id: channel_id.into(),
        client: channel_id.into(),
        connected_at: chrono::Utc::now(),
        sink: tx,
    });
    rx
}

fn admit_on(state: &AppState, channel_id: &str, text: &str) -> (Uuid, Admission) {
    runtime::admit(
        state,
        &format!("chan:{channel_id}"),
        RunOrigin::Channel {
            channel_id: channel_id.into(),
        },
        RunKind::Interactive,
        text,
        Vec::new(),
    )
    .unwrap()
}

/// Receive frames until a `run.final` for `run_id`, returning
/// `(event_name, payload)` pairs in arrival order.
async fn collect_until_final(rx: &mut mpsc::Receiver<Frame>, run_id: &Uuid) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    let deadline = Duration::from_secs(10);
    loop {
        let frame = tokio::time::timeout(deadline, rx.recv())
            .await
            .expect("timed out waiting for run.final")
            .expect("channel closed before run.final");
        if let Frame::Event { event, payload, .. } = frame {
            let frame_run: Option<Uuid> = payload
                .get("run_id")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok());
            let is_final = event == "run.final" && frame_run == Some(*run_id);
            out.push((event, payload));
            if is_final {
                return out;
            }
        }
    }
}

/// Wait for the first event of a given kind.
async fn wait_for_event(rx: &mut mpsc::Receiver<Frame>, name: &str) -> Value {
    let deadline = Duration::from_secs(10);
    loop {
        let frame = tokio::time::timeout(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
            .expect("channel closed");
        if let Frame::Event { event, payload, .. } = frame {
            if event == name {
                return payload;
            }
        }
    }
}

fn names(events: &[(String, Value)]) -> Vec<&str> {
    events.iter().map(|(name, _)| name.as_str()).collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 1 — permission ask/allow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn permission_ask_allow_runs_the_tool() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![
        vec![
            tool_call("tc_1", "shell_run", serde_json::json!({"command": "echo hi"})),
            done(),
        ],
        vec![token("the command printed hi"), done()],
    ]);
    let state = build_state(dir.path(), Config::default(), provider);
    let mut rx = register_channel(&state, "cli");

    let (run_id, admission) = admit_on(&state, "cli", "run echo hi in shell");
    assert_eq!(admission, Admission::Started);

    // Default policy keeps shell.run on ask.
    let request = wait_for_event(&mut rx, "permission.request").await;
    assert_eq!(request["capability"], "shell.run");
    assert_eq!(request["preview"], "echo hi");
    let perm_id: Uuid = request["perm_id"].as_str().unwrap().parse().unwrap();

    assert!(runtime::respond_permission(
        &state,
        &perm_id,
        PermissionDecision::Allow
    ));

    let events = collect_until_final(&mut rx, &run_id).await;
    let seen = names(&events);
    let call_pos = seen.iter().position(|n| *n == "tool.call").unwrap();
    let result_pos = seen.iter().position(|n| *n == "tool.result").unwrap();
    let token_pos = seen.iter().position(|n| *n == "token").unwrap();
    assert!(call_pos < result_pos);
    assert!(result_pos < token_pos);

    let (_, result) = &events[result_pos];
    let body: Value = serde_json::from_str(result["content"].as_str().unwrap()).unwrap();
    assert_eq!(body["stdout"], "hi\n");
    assert_eq!(body["code"], 0);

    let (_, fin) = events.last().unwrap();
    assert_eq!(fin["state"], "done");

    // Invariant: exactly one run.final in the log; global seq strictly
    // increasing; per-run seq gapless from 1.
    let logged = state.log.scan(&EventFilter::for_run(run_id), 0).unwrap();
    let finals = logged
        .iter()
        .filter(|e| e.kind.name() == "run.final")
        .count();
    assert_eq!(finals, 1);
    for pair in logged.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
    }
    for (i, event) in logged.iter().enumerate() {
        assert_eq!(event.run_seq, i as u64 + 1, "run_seq must have no gaps");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 2 — shell-write reclassification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn shell_write_is_reclassified_even_when_shell_run_is_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![
        vec![
            tool_call(
                "tc_1",
                "shell_run",
                serde_json::json!({"command": "echo hi > tmp/test.txt"}),
            ),
            done(),
        ],
        vec![token("could not write"), done()],
    ]);

    let mut config = Config::default();
    config
        .permissions
        .allow
        .push(PermissionRule::capability("shell.run"));
    let state = build_state(dir.path(), config, provider);
    let mut rx = register_channel(&state, "cli");

    let (run_id, _) = admit_on(&state, "cli", "run 'echo hi > tmp/test.txt'");

    // The broker matches shell.write, not the allowed shell.run.
    let request = wait_for_event(&mut rx, "permission.request").await;
    assert_eq!(request["capability"], "shell.write");
    let perm_id: Uuid = request["perm_id"].as_str().unwrap().parse().unwrap();

    runtime::respond_permission(&state, &perm_id, PermissionDecision::Deny);

    let events = collect_until_final(&mut rx, &run_id).await;
    let (_, result) = events
        .iter()
        .find(|(name, _)| name == "tool.result")
        .unwrap();
    assert_eq!(result["is_error"], true);
    assert!(result["content"].as_str().unwrap().contains("denied"));
    // A denial leaves the conversation usable: the run still completes.
    let (_, fin) = events.last().unwrap();
    assert_eq!(fin["state"], "done");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 3 — stop during stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn stop_during_stream_yields_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let mut long_turn: Vec<StreamEvent> = (0..50).map(|i| token(&format!("word{i} "))).collect();
    long_turn.push(done());
    let provider = ScriptedProvider::with_delay(vec![long_turn], Duration::from_millis(25));
    let state = build_state(dir.path(), Config::default(), provider);
    let mut rx = register_channel(&state, "cli");

    let (run_id, _) = admit_on(&state, "cli", "write a long essay");

    // Let three tokens through, then stop.
    for _ in 0..3 {
        wait_for_event(&mut rx, "token").await;
    }
    runtime::stop(&state, &run_id).unwrap();
    // stop; stop ≡ stop.
    runtime::stop(&state, &run_id).unwrap();

    let events = collect_until_final(&mut rx, &run_id).await;
    let seen = names(&events);

    // Far fewer than the scripted 50 tokens made it out, and the
    // stopped status precedes run.final.
    let token_count = seen.iter().filter(|n| **n == "token").count();
    assert!(token_count < 50, "stream must close at a chunk boundary");
    let status_pos = events
        .iter()
        .rposition(|(name, payload)| name == "run.status" && payload["state"] == "stopped")
        .expect("run.status=stopped must be emitted");
    assert_eq!(seen.last(), Some(&"run.final"));
    assert!(status_pos < events.len() - 1);

    let (_, fin) = events.last().unwrap();
    assert_eq!(fin["state"], "stopped");

    // Stopping a terminal stopped run stays a no-op.
    runtime::stop(&state, &run_id).unwrap();
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session FIFO
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn session_fifo_runs_in_admission_order() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![
        vec![token("one"), done()],
        vec![token("two"), done()],
        vec![token("three"), done()],
    ]);
    let state = build_state(dir.path(), Config::default(), provider);
    let mut rx = register_channel(&state, "cli");

    let (r1, a1) = admit_on(&state, "cli", "first");
    let (r2, a2) = admit_on(&state, "cli", "second");
    let (r3, a3) = admit_on(&state, "cli", "third");
    assert_eq!(a1, Admission::Started);
    assert_eq!(a2, Admission::Queued(1));
    assert_eq!(a3, Admission::Queued(2));

    // Finals arrive in admission order.
    let mut final_order = Vec::new();
    for _ in 0..3 {
        let payload = wait_for_event(&mut rx, "run.final").await;
        let run_id: Uuid = payload["run_id"].as_str().unwrap().parse().unwrap();
        final_order.push(run_id);
    }
    assert_eq!(final_order, vec![r1, r2, r3]);
}

#[tokio::test]
async fn queue_full_is_rejected_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let mut long_turn = vec![token("slow")];
    long_turn.push(done());
    let provider = ScriptedProvider::with_delay(
        vec![long_turn, vec![done()]],
        Duration::from_millis(200),
    );
    let mut config = Config::default();
    config.server.queue_soft_cap = 1;
    let state = build_state(dir.path(), config, provider);
    let _rx = register_channel(&state, "cli");

    let (_r1, _) = admit_on(&state, "cli", "first");
    let (_r2, a2) = admit_on(&state, "cli", "second");
    assert_eq!(a2, Admission::Queued(1));

    let rejected = runtime::admit(
        &state,
        "chan:cli",
        RunOrigin::Channel {
            channel_id: "cli".into(),
        },
        RunKind::Interactive,
        "third",
        Vec::new(),
    );
    assert!(matches!(
        rejected,
        Err(ab_domain::Error::ResourceExhausted(_))
    ));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 6 — channel isolation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn events_reach_the_origin_channel_only() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![vec![token("hello a"), done()]]);
    let state = build_state(dir.path(), Config::default(), provider);
    let mut rx_a = register_channel(&state, "client-a");
    let mut rx_b = register_channel(&state, "client-b");

    let (run_id, _) = admit_on(&state, "client-a", "hello");
    let events = collect_until_final(&mut rx_a, &run_id).await;
    assert!(!events.is_empty());

    // B never sees any event for A's run.
    assert!(
        rx_b.try_recv().is_err(),
        "no cross-channel broadcast is permitted"
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 4 — scheduled run after restart
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn scheduler_restart_fires_once_under_skip_policy() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![vec![token("digest"), done()]]);
    let state = build_state(dir.path(), Config::default(), provider);

    let schedule = state
        .schedules
        .create("fast", ScheduleKind::Interval, "10", "do the thing", "UTC", true)
        .unwrap();
    // Simulate a 2-minute outage.
    let stale = chrono::Utc::now() - chrono::Duration::seconds(120);
    state
        .schedules
        .update(&schedule.schedule_id, |s| s.next_run_at = Some(stale))
        .unwrap();

    state.schedules.advance_stale(&chrono::Utc::now()).unwrap();
    scheduler::tick(&state).await;

    // Exactly one scheduled run fired.
    let runs = state.runs.list(None, 100);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].kind, RunKind::Scheduled);
    assert_eq!(runs[0].input_text, "do the thing");
    assert!(matches!(runs[0].origin, RunOrigin::Scheduler { .. }));

    // next_run_at advanced to within one interval of now, not 12 behind.
    let after = state.schedules.get(&schedule.schedule_id).unwrap();
    let next = after.next_run_at.unwrap();
    let now = chrono::Utc::now();
    assert!(next > now);
    assert!((next - now).num_seconds() <= 10);

    // The immediate next tick fires nothing further.
    scheduler::tick(&state).await;
    assert_eq!(state.runs.list(None, 100).len(), 1);
}

#[tokio::test]
async fn scheduler_skips_tick_while_previous_run_is_active() {
    let dir = tempfile::tempdir().unwrap();
    // The scheduled run streams slowly so it is still active on tick 2.
    let mut slow: Vec<StreamEvent> = (0..20).map(|i| token(&format!("t{i}"))).collect();
    slow.push(done());
    let provider = ScriptedProvider::with_delay(vec![slow, vec![done()]], Duration::from_millis(100));
    let state = build_state(dir.path(), Config::default(), provider);

    let schedule = state
        .schedules
        .create("busy", ScheduleKind::Interval, "1", "tick", "UTC", true)
        .unwrap();
    state
        .schedules
        .update(&schedule.schedule_id, |s| {
            s.next_run_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        })
        .unwrap();

    scheduler::tick(&state).await;
    assert_eq!(state.runs.list(None, 100).len(), 1);

    // Make it due again while the run is still streaming.
    state
        .schedules
        .update(&schedule.schedule_id, |s| {
            s.next_run_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        })
        .unwrap();
    scheduler::tick(&state).await;

    assert_eq!(state.runs.list(None, 100).len(), 1, "no overlapping run");
    let after = state.schedules.get(&schedule.schedule_id).unwrap();
    assert_eq!(after.missed, 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker delegation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn delegation_returns_the_worker_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![
        // Parent turn 1: delegate.
        vec![
            tool_call(
                "tc_1",
                "delegate",
                serde_json::json!({"role": "researcher", "task": "look it up"}),
            ),
            done(),
        ],
        // Child turn (starts while the parent awaits).
        vec![token("child answer"), done()],
        // Parent turn 2: summarize.
        vec![token("parent done"), done()],
    ]);
    let state = build_state(dir.path(), Config::default(), provider);
    let mut rx = register_channel(&state, "cli");

    let (run_id, _) = admit_on(&state, "cli", "delegate this");
    let events = collect_until_final(&mut rx, &run_id).await;

    let (_, result) = events
        .iter()
        .find(|(name, _)| name == "tool.result")
        .unwrap();
    let envelope: Value = serde_json::from_str(result["content"].as_str().unwrap()).unwrap();
    assert_eq!(envelope["summary"], "child answer");
    assert_eq!(envelope["errors"].as_array().unwrap().len(), 0);

    let (_, fin) = events.last().unwrap();
    assert_eq!(fin["state"], "done");

    let workers = state.workers.list_recent();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].role, "researcher");
    assert_eq!(workers[0].parent_run_id, run_id);
}

#[tokio::test]
async fn delegation_past_depth_cap_is_denied() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![]);
    let state = build_state(dir.path(), Config::default(), provider);

    let mut deep_parent = ab_gateway::runtime::runs::Run::new(
        "worker:deep",
        RunOrigin::Parent {
            run_id: Uuid::new_v4(),
        },
        RunKind::Worker,
        "task",
    );
    deep_parent.depth = 2;

    let outcome = ab_gateway::runtime::workers::delegate(
        &state,
        &deep_parent,
        &serde_json::json!({"role": "too-deep", "task": "x"}),
    )
    .await;
    assert!(outcome.is_error);
    assert!(outcome.content.contains("denied"));
    assert_eq!(state.runs.list(None, 10).len(), 0, "no run was admitted");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Idempotence laws
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn permission_respond_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![
        vec![
            tool_call("tc_1", "shell_run", serde_json::json!({"command": "echo ok"})),
            done(),
        ],
        vec![token("fin"), done()],
    ]);
    let state = build_state(dir.path(), Config::default(), provider);
    let mut rx = register_channel(&state, "cli");

    let (run_id, _) = admit_on(&state, "cli", "do it");
    let request = wait_for_event(&mut rx, "permission.request").await;
    let perm_id: Uuid = request["perm_id"].as_str().unwrap().parse().unwrap();

    assert!(runtime::respond_permission(&state, &perm_id, PermissionDecision::Allow));
    // The second response is dropped silently.
    assert!(!runtime::respond_permission(&state, &perm_id, PermissionDecision::Deny));

    let events = collect_until_final(&mut rx, &run_id).await;
    let responses = events
        .iter()
        .filter(|(name, _)| name == "permission.response")
        .count();
    assert_eq!(responses, 1, "exactly one response per request");
    let (_, fin) = events.last().unwrap();
    assert_eq!(fin["state"], "done", "the allow decision stands");
}

#[tokio::test]
async fn stop_after_done_is_a_state_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![vec![token("quick"), done()]]);
    let state = build_state(dir.path(), Config::default(), provider);
    let mut rx = register_channel(&state, "cli");

    let (run_id, _) = admit_on(&state, "cli", "quick one");
    collect_until_final(&mut rx, &run_id).await;

    let err = runtime::stop(&state, &run_id).unwrap_err();
    assert!(matches!(err, ab_domain::Error::StateConflict(_)));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn memory_save_is_allowed_and_emits_memory_added() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![
        vec![
            tool_call(
                "tc_1",
                "memory_save",
                serde_json::json!({"text": "the user's birthday is in May"}),
            ),
            done(),
        ],
        vec![token("noted"), done()],
    ]);
    let state = build_state(dir.path(), Config::default(), provider);
    let mut rx = register_channel(&state, "cli");

    let (run_id, _) = admit_on(&state, "cli", "remember my birthday is in May");
    let events = collect_until_final(&mut rx, &run_id).await;

    // memory.write is on the default allow list: no permission round.
    let seen = names(&events);
    assert!(!seen.contains(&"permission.request"));
    assert!(seen.contains(&"memory.added"));
    assert_eq!(state.memory.pinned_items().len(), 1);

    let (_, fin) = events.last().unwrap();
    assert_eq!(fin["state"], "done");
}

#[tokio::test]
async fn memory_delete_by_the_model_requires_approval() {
    let dir = tempfile::tempdir().unwrap();
    let state_provider = ScriptedProvider::new(vec![
        vec![
            tool_call("tc_1", "memory_delete", serde_json::json!({"item_id": "placeholder"})),
            done(),
        ],
        vec![token("could not delete"), done()],
    ]);
    let state = build_state(dir.path(), Config::default(), state_provider);
    let mut rx = register_channel(&state, "cli");

    // Seed a pinned item. The ask gate fires before the tool even parses
    // its arguments: memory.delete defaults to ask.
    state.memory.pin("disposable fact").unwrap();

    let (run_id, _) = admit_on(&state, "cli", "forget that");
    let request = wait_for_event(&mut rx, "permission.request").await;
    assert_eq!(request["capability"], "memory.delete");
    let perm_id: Uuid = request["perm_id"].as_str().unwrap().parse().unwrap();

    runtime::respond_permission(&state, &perm_id, PermissionDecision::Deny);
    let events = collect_until_final(&mut rx, &run_id).await;
    let (_, result) = events
        .iter()
        .find(|(name, _)| name == "tool.result")
        .unwrap();
    assert_eq!(result["is_error"], true);
    // The item survives the denied deletion.
    assert_eq!(state.memory.pinned_items().len(), 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider failure
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn provider_error_fails_the_run_with_one_final() {
    let dir = tempfile::tempdir().unwrap();
    // No scripted turns at all: every stream open fails.
    let provider = ScriptedProvider::new(vec![]);
    let state = build_state(dir.path(), Config::default(), provider);
    let mut rx = register_channel(&state, "cli");

    let (run_id, _) = admit_on(&state, "cli", "hello?");
    let events = collect_until_final(&mut rx, &run_id).await;

    let (_, fin) = events.last().unwrap();
    assert_eq!(fin["state"], "failed");
    assert!(fin["error"].as_str().unwrap().contains("provider"));

    let logged = state.log.scan(&EventFilter::for_run(run_id), 0).unwrap();
    assert_eq!(
        logged.iter().filter(|e| e.kind.name() == "run.final").count(),
        1
    );
}
