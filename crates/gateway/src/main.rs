use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use ab_broker::{PermissionBroker, PolicyEngine};
use ab_domain::config::{Config, ConfigSeverity};
use ab_eventlog::EventLog;
use ab_gateway::adapters::spawn_telegram_adapter;
use ab_gateway::channels::ChannelRegistry;
use ab_gateway::provider_cmd;
use ab_gateway::runtime::cancel::CancelMap;
use ab_gateway::runtime::runs::RunStore;
use ab_gateway::runtime::scheduler::ScheduleStore;
use ab_gateway::runtime::workers::WorkerManager;
use ab_gateway::sessions::SessionManager;
use ab_gateway::state::AppState;
use ab_gateway::{api, runtime};
use ab_memory::MemoryService;

#[derive(Parser)]
#[command(name = "agentblob", about = "Always-on single-user agent gateway")]
struct Cli {
    /// Path to the TOML configuration document.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default).
    Serve,
    /// Configuration helpers.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Validate the configuration and exit non-zero on errors.
    Validate,
    /// Print the effective configuration as TOML.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            run_server(Arc::new(config)).await
        }
        Some(Command::Config {
            command: ConfigCommand::Validate,
        }) => {
            let issues = config.validate();
            for issue in &issues {
                println!("{issue}");
            }
            if issues
                .iter()
                .any(|i| i.severity == ConfigSeverity::Error)
            {
                std::process::exit(1);
            }
            println!("configuration OK");
            Ok(())
        }
        Some(Command::Config {
            command: ConfigCommand::Show,
        }) => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("agentblob {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading {}", path.display()))
        }
        None => {
            let default = PathBuf::from("agentblob.toml");
            if default.exists() {
                Config::load(&default).context("loading agentblob.toml")
            } else {
                Ok(Config::default())
            }
        }
    }
}

/// Structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ab_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("Agent Blob starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── State directory + single-instance lock ───────────────────────
    let state_dir = config.workspace.state_dir.clone();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(state_dir.join("agentblob.lock"))
        .context("opening instance lock")?;
    lock_file
        .try_lock_exclusive()
        .context("another agentblob instance holds this state directory")?;
    // Held for the process lifetime.
    let _lock_file = lock_file;
    tracing::info!(path = %state_dir.display(), "state directory locked");

    // ── Event log ────────────────────────────────────────────────────
    let log = Arc::new(
        EventLog::open(&state_dir.join("events"), config.logs.events.clone())
            .context("opening event log")?,
    );
    tracing::info!(next_seq = log.next_seq(), "event log ready");

    // ── Memory service ───────────────────────────────────────────────
    let memory_dir = if config.memory.dir.is_absolute() {
        config.memory.dir.clone()
    } else {
        state_dir.join(&config.memory.dir)
    };
    let embedder = provider_cmd::embedder_from_env();
    let memory = Arc::new(
        MemoryService::open(&memory_dir, config.memory.clone(), embedder)
            .context("opening memory service")?,
    );
    tracing::info!(items = memory.item_count(), "memory service ready");

    // ── Permission broker ────────────────────────────────────────────
    let policy =
        Arc::new(PolicyEngine::new(&config.permissions).context("compiling permission policy")?);
    let broker = Arc::new(PermissionBroker::new());
    tracing::info!("permission broker ready");

    // ── Tools ────────────────────────────────────────────────────────
    let tools = Arc::new(ab_tools::builtin_registry(&config.tools));
    tracing::info!(tools = tools.len(), "tool registry ready");

    // ── LLM provider ─────────────────────────────────────────────────
    let provider = provider_cmd::llm_from_env();

    // ── Schedules ────────────────────────────────────────────────────
    let schedules =
        Arc::new(ScheduleStore::load(&state_dir).context("loading schedules")?);
    schedules
        .advance_stale(&chrono::Utc::now())
        .context("reconciling stale schedules")?;
    tracing::info!(schedules = schedules.count(), "schedule store ready");

    // ── Gateway auth token ───────────────────────────────────────────
    let gateway_token_hash = match std::env::var(&config.server.token_env) {
        Ok(token) if !token.is_empty() => {
            tracing::info!("gateway bearer-token auth enabled");
            Some(Sha256::digest(token.as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(
                env = %config.server.token_env,
                "gateway auth disabled — set the token env to enable"
            );
            None
        }
    };

    // ── App state ────────────────────────────────────────────────────
    let state = AppState {
        started_at: chrono::Utc::now(),
        log,
        memory,
        policy,
        broker,
        tools,
        provider,
        channels: Arc::new(ChannelRegistry::new()),
        sessions: Arc::new(SessionManager::new(config.server.queue_soft_cap)),
        runs: Arc::new(RunStore::new(&state_dir)),
        cancels: Arc::new(CancelMap::new()),
        workers: Arc::new(WorkerManager::new()),
        schedules,
        gateway_token_hash,
        config: config.clone(),
    };

    // ── Scheduler tick ───────────────────────────────────────────────
    {
        let state = state.clone();
        let interval_s = config.supervisor.interval_s.max(1);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_s));
            loop {
                interval.tick().await;
                runtime::scheduler::tick(&state).await;
            }
        });
    }
    tracing::info!(
        interval_s = config.supervisor.interval_s,
        "scheduler started"
    );

    // ── Maintenance sweep ────────────────────────────────────────────
    {
        let state = state.clone();
        let interval_s = config.supervisor.maintenance_interval_s.max(1);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_s));
            loop {
                interval.tick().await;
                runtime::run_maintenance(&state).await;
            }
        });
    }
    tracing::info!(
        interval_s = config.supervisor.maintenance_interval_s,
        "maintenance sweep started"
    );

    // ── Frontend adapters ────────────────────────────────────────────
    spawn_telegram_adapter(&state);

    // ── Bind ─────────────────────────────────────────────────────────
    let app = api::router()
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(256))
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "Agent Blob listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
