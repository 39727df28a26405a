//! relayd - supervisor and worker entry points.
//!
//! `relayd run` starts the lazy runtime, provider health probes, and waits
//! for ctrl-c. `relayd worker --agent <id>` is what the runtime spawns: one
//! agent worker loop, logging to `logs/<id>.log`, exiting 0 on clean
//! shutdown or idle-exit. `relayd submit <text>` drives one request
//! end-to-end and prints the result.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use relay_bus::shutdown::ShutdownSignal;
use relay_core::config::Config;
use relay_core::lockfile::FileLock;
use relay_core::paths::WorkDir;
use relay_core::types::TaskSource;
use relay_daemon::channel::{ChannelBus, ChannelEvent};
use relay_daemon::orchestrator::Orchestrator;
use relay_daemon::runtime::LazyRuntime;
use relay_llm::router::ProviderRouter;

/// relayd -- orchestrate cooperating agent workers over a shared board.
#[derive(Parser)]
#[command(name = "relayd", version, about)]
struct Cli {
    /// Path to config.toml (default: ~/.relay/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Working directory for shared state (default: from config).
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor (default when no subcommand is given).
    Run,

    /// Run a single agent worker loop (spawned by the runtime).
    Worker {
        /// Agent id from the config's `[[agents]]` tables.
        #[arg(long)]
        agent: String,
    },

    /// Submit one request, wait for the result, print it.
    Submit {
        /// The user request text.
        text: String,
        /// Seconds to wait before giving up.
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("warning: failed to load config, using defaults: {e}");
            Config::default()
        }),
    };

    let workdir = WorkDir::new(cli.workdir.clone().unwrap_or_else(|| config.workdir()));
    workdir.ensure_layout().context("failed to create workdir layout")?;

    match cli.command {
        None | Some(Commands::Run) => run_supervisor(config, workdir, cli.config).await,
        Some(Commands::Worker { agent }) => run_worker(config, workdir, &agent).await,
        Some(Commands::Submit { text, timeout }) => {
            run_submit(config, workdir, &text, timeout).await
        }
    }
}

async fn run_supervisor(config: Config, workdir: WorkDir, config_path: Option<PathBuf>) -> Result<()> {
    relay_telemetry::logging::init_logging("relayd", &config.general.log_level);
    info!(workdir = %workdir.root().display(), "relayd starting");

    // Singleton guard: a second supervisor over the same workdir refuses.
    let guard_lock = FileLock::new(workdir.daemon_lock()).with_timeout(Duration::ZERO);
    let _guard = guard_lock
        .acquire()
        .map_err(|_| anyhow::anyhow!("another relayd already runs over this workdir"))?;

    let router = Arc::new(ProviderRouter::from_config(&config));
    let probes = router.clone().spawn_probes();

    let runtime = Arc::new(LazyRuntime::new(&config, workdir, config_path));
    runtime.start().await.context("failed to start always-on agents")?;

    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, shutting down");
                shutdown.trigger();
            }
        });
    }

    runtime.run_monitor(shutdown).await;
    probes.abort();
    info!("relayd stopped");
    Ok(())
}

async fn run_worker(config: Config, workdir: WorkDir, agent_id: &str) -> Result<()> {
    relay_telemetry::logging::init_worker_logging(
        &format!("relayd-worker-{agent_id}"),
        &config.general.log_level,
        &workdir.log_file(agent_id),
    )
    .context("failed to open worker log")?;

    let router = Arc::new(ProviderRouter::from_config(&config));
    let tools = Arc::new(relay_agents::tools::NoopDispatcher);

    relay_agents::worker::run_worker(&config, workdir, agent_id, router, tools)
        .await
        .with_context(|| format!("worker {agent_id} failed"))?;
    Ok(())
}

async fn run_submit(
    config: Config,
    workdir: WorkDir,
    text: &str,
    timeout: Option<u64>,
) -> Result<()> {
    relay_telemetry::logging::init_logging("relayd", &config.general.log_level);

    let channel = ChannelBus::new();
    let events = channel.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            if let ChannelEvent::Status { phase, .. } = event {
                eprintln!("[relay] {phase:?}...");
            }
        }
    });

    let orchestrator = Orchestrator::new(&workdir, config.orchestrator.clone(), channel);
    let task_id = orchestrator.submit(text, TaskSource::new("cli", text))?;
    info!(task_id = %task_id, "submitted");

    let outcome = orchestrator
        .wait(&task_id, timeout.map(Duration::from_secs))
        .await?;
    println!("{}", outcome.result);
    for file in &outcome.files {
        println!("[file] {}", file.display());
    }
    Ok(())
}
