//! Command line entry point: races memory hogs inside cgroup memory domains
//! until one of them survives past the limit.

#![cfg(target_os = "linux")]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use oomrace_cgroups::MemoryController;
use oomrace_core::{ExperimentConfig, StrategyKind, Supervisor, WorkerExit};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Command line arguments for oomrace
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; flags given here override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hog executable, invoked with one or two KB arguments
    #[arg(long = "hog-prog")]
    hog_prog: Option<PathBuf>,

    /// Argument passed to the hog ahead of the footprint (repeatable)
    #[arg(long = "hog-arg", allow_hyphen_values = true)]
    hog_args: Vec<String>,

    /// Memory and memory+swap limit of every domain, in bytes
    #[arg(long)]
    mem_limit_bytes: Option<u64>,

    /// Number of concurrent workers
    #[arg(short = 'n', long)]
    concurrency: Option<usize>,

    /// Race strategy: binary, graduated, breathing or immediate
    #[arg(long)]
    strategy: Option<StrategyKind>,

    /// KB the breathing strategy leaves unused
    #[arg(long)]
    breathing_room_kb: Option<u64>,

    /// Mount point of the memory controller
    #[arg(long)]
    cgroup_root: Option<PathBuf>,

    #[arg(long)]
    poll_interval_ms: Option<u64>,

    #[arg(long)]
    race_timeout_ms: Option<u64>,

    #[arg(long)]
    probe_settle_ms: Option<u64>,

    /// Keep polling when a usage counter holds garbage
    #[arg(long)]
    tolerate_parse_errors: bool,

    /// Experiments per worker before it stops
    #[arg(long)]
    max_experiments: Option<u64>,

    /// Discard hog stdout/stderr
    #[arg(long)]
    quiet_hogs: bool,

    /// Dismantle halted experiments on shutdown
    #[arg(long)]
    release_on_shutdown: bool,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Layer the flags over the configuration file, or over the defaults
    fn into_config(self) -> Result<ExperimentConfig> {
        let mut config = match &self.config {
            Some(path) => ExperimentConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ExperimentConfig::default(),
        };

        if let Some(program) = self.hog_prog {
            config.hog_program = program;
        }
        if !self.hog_args.is_empty() {
            config.hog_args = self.hog_args;
        }
        if let Some(limit) = self.mem_limit_bytes {
            config.mem_limit_bytes = limit;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        if let Some(room) = self.breathing_room_kb {
            config.breathing_room_kb = room;
        }
        if let Some(root) = self.cgroup_root {
            config.cgroup_root = root;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval_ms = ms;
        }
        if let Some(ms) = self.race_timeout_ms {
            config.race_timeout_ms = ms;
        }
        if let Some(ms) = self.probe_settle_ms {
            config.probe_settle_ms = ms;
        }
        if self.max_experiments.is_some() {
            config.max_experiments = self.max_experiments;
        }
        config.tolerate_parse_errors |= self.tolerate_parse_errors;
        config.quiet_hogs |= self.quiet_hogs;
        config.release_on_shutdown |= self.release_on_shutdown;

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Cancel `token` on the first SIGINT or SIGTERM
fn spawn_signal_listener(token: CancellationToken) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = args.into_config()?;
    info!(
        "Starting oomrace: {} x {} against {} with limit {}B",
        config.concurrency,
        config.strategy,
        config.hog_program.display(),
        config.mem_limit_bytes
    );

    let controller = MemoryController::new(config.cgroup_root.clone());
    let supervisor = Supervisor::new(config, controller)?;

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone())?;

    let exits = match supervisor.run(cancel).await {
        Ok(exits) => exits,
        Err(e) => {
            error!("oomrace stopped: {}", e);
            return Err(e.into());
        }
    };

    for (worker_id, exit) in &exits {
        match exit {
            WorkerExit::Halted { record } => warn!(
                "worker {} halted in domain {} after {} ({} launches)",
                worker_id,
                record.domain_id,
                record.outcome,
                record.launches.len()
            ),
            WorkerExit::Exhausted { experiments } => {
                info!("worker {} ran {} experiments", worker_id, experiments)
            }
            WorkerExit::Cancelled { experiments } => {
                info!("worker {} cancelled after {} experiments", worker_id, experiments)
            }
        }
    }

    Ok(())
}
