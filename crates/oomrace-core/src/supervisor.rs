//! Runs N independent experiment loops concurrently.

use std::sync::Arc;

use oomrace_cgroups::MemoryController;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::ExperimentConfig;
use crate::experiment::{ExperimentRecord, ExperimentReport, ExperimentRunner, RaceOutcome};
use crate::strategy::RaceStrategy;
use crate::Result;

/// Why a worker loop stopped
#[derive(Debug)]
pub enum WorkerExit {
    /// A yield froze the worker; `record` describes the halted experiment
    Halted { record: ExperimentRecord },
    /// The configured number of experiments ran
    Exhausted { experiments: u64 },
    /// Shutdown was requested
    Cancelled { experiments: u64 },
}

/// Starts and watches the worker loops
pub struct Supervisor {
    config: Arc<ExperimentConfig>,
    controller: MemoryController,
    strategy: Arc<dyn RaceStrategy>,
}

impl Supervisor {
    /// Create a supervisor for `config`, with domains created by `controller`
    pub fn new(config: ExperimentConfig, controller: MemoryController) -> Result<Self> {
        config.validate()?;
        let strategy = config.strategy.build(&config);
        Ok(Self {
            config: Arc::new(config),
            controller,
            strategy,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Run every worker until all of them stop.
    ///
    /// The first fatal error cancels the remaining workers, waits for them to
    /// clean up, and is returned.
    pub async fn run(&self, cancel: CancellationToken) -> Result<Vec<(usize, WorkerExit)>> {
        info!(
            "Starting {} workers with strategy {} and limit {}B",
            self.config.concurrency,
            self.strategy.name(),
            self.config.mem_limit_bytes
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.concurrency {
            let runner = ExperimentRunner::new(
                worker_id,
                &self.config,
                self.controller.clone(),
                Arc::clone(&self.strategy),
            );
            let span = info_span!("worker", id = worker_id);
            workers.spawn(
                run_worker(
                    runner,
                    self.config.max_experiments,
                    self.config.release_on_shutdown,
                    cancel.clone(),
                )
                .instrument(span),
            );
        }

        let mut exits = Vec::with_capacity(self.config.concurrency);
        while let Some(joined) = workers.join_next().await {
            let failure = match joined {
                Ok(Ok(exit)) => {
                    exits.push(exit);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(join_error) => join_error.into(),
            };
            error!("Fatal error, stopping all workers: {}", failure);
            cancel.cancel();
            // Cancelled workers abandon their experiments and tear them down.
            while let Some(rest) = workers.join_next().await {
                match rest {
                    Ok(Ok((worker_id, exit))) => debug!("worker {} stopped: {:?}", worker_id, exit),
                    Ok(Err(e)) => warn!("Another worker failed during shutdown: {}", e),
                    Err(join_error) => warn!("Worker task failed during shutdown: {}", join_error),
                }
            }
            return Err(failure);
        }

        exits.sort_by_key(|(worker_id, _)| *worker_id);
        Ok(exits)
    }
}

/// Loop experiments for one worker until halted, exhausted, or cancelled
pub async fn run_worker(
    runner: ExperimentRunner,
    max_experiments: Option<u64>,
    release_on_shutdown: bool,
    cancel: CancellationToken,
) -> Result<(usize, WorkerExit)> {
    let worker_id = runner.worker_id();
    let mut experiments: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            info!("worker {} stopping after {} experiments", worker_id, experiments);
            return Ok((worker_id, WorkerExit::Cancelled { experiments }));
        }
        if max_experiments.is_some_and(|max| experiments >= max) {
            info!("worker {} finished {} experiments", worker_id, experiments);
            return Ok((worker_id, WorkerExit::Exhausted { experiments }));
        }

        match runner.run_once(experiments, &cancel).await? {
            ExperimentReport::Completed(record) => {
                if record.outcome != RaceOutcome::Abandoned {
                    experiments += 1;
                }
                debug!("worker {} record: {:?}", worker_id, record);
            }
            ExperimentReport::Halted(halted) => {
                warn!(
                    "worker {} halted; domain {} left in place for inspection",
                    worker_id,
                    halted.domain().id()
                );
                cancel.cancelled().await;
                let record = if release_on_shutdown {
                    halted.dismantle().await?
                } else {
                    info!("worker {} leaving domain {} behind", worker_id, halted.domain().id());
                    halted.into_record()
                };
                return Ok((worker_id, WorkerExit::Halted { record }));
            }
        }
    }
}
