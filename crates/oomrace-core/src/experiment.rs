//! One experiment run: domain setup, launches, arbitration, and teardown.
//!
//! ```text
//! Created -> Configuring -> Launching(0) -> [Monitoring] -> Launching(1) ... -> Arbitrating
//!     Arbitrating -> Cleaning -> Done
//!     Arbitrating -> Halted            (yield; domain and hogs are kept)
//! ```
//!
//! Cleaning kills and reaps every hog before the domain is removed.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use oomrace_cgroups::{MemoryController, MemoryDomain, UsageMonitor, UsageSample};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExperimentConfig;
use crate::process::{ProcessExit, ProcessHandle, ProcessLauncher};
use crate::race::{first_of, First};
use crate::strategy::{Arbitration, Footprint, LaunchGate, RaceStrategy, SizingInput};
use crate::Result;

/// Lifecycle of a single experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentState {
    Created,
    Configuring,
    /// Launching step `i` of the strategy's plan
    Launching(usize),
    /// Waiting at the paging barrier
    Monitoring,
    Arbitrating,
    Cleaning,
    Done,
    /// A yield was observed; nothing is torn down
    Halted,
}

/// How a race ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaceOutcome {
    /// `label` exited first and the others were killed
    FirstExit { label: String, exit: ProcessExit },
    /// Nothing exited in time and usage stayed within the limit
    Timeout { sample: UsageSample },
    /// Nothing exited in time and usage is over the limit
    Yield { sample: UsageSample },
    /// Every hog exited on its own
    Settled,
    /// Hogs were introspected and then killed
    Probed,
    /// The run was cancelled mid-experiment
    Abandoned,
}

impl RaceOutcome {
    pub fn is_yield(&self) -> bool {
        matches!(self, Self::Yield { .. })
    }
}

impl fmt::Display for RaceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstExit { label, exit } => write!(f, "{} exited first ({})", label, exit),
            Self::Timeout { sample } => write!(
                f,
                "inconclusive timeout at {}B mem, {}B memsw",
                sample.resident_bytes, sample.resident_plus_swap_bytes
            ),
            Self::Yield { sample } => write!(
                f,
                "yield at {}B mem, {}B memsw",
                sample.resident_bytes, sample.resident_plus_swap_bytes
            ),
            Self::Settled => f.write_str("all hogs exited"),
            Self::Probed => f.write_str("probed and killed"),
            Self::Abandoned => f.write_str("abandoned"),
        }
    }
}

/// One launched hog, as recorded for reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub label: String,
    pub pid: u32,
    pub footprint: Footprint,
    /// How the hog had ended when arbitration finished; `None` if still running
    pub exit: Option<ProcessExit>,
}

/// Summary of a finished or halted experiment
#[derive(Debug, Clone)]
pub struct ExperimentRecord {
    pub worker_id: usize,
    pub iteration: u64,
    pub domain_id: String,
    pub limit_bytes: u64,
    pub strategy: &'static str,
    pub launches: Vec<LaunchRecord>,
    pub outcome: RaceOutcome,
    pub state: ExperimentState,
    pub elapsed: Duration,
    /// Time spent at paging barriers
    pub paging_wait: Duration,
}

/// Result of [`ExperimentRunner::run_once`]
#[derive(Debug)]
pub enum ExperimentReport {
    Completed(ExperimentRecord),
    Halted(HaltedExperiment),
}

impl ExperimentReport {
    pub fn record(&self) -> &ExperimentRecord {
        match self {
            Self::Completed(record) => record,
            Self::Halted(halted) => halted.record(),
        }
    }
}

/// An experiment frozen on a yield, still owning its domain and hogs
#[derive(Debug)]
pub struct HaltedExperiment {
    record: ExperimentRecord,
    domain: MemoryDomain,
    processes: Vec<ProcessHandle>,
}

impl HaltedExperiment {
    pub fn record(&self) -> &ExperimentRecord {
        &self.record
    }

    pub fn domain(&self) -> &MemoryDomain {
        &self.domain
    }

    pub fn processes(&self) -> &[ProcessHandle] {
        &self.processes
    }

    /// Give up the retained state without touching it
    pub fn into_record(self) -> ExperimentRecord {
        self.record
    }

    /// Kill and reap the retained hogs, then remove the domain
    pub async fn dismantle(self) -> Result<ExperimentRecord> {
        info!("Dismantling halted experiment in domain {}", self.domain.id());
        teardown(&self.domain, &self.processes).await?;
        Ok(self.record)
    }
}

/// Terminate, then reap, every process before removing the domain.
async fn teardown(domain: &MemoryDomain, processes: &[ProcessHandle]) -> Result<()> {
    for process in processes {
        process.terminate().await?;
    }
    for process in processes {
        let exit = process.reap().await;
        debug!("Reaped {} (pid {}): {}", process.label(), process.pid(), exit);
    }
    domain.remove()?;
    Ok(())
}

struct Run {
    worker_id: usize,
    state: ExperimentState,
    launches: Vec<LaunchRecord>,
    processes: Vec<ProcessHandle>,
    paging_wait: Duration,
}

impl Run {
    fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            state: ExperimentState::Created,
            launches: Vec::new(),
            processes: Vec::new(),
            paging_wait: Duration::ZERO,
        }
    }

    fn advance(&mut self, next: ExperimentState) {
        debug!("worker {} {:?} -> {:?}", self.worker_id, self.state, next);
        self.state = next;
    }
}

/// Runs experiments for one worker
#[derive(Debug, Clone)]
pub struct ExperimentRunner {
    worker_id: usize,
    controller: MemoryController,
    launcher: ProcessLauncher,
    monitor: UsageMonitor,
    strategy: Arc<dyn RaceStrategy>,
    limit_bytes: u64,
}

impl ExperimentRunner {
    pub fn new(
        worker_id: usize,
        config: &ExperimentConfig,
        controller: MemoryController,
        strategy: Arc<dyn RaceStrategy>,
    ) -> Self {
        Self {
            worker_id,
            controller,
            launcher: ProcessLauncher::new(config.launcher_config()),
            monitor: UsageMonitor::new(config.monitor_config()),
            strategy,
            limit_bytes: config.mem_limit_bytes,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Run one experiment in a fresh domain.
    ///
    /// Cancellation abandons the race but still tears the domain down. Errors
    /// are fatal; a best-effort teardown is attempted before they propagate.
    pub async fn run_once(
        &self,
        iteration: u64,
        cancel: &CancellationToken,
    ) -> Result<ExperimentReport> {
        let started = Instant::now();
        let mut run = Run::new(self.worker_id);
        info!(
            "worker {} running {} experiment {} with memory limit {}",
            self.worker_id,
            self.strategy.name(),
            iteration,
            self.limit_bytes
        );

        run.advance(ExperimentState::Configuring);
        let domain = self.controller.create(self.limit_bytes)?;

        let driven = tokio::select! {
            result = self.drive(&domain, &mut run) => result,
            _ = cancel.cancelled() => {
                info!("worker {} abandoning experiment in domain {}", self.worker_id, domain.id());
                Ok(RaceOutcome::Abandoned)
            }
        };

        let outcome = match driven {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("worker {} experiment in domain {} failed: {}", self.worker_id, domain.id(), e);
                if let Err(cleanup) = teardown(&domain, &run.processes).await {
                    warn!("worker {} could not tear down domain {}: {}", self.worker_id, domain.id(), cleanup);
                }
                return Err(e);
            }
        };

        if let RaceOutcome::Yield { sample } = &outcome {
            warn!(
                "worker {} (domain {}) yielded a result! mem {}B, memsw {}B, limit {}B",
                self.worker_id,
                domain.id(),
                sample.resident_bytes,
                sample.resident_plus_swap_bytes,
                domain.limit_bytes()
            );
            run.advance(ExperimentState::Halted);
            let record = self.record(&run, iteration, &domain, outcome, started.elapsed());
            return Ok(ExperimentReport::Halted(HaltedExperiment {
                record,
                domain,
                processes: run.processes,
            }));
        }

        run.advance(ExperimentState::Cleaning);
        teardown(&domain, &run.processes).await?;
        run.advance(ExperimentState::Done);

        let record = self.record(&run, iteration, &domain, outcome, started.elapsed());
        info!(
            "worker {} done running experiment {}: {} after {:.2}s",
            self.worker_id,
            iteration,
            record.outcome,
            record.elapsed.as_secs_f64()
        );
        Ok(ExperimentReport::Completed(record))
    }

    async fn drive(&self, domain: &MemoryDomain, run: &mut Run) -> Result<RaceOutcome> {
        let limit = domain.limit_bytes();

        for (index, step) in self.strategy.launch_plan().iter().enumerate() {
            let sample = match step.gate {
                LaunchGate::Immediate => None,
                LaunchGate::Sample => {
                    tokio::time::sleep(self.monitor.config().poll_interval).await;
                    Some(self.monitor.sample(domain)?)
                }
                LaunchGate::PagingTransition => {
                    run.advance(ExperimentState::Monitoring);
                    let waiting = Instant::now();
                    let sample = self.monitor.await_paging_transition(domain).await?;
                    run.paging_wait += waiting.elapsed();
                    info!("worker {} (domain {}) paged", self.worker_id, domain.id());
                    info!(
                        "worker {} {}B mem, {}B memsw remaining",
                        self.worker_id,
                        limit.saturating_sub(sample.resident_bytes),
                        sample.headroom(limit)
                    );
                    Some(sample)
                }
            };

            run.advance(ExperimentState::Launching(index));
            let input = SizingInput {
                limit_bytes: limit,
                worker_id: self.worker_id,
                sample,
            };
            let footprint = self.strategy.footprint(index, &input);
            info!("worker {} starting {} with {}", self.worker_id, step.label, footprint);

            let handle = self.launcher.launch(step.label, &footprint, domain)?;
            run.launches.push(LaunchRecord {
                label: step.label.to_string(),
                pid: handle.pid(),
                footprint,
                exit: None,
            });
            run.processes.push(handle);
        }

        run.advance(ExperimentState::Arbitrating);
        let outcome = self.arbitrate(domain, &run.processes).await?;
        for (launch, process) in run.launches.iter_mut().zip(&run.processes) {
            launch.exit = process.exit();
        }
        Ok(outcome)
    }

    async fn arbitrate(
        &self,
        domain: &MemoryDomain,
        processes: &[ProcessHandle],
    ) -> Result<RaceOutcome> {
        match self.strategy.arbitration() {
            Arbitration::FirstExit { timeout } => {
                let racers = processes.iter().enumerate().map(|(index, process)| {
                    let signal = process.completion();
                    async move { (index, signal.wait().await) }
                });

                match first_of(racers, timeout).await {
                    First::Completed((winner, exit)) => {
                        let label = processes[winner].label().to_string();
                        info!("worker {} {} exited first ({})", self.worker_id, label, exit);
                        for (index, loser) in processes.iter().enumerate() {
                            if index != winner {
                                info!("worker {} killing {} process", self.worker_id, loser.label());
                                loser.terminate().await?;
                                let exit = loser.reap().await;
                                debug!("worker {} {} ended ({})", self.worker_id, loser.label(), exit);
                            }
                        }
                        Ok(RaceOutcome::FirstExit { label, exit })
                    }
                    First::TimedOut => {
                        info!("worker {} (domain {}) has not been OOM killed", self.worker_id, domain.id());
                        let sample = self.monitor.sample(domain)?;
                        info!(
                            "worker {} mem: {}B, memsw: {}B",
                            self.worker_id, sample.resident_bytes, sample.resident_plus_swap_bytes
                        );
                        if self.strategy.is_yield(domain.limit_bytes(), &sample) {
                            return Ok(RaceOutcome::Yield { sample });
                        }
                        for process in processes {
                            info!("worker {} killing {} process", self.worker_id, process.label());
                            process.terminate().await?;
                        }
                        join_all(processes.iter().map(|process| process.reap())).await;
                        Ok(RaceOutcome::Timeout { sample })
                    }
                    First::Empty => Ok(RaceOutcome::Settled),
                }
            }
            Arbitration::ProbeThenKill { settle } => {
                tokio::time::sleep(settle).await;
                for process in processes {
                    let report = process.probe();
                    debug!(
                        "worker {} probed {} (pid {}): environ {:?}B, cmdline {:?}B",
                        self.worker_id,
                        process.label(),
                        process.pid(),
                        report.environ_bytes,
                        report.cmdline_bytes
                    );
                }
                for process in processes {
                    process.terminate().await?;
                }
                join_all(processes.iter().map(|process| process.reap())).await;
                Ok(RaceOutcome::Probed)
            }
            Arbitration::AwaitAll => {
                let exits = join_all(processes.iter().map(|process| process.reap())).await;
                for (process, exit) in processes.iter().zip(exits) {
                    info!("worker {} {} exited ({})", self.worker_id, process.label(), exit);
                }
                Ok(RaceOutcome::Settled)
            }
        }
    }

    fn record(
        &self,
        run: &Run,
        iteration: u64,
        domain: &MemoryDomain,
        outcome: RaceOutcome,
        elapsed: Duration,
    ) -> ExperimentRecord {
        ExperimentRecord {
            worker_id: self.worker_id,
            iteration,
            domain_id: domain.id().to_string(),
            limit_bytes: domain.limit_bytes(),
            strategy: self.strategy.name(),
            launches: run.launches.clone(),
            outcome,
            state: run.state,
            elapsed,
            paging_wait: run.paging_wait,
        }
    }
}
