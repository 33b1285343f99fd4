//! Race strategies: how many hogs to launch, how big, and how to settle the race.
//!
//! A strategy is pure decision logic. The orchestrator walks its launch plan,
//! opening each step's gate, then asks the strategy for the footprint given
//! what the gate observed. Footprints are sized against usage actually
//! observed in the domain, never against nominal arithmetic.

mod binary;
mod breathing;
mod graduated;
mod immediate;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use oomrace_cgroups::UsageSample;
use serde::{Deserialize, Serialize};

pub use binary::BinaryRace;
pub use breathing::BreathingRoom;
pub use graduated::GraduatedRace;
pub use immediate::ImmediateRace;

use crate::config::ExperimentConfig;
use crate::error::Error;

/// Memory requested from one hog, in kilobytes per allocation class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footprint(Vec<u64>);

impl Footprint {
    /// One allocation of `kb`
    pub fn single(kb: u64) -> Self {
        Self(vec![kb])
    }

    /// Two allocation classes: heap pages and mmap-touched pages
    pub fn split(malloc_kb: u64, mmap_kb: u64) -> Self {
        Self(vec![malloc_kb, mmap_kb])
    }

    pub fn kilobytes(&self) -> &[u64] {
        &self.0
    }

    pub fn total_kb(&self) -> u64 {
        self.0.iter().sum()
    }

    /// Decimal arguments for the hog command line
    pub fn args(&self) -> Vec<String> {
        self.0.iter().map(u64::to_string).collect()
    }
}

impl fmt::Display for Footprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, kb) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{}KB", kb)?;
        }
        Ok(())
    }
}

/// What must happen before a launch step may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchGate {
    /// Launch right away, without sampling
    Immediate,
    /// Wait one poll interval, then size from a fresh sample
    Sample,
    /// Wait for the domain to start paging, then size from that sample
    PagingTransition,
}

/// One entry of a launch plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchStep {
    pub label: &'static str,
    pub gate: LaunchGate,
}

impl LaunchStep {
    pub const fn new(label: &'static str, gate: LaunchGate) -> Self {
        Self { label, gate }
    }
}

/// Everything a strategy may look at when sizing a launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizingInput {
    pub limit_bytes: u64,
    pub worker_id: usize,
    /// Sample taken by the step's gate; `None` for immediate steps
    pub sample: Option<UsageSample>,
}

impl SizingInput {
    pub fn limit_kb(&self) -> u64 {
        self.limit_bytes / 1024
    }

    /// Bytes still available under the limit according to the resident+swap counter
    pub fn headroom_bytes(&self) -> u64 {
        self.sample
            .map(|sample| sample.headroom(self.limit_bytes))
            .unwrap_or(self.limit_bytes)
    }
}

/// How the orchestrator settles a race once every hog is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbitration {
    /// The first hog to exit wins and the others are killed.
    ///
    /// With a timeout, expiry triggers the yield check; without one the race
    /// waits for the first exit indefinitely.
    FirstExit { timeout: Option<Duration> },
    /// Let the hogs settle, read their /proc state, then kill them all
    ProbeThenKill { settle: Duration },
    /// Wait for every hog to exit on its own
    AwaitAll,
}

/// Pluggable launch and arbitration policy
pub trait RaceStrategy: fmt::Debug + Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Launch steps in order
    fn launch_plan(&self) -> &[LaunchStep];

    /// Footprint of launch step `step`
    fn footprint(&self, step: usize, input: &SizingInput) -> Footprint;

    fn arbitration(&self) -> Arbitration;

    /// True when `sample`, taken at timeout expiry, is the anomaly being hunted
    fn is_yield(&self, limit_bytes: u64, sample: &UsageSample) -> bool {
        sample.resident_plus_swap_bytes > limit_bytes
    }
}

/// Selectable strategy variants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Binary,
    Graduated,
    Breathing,
    Immediate,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::Binary,
        StrategyKind::Graduated,
        StrategyKind::Breathing,
        StrategyKind::Immediate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Binary => "binary",
            StrategyKind::Graduated => "graduated",
            StrategyKind::Breathing => "breathing",
            StrategyKind::Immediate => "immediate",
        }
    }

    /// Build the strategy with the parameters it takes from `config`
    pub fn build(&self, config: &ExperimentConfig) -> Arc<dyn RaceStrategy> {
        match self {
            StrategyKind::Binary => Arc::new(BinaryRace::new(config.race_timeout())),
            StrategyKind::Graduated => Arc::new(GraduatedRace::new(config.probe_settle())),
            StrategyKind::Breathing => Arc::new(BreathingRoom::new(config.breathing_room_kb)),
            StrategyKind::Immediate => Arc::new(ImmediateRace::new()),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StrategyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                Error::config(format!(
                    "unknown strategy {:?}, expected one of binary, graduated, breathing, immediate",
                    s
                ))
            })
    }
}
