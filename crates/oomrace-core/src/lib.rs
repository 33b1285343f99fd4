//! Experiment engine: race strategies, hog supervision, and the worker loops.

#![cfg(target_os = "linux")]

pub mod config;
pub mod error;
pub mod experiment;
pub mod process;
pub mod race;
pub mod strategy;
pub mod supervisor;

pub use config::ExperimentConfig;
pub use experiment::{
    ExperimentRecord, ExperimentReport, ExperimentRunner, ExperimentState, HaltedExperiment,
    RaceOutcome,
};
pub use process::{CompletionSignal, ProcessExit, ProcessHandle, ProcessLauncher};
pub use strategy::{RaceStrategy, StrategyKind};
pub use supervisor::{Supervisor, WorkerExit};

pub type Result<T> = std::result::Result<T, error::Error>;
