//! Experiment configuration shared read-only by every worker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use oomrace_cgroups::domain::DEFAULT_ROOT;
use oomrace_cgroups::MonitorConfig;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::process::LauncherConfig;
use crate::strategy::StrategyKind;
use crate::Result;

/// Configuration for a whole run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Hog executable, invoked with one or two KB arguments
    pub hog_program: PathBuf,
    /// Arguments placed before the footprint, e.g. when the program is a wrapper
    pub hog_args: Vec<String>,
    /// Resident and resident+swap limit of every domain
    pub mem_limit_bytes: u64,
    /// Number of concurrent workers
    pub concurrency: usize,
    pub strategy: StrategyKind,
    /// KB the breathing-room strategy leaves unused
    pub breathing_room_kb: u64,
    /// Mount point of the memory controller
    pub cgroup_root: PathBuf,
    pub poll_interval_ms: u64,
    pub race_timeout_ms: u64,
    pub probe_settle_ms: u64,
    /// Keep polling through non-numeric counter content
    pub tolerate_parse_errors: bool,
    /// Experiments per worker; unlimited when absent
    pub max_experiments: Option<u64>,
    /// Discard hog stdout/stderr
    pub quiet_hogs: bool,
    /// Tear down halted experiments on shutdown instead of leaving them for inspection
    pub release_on_shutdown: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            hog_program: PathBuf::new(),
            hog_args: Vec::new(),
            mem_limit_bytes: 0,
            concurrency: 1,
            strategy: StrategyKind::default(),
            breathing_room_kb: 0,
            cgroup_root: PathBuf::from(DEFAULT_ROOT),
            poll_interval_ms: 1000,
            race_timeout_ms: 5000,
            probe_settle_ms: 1000,
            tolerate_parse_errors: false,
            max_experiments: None,
            quiet_hogs: false,
            release_on_shutdown: false,
        }
    }
}

impl ExperimentConfig {
    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Reject configurations no experiment could run with
    pub fn validate(&self) -> Result<()> {
        if self.hog_program.as_os_str().is_empty() {
            return Err(Error::config("hog program is required"));
        }
        if self.mem_limit_bytes == 0 {
            return Err(Error::config("memory limit must be greater than zero"));
        }
        if self.concurrency == 0 {
            return Err(Error::config("concurrency must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll interval must be greater than zero"));
        }
        if self.race_timeout_ms == 0 {
            return Err(Error::config("race timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn race_timeout(&self) -> Duration {
        Duration::from_millis(self.race_timeout_ms)
    }

    pub fn probe_settle(&self) -> Duration {
        Duration::from_millis(self.probe_settle_ms)
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: self.poll_interval(),
            tolerate_parse_errors: self.tolerate_parse_errors,
        }
    }

    pub fn launcher_config(&self) -> LauncherConfig {
        LauncherConfig {
            program: self.hog_program.clone(),
            args: self.hog_args.clone(),
            quiet: self.quiet_hogs,
        }
    }
}
