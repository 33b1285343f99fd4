//! Cgroup v1 memory controller domains and usage monitoring.

#![cfg(target_os = "linux")]

pub mod domain;
pub mod error;
pub mod monitor;

pub use domain::{DomainLimits, Hierarchy, MemoryController, MemoryDomain, UsageSample};
pub use monitor::{MonitorConfig, UsageMonitor};

pub type Result<T> = std::result::Result<T, error::Error>;
