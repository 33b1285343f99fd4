//! Polling barrier over a domain's usage counters.

use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::domain::{MemoryDomain, UsageSample};
use crate::Result;

/// Configuration for usage polling
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Delay between two samples
    pub poll_interval: Duration,
    /// Keep polling when a counter holds non-numeric content
    pub tolerate_parse_errors: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            tolerate_parse_errors: false,
        }
    }
}

/// Samples usage counters on a fixed interval
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageMonitor {
    config: MonitorConfig,
}

impl UsageMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Take one sample
    pub fn sample(&self, domain: &MemoryDomain) -> Result<UsageSample> {
        domain.read_usage()
    }

    /// Block until the domain starts paging and return the first diverging sample.
    ///
    /// There is no timeout. If the domain never swaps, this only ends when the
    /// calling future is dropped.
    pub async fn await_paging_transition(&self, domain: &MemoryDomain) -> Result<UsageSample> {
        let mut polls: u64 = 0;
        loop {
            polls += 1;
            match domain.read_usage() {
                Ok(sample) if sample.is_paging() => {
                    debug!(
                        "Domain {} paged after {} polls: mem {}B, memsw {}B",
                        domain.id(),
                        polls,
                        sample.resident_bytes,
                        sample.resident_plus_swap_bytes
                    );
                    return Ok(sample);
                }
                Ok(sample) => {
                    trace!("Domain {} not paging yet at {}B", domain.id(), sample.resident_bytes);
                }
                Err(e) if e.is_parse() && self.config.tolerate_parse_errors => {
                    warn!("Ignoring unreadable counter on domain {}: {}", domain.id(), e);
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MemoryController;
    use crate::error::Error;
    use std::fs;
    use tempfile::TempDir;

    fn fast(tolerate_parse_errors: bool) -> UsageMonitor {
        UsageMonitor::new(MonitorConfig {
            poll_interval: Duration::from_millis(10),
            tolerate_parse_errors,
        })
    }

    #[tokio::test]
    async fn test_returns_immediately_when_already_paging() {
        let dir = TempDir::new().unwrap();
        let seed = UsageSample::new(100_000_000, 104_857_600);
        let domain = MemoryController::emulated(dir.path(), seed).create(104_857_600).unwrap();

        let sample = fast(false).await_paging_transition(&domain).await.unwrap();
        assert_eq!(sample, seed);
    }

    #[tokio::test]
    async fn test_waits_for_counters_to_diverge() {
        let dir = TempDir::new().unwrap();
        let seed = UsageSample::new(4096, 4096);
        let domain = MemoryController::emulated(dir.path(), seed).create(65536).unwrap();
        let memsw = domain.path().join("memory.memsw.usage_in_bytes");

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            fs::write(memsw, "8192").unwrap();
        });

        let sample = fast(false).await_paging_transition(&domain).await.unwrap();
        assert_ne!(sample.resident_bytes, sample.resident_plus_swap_bytes);
        assert_eq!(sample, UsageSample::new(4096, 8192));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_blocks_while_counters_match() {
        let dir = TempDir::new().unwrap();
        let domain = MemoryController::emulated(dir.path(), UsageSample::new(1, 1))
            .create(4096)
            .unwrap();

        let waited = tokio::time::timeout(
            Duration::from_millis(100),
            fast(false).await_paging_transition(&domain),
        )
        .await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_parse_failure_is_fatal_by_default() {
        let dir = TempDir::new().unwrap();
        let domain = MemoryController::emulated(dir.path(), UsageSample::default())
            .create(4096)
            .unwrap();
        fs::write(domain.path().join("memory.usage_in_bytes"), "n/a").unwrap();

        let err = fast(false).await_paging_transition(&domain).await.unwrap_err();
        assert!(err.is_parse());
    }

    #[tokio::test]
    async fn test_tolerated_parse_failure_keeps_polling() {
        let dir = TempDir::new().unwrap();
        let domain = MemoryController::emulated(dir.path(), UsageSample::default())
            .create(4096)
            .unwrap();
        let usage = domain.path().join("memory.usage_in_bytes");
        fs::write(&usage, "n/a").unwrap();

        let fixer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fs::write(usage, "1024").unwrap();
        });

        let sample = fast(true).await_paging_transition(&domain).await.unwrap();
        assert_eq!(sample, UsageSample::new(1024, 0));
        fixer.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_counters_are_fatal_even_when_tolerant() {
        let dir = TempDir::new().unwrap();
        let domain = MemoryController::emulated(dir.path(), UsageSample::default())
            .create(4096)
            .unwrap();
        domain.remove().unwrap();

        let err = fast(true).await_paging_transition(&domain).await.unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
