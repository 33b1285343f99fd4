use std::time::Duration;

use super::{Arbitration, Footprint, LaunchGate, LaunchStep, RaceStrategy, SizingInput};

/// Slack added to the remainder so the second hog overshoots the limit.
pub(super) const REMAINDER_MARGIN_BYTES: u64 = 4096;

/// Footprint of the first hog: 95% of the limit.
pub(super) fn bulk_kb(input: &SizingInput) -> u64 {
    input.limit_kb() * 19 / 20
}

/// Observed headroom plus the margin, in KB.
pub(super) fn remainder_kb(input: &SizingInput) -> u64 {
    input.headroom_bytes().saturating_add(REMAINDER_MARGIN_BYTES) / 1024
}

const PLAN: [LaunchStep; 2] = [
    LaunchStep::new("hog", LaunchGate::Immediate),
    LaunchStep::new("remainder", LaunchGate::PagingTransition),
];

/// Bulk hog, then a remainder hog once paging starts, raced against a timeout
#[derive(Debug, Clone)]
pub struct BinaryRace {
    timeout: Duration,
}

impl BinaryRace {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl RaceStrategy for BinaryRace {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn launch_plan(&self) -> &[LaunchStep] {
        &PLAN
    }

    fn footprint(&self, step: usize, input: &SizingInput) -> Footprint {
        match step {
            0 => Footprint::single(bulk_kb(input)),
            _ => Footprint::single(remainder_kb(input)),
        }
    }

    fn arbitration(&self) -> Arbitration {
        Arbitration::FirstExit {
            timeout: Some(self.timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oomrace_cgroups::UsageSample;

    const LIMIT: u64 = 104_857_600;

    #[test]
    fn test_bulk_is_95_percent_of_limit() {
        let strategy = BinaryRace::new(Duration::from_secs(5));
        let input = SizingInput {
            limit_bytes: LIMIT,
            worker_id: 0,
            sample: None,
        };
        assert_eq!(strategy.footprint(0, &input), Footprint::single(97_280));
    }

    #[test]
    fn test_remainder_from_observed_usage() {
        let strategy = BinaryRace::new(Duration::from_secs(5));
        let input = SizingInput {
            limit_bytes: LIMIT,
            worker_id: 0,
            sample: Some(UsageSample::new(100_000_000, 104_857_600)),
        };
        let footprint = strategy.footprint(1, &input);
        assert_eq!(footprint.args(), vec!["4".to_string()]);
    }

    #[test]
    fn test_remainder_uses_memsw_not_resident() {
        let input = SizingInput {
            limit_bytes: LIMIT,
            worker_id: 0,
            sample: Some(UsageSample::new(50_000_000, 100_000_000)),
        };
        assert_eq!(remainder_kb(&input), (LIMIT - 100_000_000 + 4096) / 1024);
    }

    #[test]
    fn test_remainder_saturates_above_limit() {
        let input = SizingInput {
            limit_bytes: LIMIT,
            worker_id: 0,
            sample: Some(UsageSample::new(LIMIT, LIMIT + 1_000_000)),
        };
        assert_eq!(remainder_kb(&input), 4);
    }

    #[test]
    fn test_remainder_with_unlimited_limit() {
        let input = SizingInput {
            limit_bytes: u64::MAX,
            worker_id: 0,
            sample: Some(UsageSample::new(0, 0)),
        };
        assert_eq!(remainder_kb(&input), u64::MAX / 1024);
        assert_eq!(bulk_kb(&input), u64::MAX / 1024 * 19 / 20);
    }

    #[test]
    fn test_plan_gates_remainder_on_paging() {
        let strategy = BinaryRace::new(Duration::from_secs(5));
        let gates: Vec<_> = strategy.launch_plan().iter().map(|s| s.gate).collect();
        assert_eq!(gates, vec![LaunchGate::Immediate, LaunchGate::PagingTransition]);
        assert_eq!(
            strategy.arbitration(),
            Arbitration::FirstExit {
                timeout: Some(Duration::from_secs(5))
            }
        );
    }
}
