use super::binary::{bulk_kb, remainder_kb};
use super::{Arbitration, Footprint, LaunchGate, LaunchStep, RaceStrategy, SizingInput};

const PLAN: [LaunchStep; 2] = [
    LaunchStep::new("hog", LaunchGate::Immediate),
    LaunchStep::new("remainder", LaunchGate::Sample),
];

/// Binary race sizing without the paging barrier or the timeout.
///
/// The remainder is sized from whatever the domain shows one poll after the
/// bulk hog starts, and the race only ends on the first exit.
#[derive(Debug, Clone, Default)]
pub struct ImmediateRace;

impl ImmediateRace {
    pub fn new() -> Self {
        Self
    }
}

impl RaceStrategy for ImmediateRace {
    fn name(&self) -> &'static str {
        "immediate"
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
        Arbitration::FirstExit { timeout: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oomrace_cgroups::UsageSample;

    #[test]
    fn test_sizes_like_binary_race() {
        let strategy = ImmediateRace::new();
        let input = SizingInput {
            limit_bytes: 104_857_600,
            worker_id: 3,
            sample: Some(UsageSample::new(90_000_000, 90_000_000)),
        };
        assert_eq!(strategy.footprint(0, &input), Footprint::single(97_280));
        assert_eq!(
            strategy.footprint(1, &input),
            Footprint::single((104_857_600 - 90_000_000 + 4096) / 1024)
        );
    }

    #[test]
    fn test_unlimited_domain_with_empty_counters() {
        let strategy = ImmediateRace::new();
        let input = SizingInput {
            limit_bytes: u64::MAX,
            worker_id: 0,
            sample: Some(UsageSample::new(0, 0)),
        };
        assert_eq!(strategy.footprint(1, &input), Footprint::single(u64::MAX / 1024));
    }

    #[test]
    fn test_no_barrier_and_no_timeout() {
        let strategy = ImmediateRace::new();
        assert!(strategy
            .launch_plan()
            .iter()
            .all(|step| step.gate != LaunchGate::PagingTransition));
        assert_eq!(strategy.arbitration(), Arbitration::FirstExit { timeout: None });
    }
}
