use std::time::Duration;

use super::{Arbitration, Footprint, LaunchGate, LaunchStep, RaceStrategy, SizingInput};

/// Slack kept back from the second hog's half of the headroom.
const SECONDARY_MARGIN_BYTES: u64 = 4096;
/// Overshoot added to the near-exhaustion third hog.
const OVERSHOOT_KB: u64 = 32;

const PLAN: [LaunchStep; 3] = [
    LaunchStep::new("primary", LaunchGate::Immediate),
    LaunchStep::new("secondary", LaunchGate::Sample),
    LaunchStep::new("tertiary", LaunchGate::Sample),
];

/// Three hogs of graduated size; the third one's shape rotates with the worker id.
///
/// All footprints are two-class `(malloc_kb, mmap_kb)`. After the settle delay
/// every hog's /proc state is probed and then all three are killed.
#[derive(Debug, Clone)]
pub struct GraduatedRace {
    settle: Duration,
}

impl GraduatedRace {
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }

    fn tertiary(input: &SizingInput) -> Footprint {
        let headroom = input.headroom_bytes();
        match input.worker_id % 3 {
            0 => Footprint::split(0, (input.limit_bytes / 5) / 1024),
            1 => Footprint::split(headroom / 1024 + OVERSHOOT_KB, 0),
            _ => Footprint::split((headroom / 2) / 1024, 0),
        }
    }
}

impl RaceStrategy for GraduatedRace {
    fn name(&self) -> &'static str {
        "graduated"
    }

    fn launch_plan(&self) -> &[LaunchStep] {
        &PLAN
    }

    fn footprint(&self, step: usize, input: &SizingInput) -> Footprint {
        match step {
            0 => {
                let bulk = input.limit_kb() * 45 / 100;
                Footprint::split(bulk / 2, bulk - bulk / 2)
            }
            1 => {
                let half = input.headroom_bytes() / 2;
                Footprint::split(half.saturating_sub(SECONDARY_MARGIN_BYTES) / 1024, 0)
            }
            _ => Self::tertiary(input),
        }
    }

    fn arbitration(&self) -> Arbitration {
        Arbitration::ProbeThenKill {
            settle: self.settle,
        }
    }
}
