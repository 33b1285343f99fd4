use super::binary::bulk_kb;
use super::{Arbitration, Footprint, LaunchGate, LaunchStep, RaceStrategy, SizingInput};

const PLAN: [LaunchStep; 2] = [
    LaunchStep::new("hog", LaunchGate::Immediate),
    LaunchStep::new("remainder", LaunchGate::PagingTransition),
];

/// Two hogs that deliberately leave `breathing_room_kb` unused, then run to completion
#[derive(Debug, Clone)]
pub struct BreathingRoom {
    breathing_room_kb: u64,
}

impl BreathingRoom {
    pub fn new(breathing_room_kb: u64) -> Self {
        Self { breathing_room_kb }
    }
}

impl RaceStrategy for BreathingRoom {
    fn name(&self) -> &'static str {
        "breathing"
    }

    fn launch_plan(&self) -> &[LaunchStep] {
        &PLAN
    }

    fn footprint(&self, step: usize, input: &SizingInput) -> Footprint {
        match step {
            0 => Footprint::single(bulk_kb(input)),
            _ => Footprint::single(
                (input.headroom_bytes() / 1024).saturating_sub(self.breathing_room_kb),
            ),
        }
    }

    fn arbitration(&self) -> Arbitration {
        Arbitration::AwaitAll
    }
}
