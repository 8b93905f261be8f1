use std::time::Duration;

/// Negative-feedback difficulty policy applied once per mined block.
///
/// Mining faster than half the target raises difficulty by one; mining slower
/// than twice the target lowers it by one. The result stays within `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DifficultyController {
    target: Duration,
    min: u32,
    max: u32,
}

impl DifficultyController {
    pub fn new(target: Duration, min: u32, max: u32) -> Self {
        DifficultyController { target, min, max }
    }

    pub fn target(&self) -> Duration {
        self.target
    }

    /// Difficulty for the next block given how long the last one took
    pub fn adjust(&self, current: u32, last_mining_time: Duration) -> u32 {
        if last_mining_time < self.target / 2 && current < self.max {
            current + 1
        } else if last_mining_time > self.target * 2 && current > self.min {
            current - 1
        } else {
            current
        }
    }
}
