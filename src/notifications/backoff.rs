use std::time::Duration;

/// Exponential backoff between a floor and a ceiling.
///
/// The floor is also the minimum spacing between two sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// delay = min(max(2 × delay, retry_after), ceiling)
    pub fn on_throttle(&mut self, retry_after: Duration) -> Duration {
        self.current = self.current.saturating_mul(2).max(retry_after).min(self.ceiling);
        self.current
    }

    pub fn on_success(&mut self) {
        self.current = self.floor;
    }
}
