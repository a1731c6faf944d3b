//! Exponential backoff with jitter for transient broker errors (§7.2). A worker that
//! hits a transport failure doesn't hammer the broker in a tight loop: each retry waits
//! longer than the last, with random jitter so a fleet of workers that all lost the
//! connection at once don't reconnect in lockstep.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    /// Returns the delay for the next attempt and advances internal state.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.as_millis().saturating_mul(1u128 << self.attempt.min(16));
        let capped = exp.min(self.max.as_millis());
        self.attempt = self.attempt.saturating_add(1);

        let jittered = rand::thread_rng().gen_range(capped / 2..=capped.max(1));
        Duration::from_millis(jittered as u64)
    }

    /// Resets the attempt counter after a successful operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}
