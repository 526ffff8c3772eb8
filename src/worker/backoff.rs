use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with jitter.
///
/// Retries never run out: a lock held by a slow peer or an unreachable remote
/// is retried until it clears or the worker is told to stop.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max.max(initial),
            current_attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Delay before the next retry; grows until `max_delay`.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.current_attempt.min(16));
        let base = self.initial_delay.saturating_mul(factor).min(self.max_delay);
        self.current_attempt = self.current_attempt.saturating_add(1);

        // Up to 25% jitter so competing workers do not retry in lockstep.
        let jitter_ms = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        let delay = base.saturating_sub(jitter);

        log::warn!(
            "⏳ Retry attempt {} in {:?}",
            self.current_attempt,
            delay
        );
        delay
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
