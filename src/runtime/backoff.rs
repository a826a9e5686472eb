use embassy_time::Duration;

use crate::client::ReconnectOptions;

/// Exponential reconnect delay with ±25 % jitter.
///
/// The delay starts at `initial_delay`, doubles after every attempt and is capped at
/// `max_delay`. Jitter comes from a small xorshift generator; it only has to keep a
/// fleet of devices from reconnecting in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    options: ReconnectOptions,
    attempt: u32,
    rng: u32,
}

impl Backoff {
    pub fn new(options: ReconnectOptions, seed: u32) -> Self {
        Self {
            options,
            attempt: 0,
            // xorshift never leaves zero
            rng: seed | 1,
        }
    }

    /// Starts a new series of attempts.
    pub fn reset(&mut self, options: ReconnectOptions) {
        self.options = options;
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The delay before the next attempt, or `None` once `max_attempts` is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.options.max_attempts
            && self.attempt >= max
        {
            return None;
        }
        let base = self.base_delay().as_millis();
        self.attempt += 1;

        let spread = base / 4;
        let jitter = if spread == 0 {
            0
        } else {
            self.next_random() as u64 % (2 * spread + 1)
        };
        Some(Duration::from_millis(base - spread + jitter))
    }

    fn base_delay(&self) -> Duration {
        let initial = self.options.initial_delay.as_millis();
        let max = self.options.max_delay.as_millis();
        let factor = 1u64.checked_shl(self.attempt).unwrap_or(u64::MAX);
        Duration::from_millis(initial.saturating_mul(factor).min(max))
    }

    fn next_random(&mut self) -> u32 {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng = x;
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(max_attempts: Option<u32>) -> ReconnectOptions {
        ReconnectOptions {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts,
        }
    }

    #[test]
    fn delays_double_within_jitter_bounds_and_cap() {
        let mut backoff = Backoff::new(options(None), 0xDEAD_BEEF);
        let expected_base = [1_000u64, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000];
        for base in expected_base {
            let delay = backoff.next_delay().unwrap().as_millis();
            assert!(
                delay >= base * 3 / 4 && delay <= base * 5 / 4,
                "{} outside ±25% of {}",
                delay,
                base
            );
        }
        assert_eq!(backoff.attempt(), 8);
    }

    #[test]
    fn attempts_are_capped() {
        let mut backoff = Backoff::new(options(Some(2)), 7);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());

        backoff.reset(options(Some(2)));
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(options(None), 1);
        backoff.attempt = 200;
        let delay = backoff.next_delay().unwrap().as_millis();
        assert!((45_000..=75_000).contains(&delay));
    }
}
