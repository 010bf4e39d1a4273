use std::time::Duration;

use rand::Rng;

/// Exponential retry schedule: `base * 2^(attempt-1)`, capped, with
/// symmetric jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the delay added or removed at random
    pub jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before the next try, after `attempt` failed attempts (1-based).
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        if self.jitter == 0.0 {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        nominal.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_up_to_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);
        let delays: Vec<u64> = (1..=8).map(|a| backoff.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(backoff.nominal(500), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(600), 0.2);
        for _ in 0..100 {
            let delay = backoff.delay(1);
            assert!(delay >= Duration::from_secs(8) && delay <= Duration::from_secs(12));
        }
    }
}
