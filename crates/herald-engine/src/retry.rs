use std::time::Duration;

use rand::Rng;

/// Backoff settings for destination sends.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random.
    pub jitter_factor: f64,
    /// Thread re-creations allowed per event after a missing-thread error.
    pub max_thread_repairs: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.2,
            max_thread_repairs: 1,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based). A server-suggested
    /// delay wins over the computed backoff, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(d) = suggested {
            return d.min(self.max_delay);
        }
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        if self.jitter_factor <= 0.0 {
            return exp;
        }
        let jitter = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        let ms = exp.as_millis() as f64 * (1.0 + jitter);
        Duration::from_millis(ms.max(0.0) as u64).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn exponential_growth_capped() {
        let p = no_jitter();
        assert_eq!(p.delay_for(0, None), Duration::from_secs(2));
        assert_eq!(p.delay_for(1, None), Duration::from_secs(4));
        assert_eq!(p.delay_for(2, None), Duration::from_secs(8));
        assert_eq!(p.delay_for(10, None), Duration::from_secs(60));
    }

    #[test]
    fn suggested_delay_wins() {
        let p = no_jitter();
        assert_eq!(p.delay_for(0, Some(Duration::from_secs(7))), Duration::from_secs(7));
        assert_eq!(p.delay_for(0, Some(Duration::from_secs(600))), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_in_band() {
        let p = RetryPolicy::default();
        for _ in 0..100 {
            let d = p.delay_for(1, None);
            assert!(d >= Duration::from_millis(3199) && d <= Duration::from_millis(4800));
        }
    }
}
