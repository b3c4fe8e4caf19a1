//! Timeout and backoff configuration.

use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with additive jitter.
///
/// `duration(attempt, rng)` grows `min * 2^attempt` up to `max`, then adds a
/// uniform jitter in `[0, rand)`. `retries` bounds how many times a schedule
/// may fire before the caller gives up.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Base delay for the first attempt.
    pub min: Duration,
    /// Upper bound of the additive jitter.
    pub rand: Duration,
    /// Cap on the exponential base.
    pub max: Duration,
    /// Number of retries before the schedule is exhausted.
    pub retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(200),
            rand: Duration::from_millis(300),
            max: Duration::from_secs(60),
            retries: 7,
        }
    }
}

impl Backoff {
    /// Calculate the delay for a given attempt with jitter.
    #[must_use]
    pub fn duration(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = self.min.as_secs_f64() * 2f64.powi(attempt.cast_signed());
        let capped = base.min(self.max.as_secs_f64());
        let jitter = rng.random_range(0.0..self.rand.as_secs_f64().max(f64::EPSILON));
        Duration::from_secs_f64(capped + jitter)
    }
}

/// Process-wide timing configuration shared by every fiber.
#[derive(Debug, Clone)]
pub struct Config {
    /// Retry schedule for client-driven proposals.
    pub proposing_backoff: Backoff,
    /// Retry schedule for acceptor-initiated default proposals.
    pub confirming_backoff: Backoff,
    /// How long an acceptor deliberates before proposing its own default.
    pub deliberating_timeout: Duration,
    /// How long closed fibers stay resident before reclamation.
    pub closed_lifetime: Duration,
    /// Rouse schedule for scan batches.
    pub scan_backoff: Backoff,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proposing_backoff: Backoff::default(),
            confirming_backoff: Backoff::default(),
            deliberating_timeout: Duration::from_secs(2),
            closed_lifetime: Duration::from_secs(2),
            scan_backoff: Backoff::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = Backoff {
            min: Duration::from_millis(100),
            rand: Duration::from_millis(1),
            max: Duration::from_millis(500),
            retries: 7,
        };
        let mut rng = StdRng::seed_from_u64(7);

        let d0 = backoff.duration(0, &mut rng);
        let d2 = backoff.duration(2, &mut rng);
        let d9 = backoff.duration(9, &mut rng);

        assert!(d0 >= Duration::from_millis(100));
        assert!(d0 < Duration::from_millis(102));
        assert!(d2 >= Duration::from_millis(400));
        // 100ms * 2^9 is far beyond the cap.
        assert!(d9 <= Duration::from_millis(501));
    }
}
