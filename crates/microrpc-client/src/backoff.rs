use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;

/// Attempts beyond this return the ceiling directly.
pub const MAX_EXPONENT_ATTEMPT: u32 = 10;

/// Exponential backoff: `min(min_delay * factor^attempt, max_delay)`.
///
/// Every call to [`Backoff::duration`] advances an internal attempt counter,
/// so one instance describes one retry sequence.
#[derive(Debug)]
pub struct Backoff {
    min_delay: Duration,
    max_delay: Duration,
    factor: f64,
    jitter: f64,
    attempt: AtomicU32,
}

impl Backoff {
    pub fn new(min_delay: Duration, max_delay: Duration, factor: f64) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            factor: if factor.is_finite() && factor >= 1.0 { factor } else { 1.0 },
            jitter: 0.0,
            attempt: AtomicU32::new(0),
        }
    }

    /// Spreads each delay by up to `fraction` of its value in either
    /// direction. The result still never exceeds the ceiling.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Delay for the current attempt; advances the attempt counter.
    pub fn duration(&self) -> Duration {
        let attempt = self.attempt.fetch_add(1, Ordering::Relaxed);
        self.for_attempt(attempt)
    }

    /// Delay for `attempt` without touching the counter.
    pub fn for_attempt(&self, attempt: u32) -> Duration {
        if attempt > MAX_EXPONENT_ATTEMPT {
            return self.max_delay;
        }
        let max = self.max_delay.as_secs_f64();
        let mut secs = (self.min_delay.as_secs_f64() * self.factor.powi(attempt as i32)).min(max);
        if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            secs = (secs * (1.0 + spread)).clamp(0.0, max);
        }
        Duration::from_nanos((secs * 1e9).round() as u64)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.attempt.store(0, Ordering::Relaxed);
    }
}

impl Default for Backoff {
    /// 100 ms unit, factor `e`, capped at two minutes.
    fn default() -> Self {
        Backoff::new(
            Duration::from_millis(100),
            Duration::from_secs(120),
            std::f64::consts::E,
        )
    }
}

impl Clone for Backoff {
    fn clone(&self) -> Self {
        Self {
            min_delay: self.min_delay,
            max_delay: self.max_delay,
            factor: self.factor,
            jitter: self.jitter,
            attempt: AtomicU32::new(self.attempt()),
        }
    }
}
