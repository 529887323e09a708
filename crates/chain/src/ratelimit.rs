//! Rate limiter for free transaction relay.
//!
//! An exponentially decaying byte counter with a ten-minute half-life;
//! mitigates penny-flooding with zero-fee transactions.

use nucleod_consensus::constants::DEFAULT_LIMIT_FREE_RELAY;

pub struct FreeTxRateLimiter {
    free_count: f64,
    last_time: i64,
    /// `-limitfreerelay` value; unit is thousand-bytes per minute.
    limit: i64,
}

impl FreeTxRateLimiter {
    pub fn new(limit: i64) -> Self {
        Self {
            free_count: 0.0,
            last_time: 0,
            limit,
        }
    }

    pub fn with_default_limit() -> Self {
        Self::new(DEFAULT_LIMIT_FREE_RELAY)
    }

    pub fn current(&self) -> f64 {
        self.free_count
    }

    /// Decay the counter to `now`, then admit the transaction if the new
    /// total stays within the configured budget.
    pub fn allow(&mut self, size: usize, now: i64) -> bool {
        let elapsed = (now - self.last_time).max(0);
        self.free_count *= (1.0 - 1.0 / 600.0_f64).powi(elapsed.min(i32::MAX as i64) as i32);
        self.last_time = now;

        let next = self.free_count + size as f64;
        if next > (self.limit * 10 * 1_000) as f64 {
            return false;
        }
        nucleod_log::log_debug!("free relay counter {:.0} => {next:.0}", self.free_count);
        self.free_count = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_until_budget_consumed() {
        let mut limiter = FreeTxRateLimiter::new(15);
        let mut accepted = 0usize;
        for _ in 0..200 {
            if limiter.allow(1_000, 100) {
                accepted += 1;
            }
        }
        // Budget is 150_000 byte-units: exactly 150 kilobyte entries fit.
        assert_eq!(accepted, 150);
    }

    #[test]
    fn decays_with_half_life() {
        let mut limiter = FreeTxRateLimiter::new(15);
        while limiter.allow(1_000, 100) {}
        assert!(!limiter.allow(1_000, 100));

        // After ten minutes roughly a third of the counter remains.
        assert!(limiter.allow(1_000, 100 + 600));
        let expected = 150_000.0 * (1.0 - 1.0 / 600.0_f64).powi(600);
        assert!((limiter.current() - (expected + 1_000.0)).abs() < 1_000.0);
    }

    #[test]
    fn clock_reversal_does_not_grow_counter() {
        let mut limiter = FreeTxRateLimiter::new(1);
        assert!(limiter.allow(500, 1_000));
        assert!(limiter.allow(500, 900));
        assert!(limiter.current() >= 1_000.0);
    }
}
