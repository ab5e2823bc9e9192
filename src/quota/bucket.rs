//! Token bucket used for per-workspace rate limits.

use std::time::Instant;

/// Classic token bucket: `rate` tokens per second, burst of one second's
/// refill (minimum one token).
#[derive(Clone, Debug)]
pub(super) struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    pub(super) fn new(rate: f64) -> Self {
        let burst = rate.max(1.0);
        Self {
            rate,
            burst,
            tokens: burst,
            refilled_at: Instant::now(),
        }
    }

    /// Takes one token if available.
    pub(super) fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.refilled_at = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_exhaustion() {
        let mut bucket = TokenBucket::new(2.0);
        let now = Instant::now();
        assert!(bucket.try_take(now));
        assert!(bucket.try_take(now));
        assert!(!bucket.try_take(now));
    }

    #[test]
    fn test_refill_restores_tokens() {
        let mut bucket = TokenBucket::new(2.0);
        let now = Instant::now();
        assert!(bucket.try_take(now));
        assert!(bucket.try_take(now));
        assert!(bucket.try_take(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_low_rate_still_allows_one() {
        let mut bucket = TokenBucket::new(0.5);
        let now = Instant::now();
        assert!(bucket.try_take(now));
        assert!(!bucket.try_take(now));
    }
}
