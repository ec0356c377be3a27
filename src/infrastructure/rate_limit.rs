use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

/// Per-user token bucket guarding query submission. Capacity and refill rate
/// both come from `rate_limit.query_rps`; a zero rate disables the limiter.
pub struct QueryRateLimiter {
    rate_per_sec: f64,
    buckets: Mutex<HashMap<Uuid, Bucket>>,
}

struct Bucket {
    tokens: f64,
    refreshed_at: Instant,
}

impl QueryRateLimiter {
    pub fn new(query_rps: u32) -> Self {
        Self {
            rate_per_sec: f64::from(query_rps),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Takes one token for the user; `false` means the caller should back off.
    pub fn try_acquire(&self, user_id: Uuid) -> bool {
        if self.rate_per_sec <= 0.0 {
            return true;
        }

        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(user_id).or_insert(Bucket {
            tokens: self.rate_per_sec,
            refreshed_at: now,
        });

        let elapsed = now.duration_since(bucket.refreshed_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.rate_per_sec);
        bucket.refreshed_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_up_to_rate_then_denies() {
        let limiter = QueryRateLimiter::new(3);
        let user = Uuid::new_v4();

        assert!(limiter.try_acquire(user));
        assert!(limiter.try_acquire(user));
        assert!(limiter.try_acquire(user));
        assert!(!limiter.try_acquire(user));
    }

    #[test]
    fn users_have_independent_buckets() {
        let limiter = QueryRateLimiter::new(1);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(limiter.try_acquire(a));
        assert!(!limiter.try_acquire(a));
        assert!(limiter.try_acquire(b));
    }

    #[test]
    fn zero_rate_disables_limiting() {
        let limiter = QueryRateLimiter::new(0);
        let user = Uuid::new_v4();
        for _ in 0..100 {
            assert!(limiter.try_acquire(user));
        }
    }
}
