use std::{net::IpAddr, time::Duration};

use dashmap::DashMap;
use tokio::time::Instant;

/// Per-client-IP token bucket. `burst` tokens are available immediately;
/// they refill at `per_second`. A rate of zero disables limiting.
///
/// Buckets for idle clients are pruned by a periodic sweep so the map stays
/// bounded under address churn.
pub struct ConnectionLimiter {
    buckets: DashMap<IpAddr, TokenBucket>,
    burst: f64,
    per_second: f64,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    touched: Instant,
}

impl ConnectionLimiter {
    pub fn new(burst: u32, per_second: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            burst: f64::from(burst.max(1)),
            per_second,
        }
    }

    pub fn disabled(&self) -> bool {
        self.per_second <= 0.0
    }

    /// Take one token for `ip`. Returns false when the bucket is empty; the
    /// caller drops the connection without reading from it.
    pub fn admit(&self, ip: IpAddr) -> bool {
        if self.disabled() {
            return true;
        }
        let now = Instant::now();
        let mut bucket = self.buckets.entry(ip).or_insert_with(|| TokenBucket {
            tokens: self.burst,
            touched: now,
        });
        let elapsed = now.saturating_duration_since(bucket.touched).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_second).min(self.burst);
        bucket.touched = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets untouched for longer than `idle`.
    pub fn prune(&self, idle: Duration) {
        let now = Instant::now();
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.touched) < idle);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.buckets.len()
    }
}
