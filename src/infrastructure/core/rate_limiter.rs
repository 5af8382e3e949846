//! Per-broker token-bucket admission control.
//!
//! Bucket size and refill rate come from the broker profile. Waiters
//! queue on a fair async mutex, so acquisition is FIFO per broker; the
//! caller's deadline bounds the wait and an expired deadline never
//! consumes a token.

use crate::domain::broker::{BrokerKind, profile};
use crate::domain::errors::BrokerApiError;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

pub struct RateLimiter {
    buckets: [Mutex<Bucket>; 6],
}

fn bucket_index(kind: BrokerKind) -> usize {
    match kind {
        BrokerKind::Zerodha => 0,
        BrokerKind::Upstox => 1,
        BrokerKind::AngelOne => 2,
        BrokerKind::IciciDirect => 3,
        BrokerKind::Fyers => 4,
        BrokerKind::Iifl => 5,
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        let buckets = BrokerKind::ALL.map(|kind| {
            let rate = profile(kind).rate_limit_per_sec as f64;
            Mutex::new(Bucket {
                capacity: rate,
                tokens: rate,
                refill_per_sec: rate,
                last_refill: Instant::now(),
            })
        });
        Self { buckets }
    }

    /// Take one token for `kind`, waiting until `deadline` at most.
    pub async fn acquire(&self, kind: BrokerKind, deadline: Instant) -> Result<(), BrokerApiError> {
        let bucket = &self.buckets[bucket_index(kind)];

        let wait_for_token = async {
            // The guard is held across the sleep: waiters behind us stay
            // queued in arrival order.
            let mut b = bucket.lock().await;
            b.refill(Instant::now());
            if b.tokens >= 1.0 {
                b.tokens -= 1.0;
                return;
            }
            let needed = 1.0 - b.tokens;
            let wait = Duration::from_secs_f64(needed / b.refill_per_sec);
            tokio::time::sleep(wait).await;
            b.refill(Instant::now());
            b.tokens = (b.tokens - 1.0).max(0.0);
        };

        tokio::time::timeout_at(deadline, wait_for_token)
            .await
            .map_err(|_| BrokerApiError::RateLimited { broker: kind })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
