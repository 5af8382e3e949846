//! Caching decorator over an `FxOracle`. Rates are held for 15 minutes;
//! an unknown pair is remembered as unknown for the same period so a dead
//! upstream is not hammered.

use crate::domain::ports::FxOracle;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct CacheEntry {
    rate: Option<Decimal>,
    fetched_at: DateTime<Utc>,
}

pub struct CachingFxOracle {
    inner: Arc<dyn FxOracle>,
    ttl: Duration,
    cache: RwLock<HashMap<(String, String), CacheEntry>>,
}

impl CachingFxOracle {
    pub fn new(inner: Arc<dyn FxOracle>) -> Self {
        Self {
            inner,
            ttl: Duration::minutes(15),
            cache: RwLock::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_ttl(inner: Arc<dyn FxOracle>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl FxOracle for CachingFxOracle {
    async fn rate(&self, from: &str, to: &str) -> Option<Decimal> {
        if from == to {
            return Some(Decimal::ONE);
        }
        let key = (from.to_string(), to.to_string());
        let now = Utc::now();

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&key) {
                if now - entry.fetched_at < self.ttl {
                    return entry.rate;
                }
            }
        }

        let rate = self.inner.rate(from, to).await;
        self.cache.write().await.insert(
            key,
            CacheEntry {
                rate,
                fetched_at: now,
            },
        );
        rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOracle {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FxOracle for CountingOracle {
        async fn rate(&self, from: &str, _to: &str) -> Option<Decimal> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if from == "USD" { Some(dec!(83.20)) } else { None }
        }
    }

    #[tokio::test]
    async fn second_hit_is_served_from_cache() {
        let inner = Arc::new(CountingOracle {
            calls: AtomicUsize::new(0),
        });
        let cached = CachingFxOracle::new(inner.clone());

        assert_eq!(cached.rate("USD", "INR").await, Some(dec!(83.20)));
        assert_eq!(cached.rate("USD", "INR").await, Some(dec!(83.20)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_pair_is_cached_too() {
        let inner = Arc::new(CountingOracle {
            calls: AtomicUsize::new(0),
        });
        let cached = CachingFxOracle::new(inner.clone());

        assert_eq!(cached.rate("XYZ", "INR").await, None);
        assert_eq!(cached.rate("XYZ", "INR").await, None);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn identity_pair_needs_no_oracle() {
        let inner = Arc::new(CountingOracle {
            calls: AtomicUsize::new(0),
        });
        let cached = CachingFxOracle::with_ttl(inner.clone(), Duration::minutes(1));
        assert_eq!(cached.rate("INR", "INR").await, Some(Decimal::ONE));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
    }
}
