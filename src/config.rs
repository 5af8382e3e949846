use crate::domain::broker::BrokerKind;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;

/// OAuth app credentials for one broker.
#[derive(Debug, Clone)]
pub struct BrokerCredentials {
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Master secret for the credential vault; the 256-bit key is derived
    /// from it. Required in production.
    pub vault_master_secret: Option<String>,
    pub broker_credentials: HashMap<BrokerKind, BrokerCredentials>,

    pub token_refresh_threshold_minutes: i64,
    pub probe_interval_secs: u64,
    pub probe_concurrency: usize,
    pub portfolio_cache_ttl_secs: u64,
    pub fetch_deadline_ms: u64,
    pub order_deadline_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut broker_credentials = HashMap::new();
        for kind in BrokerKind::ALL {
            let prefix = kind.as_str().to_uppercase();
            let key = env::var(format!("{}_API_KEY", prefix)).ok();
            let secret = env::var(format!("{}_API_SECRET", prefix)).ok();
            if let (Some(api_key), Some(api_secret)) = (key, secret) {
                broker_credentials.insert(kind, BrokerCredentials { api_key, api_secret });
            }
        }

        Ok(Self {
            vault_master_secret: env::var("VAULT_MASTER_SECRET").ok(),
            broker_credentials,
            token_refresh_threshold_minutes: parse_env("TOKEN_REFRESH_THRESHOLD_MINUTES", 10)?,
            probe_interval_secs: parse_env("PROBE_INTERVAL_SECS", 300)?,
            probe_concurrency: parse_env("PROBE_CONCURRENCY", 16)?,
            portfolio_cache_ttl_secs: parse_env("PORTFOLIO_CACHE_TTL_SECS", 30)?,
            fetch_deadline_ms: parse_env("FETCH_DEADLINE_MS", 2000)?,
            order_deadline_ms: parse_env("ORDER_DEADLINE_MS", 10_000)?,
        })
    }

    /// Defaults with no environment access; used by tests.
    pub fn for_tests() -> Self {
        Self {
            vault_master_secret: Some("test-master-secret".to_string()),
            broker_credentials: HashMap::new(),
            token_refresh_threshold_minutes: 10,
            probe_interval_secs: 300,
            probe_concurrency: 16,
            portfolio_cache_ttl_secs: 30,
            fetch_deadline_ms: 2000,
            order_deadline_ms: 10_000,
        }
    }

    pub fn credentials(&self, kind: BrokerKind) -> Option<&BrokerCredentials> {
        self.broker_credentials.get(&kind)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {}: {}", key, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_documented_values() {
        let cfg = Config::for_tests();
        assert_eq!(cfg.token_refresh_threshold_minutes, 10);
        assert_eq!(cfg.probe_interval_secs, 300);
        assert_eq!(cfg.portfolio_cache_ttl_secs, 30);
        assert_eq!(cfg.fetch_deadline_ms, 2000);
    }
}
