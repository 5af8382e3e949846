//! Per-broker HTTP client pool and the fixed request pipeline: static
//! headers, auth header per broker scheme, generated request id, rate-
//! limiter gate, response logging.
//!
//! Clients are built lazily per broker and cached; cache entries are
//! immutable once inserted. Access tokens are call parameters and are
//! never stored on the pool.

use crate::domain::broker::{BrokerKind, TimeoutClass, profile};
use crate::domain::errors::BrokerApiError;
use crate::infrastructure::core::rate_limiter::RateLimiter;
use rand::Rng;
use reqwest::{Client, Method};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("tradegate/", env!("CARGO_PKG_VERSION"));

/// One authenticated broker API call.
pub struct ApiCall<'a> {
    pub method: Method,
    pub url: String,
    /// Decrypted access token; absent for unauthenticated calls.
    pub access_token: Option<&'a str>,
    /// Broker app key, required by Zerodha and Angel One header schemes.
    pub api_key: Option<&'a str>,
    pub json: Option<serde_json::Value>,
    pub form: Option<Vec<(String, String)>>,
}

impl<'a> ApiCall<'a> {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            access_token: None,
            api_key: None,
            json: None,
            form: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            ..Self::get(url)
        }
    }

    pub fn with_token(mut self, token: &'a str) -> Self {
        self.access_token = Some(token);
        self
    }

    pub fn with_api_key(mut self, key: &'a str) -> Self {
        self.api_key = Some(key);
        self
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }

    pub fn with_form(mut self, form: Vec<(String, String)>) -> Self {
        self.form = Some(form);
        self
    }
}

pub struct HttpClientPool {
    clients: RwLock<HashMap<BrokerKind, ClientWithMiddleware>>,
    limiter: Arc<RateLimiter>,
}

impl HttpClientPool {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            limiter,
        }
    }

    fn build_client(kind: BrokerKind) -> ClientWithMiddleware {
        let (connect, total) = match profile(kind).timeout_class {
            TimeoutClass::Fast => (Duration::from_secs(30), Duration::from_secs(45)),
            TimeoutClass::Slow => (Duration::from_secs(45), Duration::from_secs(90)),
        };

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = Client::builder()
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(600))
            .connect_timeout(connect)
            .timeout(total)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build()
    }

    /// Cached client for `kind`, built on first use. Double-checked so
    /// concurrent first callers race benignly; the first inserted entry
    /// wins and entries never mutate afterwards.
    pub async fn client(&self, kind: BrokerKind) -> ClientWithMiddleware {
        {
            let cache = self.clients.read().await;
            if let Some(c) = cache.get(&kind) {
                return c.clone();
            }
        }
        let mut cache = self.clients.write().await;
        cache
            .entry(kind)
            .or_insert_with(|| Self::build_client(kind))
            .clone()
    }

    /// Evict the cached client; pooled connections close as handles drop.
    pub async fn invalidate(&self, kind: BrokerKind) {
        self.clients.write().await.remove(&kind);
    }

    /// Execute `call` through the full pipeline. Returns the response only
    /// for 2xx; everything else is a classified `BrokerApiError`.
    pub async fn execute(
        &self,
        kind: BrokerKind,
        call: ApiCall<'_>,
        deadline: tokio::time::Instant,
    ) -> Result<reqwest::Response, BrokerApiError> {
        let client = self.client(kind).await;
        let method = call.method.clone();
        let url = call.url.clone();

        let mut rb = client.request(call.method, &call.url);

        // 1. Broker-specific static headers.
        rb = rb.header("User-Agent", USER_AGENT).header("Accept", "application/json");
        if kind == BrokerKind::Zerodha {
            rb = rb.header("X-Kite-Version", "3");
        }

        // 2. Auth header per broker scheme.
        if let Some(token) = call.access_token {
            rb = match kind {
                BrokerKind::Zerodha => rb.header(
                    "Authorization",
                    format!("token {}:{}", call.api_key.unwrap_or_default(), token),
                ),
                BrokerKind::AngelOne => rb
                    .header("Authorization", format!("Bearer {}", token))
                    .header("X-PrivateKey", call.api_key.unwrap_or_default())
                    .header("X-SourceID", "WEB")
                    .header("X-UserType", "USER")
                    .header("X-ClientLocalIP", "127.0.0.1")
                    .header("X-ClientPublicIP", "127.0.0.1")
                    .header("X-MACAddress", "00:00:00:00:00:00"),
                _ => rb.header("Authorization", format!("Bearer {}", token)),
            };
        }

        // 3. Generated per-request id.
        let request_id = request_id();
        rb = rb.header("X-Request-Id", &request_id);

        if let Some(body) = call.json {
            rb = rb.json(&body);
        }
        if let Some(form) = call.form {
            rb = rb.form(&form);
        }

        // 4. Rate-limiter gate; an expired deadline fails before any I/O.
        self.limiter.acquire(kind, deadline).await?;

        let started = tokio::time::Instant::now();
        let response = tokio::time::timeout_at(deadline, rb.send())
            .await
            .map_err(|_| BrokerApiError::DeadlineExceeded { broker: kind })?
            .map_err(|e| BrokerApiError::Transport {
                broker: kind,
                reason: e.to_string(),
            })?;

        // 5. Response logging.
        let status = response.status();
        debug!(
            broker = %kind,
            %method,
            %url,
            status = status.as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            %request_id,
            "broker API call"
        );

        if status.is_success() {
            return Ok(response);
        }

        let body = truncate(&response.text().await.unwrap_or_default(), 300);
        warn!(broker = %kind, %url, status = status.as_u16(), body = %body, "broker API error");

        Err(match status.as_u16() {
            401 | 403 => BrokerApiError::Auth {
                broker: kind,
                reason: body,
            },
            429 => BrokerApiError::RateLimited { broker: kind },
            s if s >= 500 => BrokerApiError::Transport {
                broker: kind,
                reason: format!("HTTP {}: {}", s, body),
            },
            s => BrokerApiError::Broker {
                broker: kind,
                reason: format!("HTTP {}: {}", s, body),
            },
        })
    }
}

fn request_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("TM-{}-{}", chrono::Utc::now().timestamp_millis(), suffix)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_have_the_documented_shape() {
        let id = request_id();
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts[0], "TM");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 16);
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "αβγδε";
        let t = truncate(s, 3);
        assert!(t.starts_with('α'));
    }
}
