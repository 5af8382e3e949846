//! OAuth coordination: authorization URLs with CSRF state binding, code
//! exchange (including the Zerodha signed session exchange), token
//! refresh, and cheap validity probes.
//!
//! States are single-use, expire after ten minutes, and are bound to the
//! `(user, broker)` pair they were issued for. Brokers whose login flow
//! cannot be driven server-side report `NotImplementedForBroker`; their
//! connections are created from externally supplied tokens instead.

use crate::config::BrokerCredentials;
use crate::domain::broker::{BrokerKind, profile};
use crate::domain::connection::TokenSet;
use crate::domain::errors::{AuthError, BrokerApiError, OpClass};
use crate::domain::ports::AuthProvider;
use crate::infrastructure::core::circuit_breaker::CircuitBreakerRegistry;
use crate::infrastructure::core::http::{ApiCall, HttpClientPool};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const STATE_TTL_MINUTES: i64 = 10;
const OAUTH_CALL_BUDGET: std::time::Duration = std::time::Duration::from_secs(30);

struct PendingState {
    user_id: String,
    kind: BrokerKind,
    issued_at: DateTime<Utc>,
}

pub struct OAuthCoordinator {
    pool: Arc<HttpClientPool>,
    breakers: Arc<CircuitBreakerRegistry>,
    credentials: HashMap<BrokerKind, BrokerCredentials>,
    states: Mutex<HashMap<String, PendingState>>,
}

/// Standard token-endpoint response body; brokers that omit fields get
/// the documented defaults.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KiteSessionEnvelope {
    data: KiteSession,
}

#[derive(Debug, Deserialize)]
struct KiteSession {
    access_token: String,
}

impl TokenResponse {
    fn into_token_set(self) -> TokenSet {
        TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".into()),
            expires_in: self.expires_in.unwrap_or(3600),
            scope: self.scope,
            issued_at: Utc::now(),
        }
    }
}

/// Kite session exchange signature: hex HMAC-SHA256 over
/// `api_key + request_token + api_secret`, keyed by the API secret.
pub(crate) fn zerodha_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(api_secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(api_key.as_bytes());
    mac.update(request_token.as_bytes());
    mac.update(api_secret.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

impl OAuthCoordinator {
    pub fn new(
        pool: Arc<HttpClientPool>,
        breakers: Arc<CircuitBreakerRegistry>,
        credentials: HashMap<BrokerKind, BrokerCredentials>,
    ) -> Self {
        Self {
            pool,
            breakers,
            credentials,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn creds(&self, kind: BrokerKind) -> Result<&BrokerCredentials, AuthError> {
        self.credentials
            .get(&kind)
            .ok_or(AuthError::MissingCredentials { broker: kind })
    }

    /// Authorization URL with a freshly registered CSRF state of shape
    /// `<uuid>_<userId>_<kind>`.
    pub async fn build_auth_url(
        &self,
        user_id: &str,
        kind: BrokerKind,
        redirect_uri: &str,
    ) -> Result<Url, AuthError> {
        let creds = self.creds(kind)?;
        let p = profile(kind);

        let state = format!("{}_{}_{}", Uuid::new_v4(), user_id, kind);
        {
            let mut states = self.states.lock().await;
            states.retain(|_, s| Utc::now() - s.issued_at < Duration::minutes(STATE_TTL_MINUTES));
            states.insert(
                state.clone(),
                PendingState {
                    user_id: user_id.to_string(),
                    kind,
                    issued_at: Utc::now(),
                },
            );
        }

        let mut url = Url::parse(p.authorize_url).map_err(|e| AuthError::Exchange {
            broker: kind,
            reason: format!("invalid authorize url: {}", e),
        })?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &creds.api_key)
                .append_pair("redirect_uri", redirect_uri);
            if !p.scope.is_empty() {
                query.append_pair("scope", p.scope);
            }
            query.append_pair("state", &state);
        }
        Ok(url)
    }

    /// Redeem a state exactly once; unknown, reused or expired states are
    /// rejected.
    async fn consume_state(&self, state: &str, kind: BrokerKind) -> Result<String, AuthError> {
        let mut states = self.states.lock().await;
        let pending = states.remove(state).ok_or(AuthError::InvalidState)?;
        if Utc::now() - pending.issued_at >= Duration::minutes(STATE_TTL_MINUTES) {
            return Err(AuthError::InvalidState);
        }
        if pending.kind != kind {
            return Err(AuthError::InvalidState);
        }
        Ok(pending.user_id)
    }

    /// Exchange an authorization code for tokens. Returns the owning user
    /// id recovered from the state alongside the token set.
    pub async fn exchange_code(
        &self,
        kind: BrokerKind,
        code: &str,
        state: &str,
        redirect_uri: &str,
    ) -> Result<(String, TokenSet), AuthError> {
        let user_id = self.consume_state(state, kind).await?;

        let tokens = match kind {
            BrokerKind::Zerodha => self.exchange_zerodha(code).await?,
            BrokerKind::Upstox => self.exchange_upstox(code, redirect_uri).await?,
            other => {
                return Err(AuthError::NotImplementedForBroker {
                    broker: other,
                    operation: "exchange_code",
                });
            }
        };

        info!(broker = %kind, user_id = %user_id, "authorization code exchanged");
        Ok((user_id, tokens))
    }

    async fn exchange_zerodha(&self, request_token: &str) -> Result<TokenSet, AuthError> {
        let kind = BrokerKind::Zerodha;
        let creds = self.creds(kind)?;
        let checksum = zerodha_checksum(&creds.api_key, request_token, &creds.api_secret);

        let form = vec![
            ("api_key".to_string(), creds.api_key.clone()),
            ("request_token".to_string(), request_token.to_string()),
            ("checksum".to_string(), checksum),
        ];

        let call = ApiCall::post(profile(kind).token_url).with_form(form);
        let session: KiteSessionEnvelope = self.token_endpoint_call(kind, call).await?;

        // Kite sessions have no refresh token and lapse at the next
        // exchange day boundary; eight hours is the conservative bound.
        Ok(TokenSet {
            access_token: session.data.access_token,
            refresh_token: None,
            token_type: "token".into(),
            expires_in: 8 * 3600,
            scope: None,
            issued_at: Utc::now(),
        })
    }

    async fn exchange_upstox(&self, code: &str, redirect_uri: &str) -> Result<TokenSet, AuthError> {
        let kind = BrokerKind::Upstox;
        let creds = self.creds(kind)?;

        let form = vec![
            ("code".to_string(), code.to_string()),
            ("client_id".to_string(), creds.api_key.clone()),
            ("client_secret".to_string(), creds.api_secret.clone()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
            ("grant_type".to_string(), "authorization_code".to_string()),
        ];

        let call = ApiCall::post(profile(kind).token_url).with_form(form);
        let response: TokenResponse = self.token_endpoint_call(kind, call).await?;
        Ok(response.into_token_set())
    }

    async fn token_endpoint_call<T: serde::de::DeserializeOwned>(
        &self,
        kind: BrokerKind,
        call: ApiCall<'_>,
    ) -> Result<T, AuthError> {
        let deadline = tokio::time::Instant::now() + OAUTH_CALL_BUDGET;
        let result = self
            .breakers
            .call(kind, OpClass::Oauth, async {
                let response = self.pool.execute(kind, call, deadline).await?;
                response.json::<T>().await.map_err(|e| BrokerApiError::Decode {
                    broker: kind,
                    reason: e.to_string(),
                })
            })
            .await;

        result.map_err(|e| AuthError::Exchange {
            broker: kind,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl AuthProvider for OAuthCoordinator {
    async fn refresh(&self, kind: BrokerKind, refresh_token: &str) -> Result<TokenSet, AuthError> {
        if !profile(kind).supports_refresh {
            return Err(AuthError::NotRefreshable { broker: kind });
        }
        let creds = self.creds(kind)?;

        let form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
            ("client_id".to_string(), creds.api_key.clone()),
            ("client_secret".to_string(), creds.api_secret.clone()),
        ];

        let call = ApiCall::post(profile(kind).token_url).with_form(form);
        let response: TokenResponse = self.token_endpoint_call(kind, call).await?;
        info!(broker = %kind, "access token refreshed");
        Ok(response.into_token_set())
    }

    async fn probe(&self, kind: BrokerKind, access_token: &str) -> Result<bool, AuthError> {
        let p = profile(kind);
        let creds_key = self
            .credentials
            .get(&kind)
            .map(|c| c.api_key.clone())
            .unwrap_or_default();
        let url = format!("{}{}", p.base_url, p.profile_path);
        let deadline = tokio::time::Instant::now() + OAUTH_CALL_BUDGET;

        let call = ApiCall::get(url)
            .with_token(access_token)
            .with_api_key(&creds_key);

        let outcome = self
            .breakers
            .call(kind, OpClass::Oauth, async {
                self.pool.execute(kind, call, deadline).await
            })
            .await;

        match outcome {
            Ok(_) => Ok(true),
            Err(e) if e.is_auth() => Ok(false),
            Err(BrokerApiError::Broker { .. }) => Ok(false),
            Err(e) => {
                warn!(broker = %kind, error = %e, "validity probe errored");
                Err(AuthError::Probe {
                    broker: kind,
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::core::rate_limiter::RateLimiter;

    fn coordinator() -> OAuthCoordinator {
        let limiter = Arc::new(RateLimiter::new());
        let pool = Arc::new(HttpClientPool::new(limiter));
        let breakers = Arc::new(CircuitBreakerRegistry::new(Default::default()));
        let mut credentials = HashMap::new();
        credentials.insert(
            BrokerKind::Zerodha,
            BrokerCredentials {
                api_key: "kite-key".into(),
                api_secret: "kite-secret".into(),
            },
        );
        credentials.insert(
            BrokerKind::Upstox,
            BrokerCredentials {
                api_key: "upstox-key".into(),
                api_secret: "upstox-secret".into(),
            },
        );
        credentials.insert(
            BrokerKind::Fyers,
            BrokerCredentials {
                api_key: "fyers-key".into(),
                api_secret: "fyers-secret".into(),
            },
        );
        OAuthCoordinator::new(pool, breakers, credentials)
    }

    #[tokio::test]
    async fn auth_url_carries_state_and_client_id() {
        let oauth = coordinator();
        let url = oauth
            .build_auth_url("user-7", BrokerKind::Zerodha, "https://app.test/callback")
            .await
            .unwrap();

        let pairs: HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(pairs.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(pairs.get("client_id").map(String::as_str), Some("kite-key"));
        assert_eq!(
            pairs.get("redirect_uri").map(String::as_str),
            Some("https://app.test/callback")
        );

        let state = pairs.get("state").unwrap();
        assert!(state.contains("_user-7_"));
        assert!(state.ends_with("_zerodha"));
    }

    #[tokio::test]
    async fn state_is_single_use_and_bound_to_broker() {
        let oauth = coordinator();
        let url = oauth
            .build_auth_url("user-7", BrokerKind::Zerodha, "https://app.test/cb")
            .await
            .unwrap();
        let state = url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.to_string())
            .unwrap();

        // Wrong broker for this state.
        assert!(matches!(
            oauth.consume_state(&state, BrokerKind::Upstox).await,
            Err(AuthError::InvalidState)
        ));
        // The mismatch consumed it; a fresh one redeems exactly once.
        let url = oauth
            .build_auth_url("user-7", BrokerKind::Zerodha, "https://app.test/cb")
            .await
            .unwrap();
        let state = url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.to_string())
            .unwrap();
        assert_eq!(
            oauth.consume_state(&state, BrokerKind::Zerodha).await.unwrap(),
            "user-7"
        );
        assert!(matches!(
            oauth.consume_state(&state, BrokerKind::Zerodha).await,
            Err(AuthError::InvalidState)
        ));

        // Never-issued states are rejected.
        assert!(matches!(
            oauth
                .consume_state("11111111-2222-3333-4444-555555555555_user-7_zerodha", BrokerKind::Zerodha)
                .await,
            Err(AuthError::InvalidState)
        ));
    }

    #[tokio::test]
    async fn unwired_brokers_fail_explicitly() {
        let oauth = coordinator();
        let url = oauth
            .build_auth_url("user-7", BrokerKind::AngelOne, "https://app.test/cb")
            .await;
        // Angel One has no configured credentials in this fixture.
        assert!(matches!(url, Err(AuthError::MissingCredentials { .. })));

        let err = oauth
            .exchange_code(BrokerKind::Fyers, "code", "bogus-state", "https://app.test/cb")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidState));

        // With a valid state the unwired exchange still refuses, loudly.
        let url = oauth
            .build_auth_url("user-7", BrokerKind::Fyers, "https://app.test/cb")
            .await
            .unwrap();
        let state = url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.to_string())
            .unwrap();
        let err = oauth
            .exchange_code(BrokerKind::Fyers, "code", &state, "https://app.test/cb")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotImplementedForBroker { .. }));
    }

    #[tokio::test]
    async fn refresh_is_rejected_for_non_refreshable_brokers() {
        let oauth = coordinator();
        let err = oauth
            .refresh(BrokerKind::Zerodha, "whatever")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotRefreshable { .. }));
    }

    #[test]
    fn checksum_is_hex_hmac_and_input_sensitive() {
        let a = zerodha_checksum("key", "token", "secret");
        let b = zerodha_checksum("key", "token", "secret");
        let c = zerodha_checksum("key", "other-token", "secret");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
        // Keyed by the secret, not a plain digest of the concatenation.
        assert_ne!(a, zerodha_checksum("key", "token", "secret2"));
    }
}
