//! Mock implementations of the domain ports for tests and local
//! development: a scriptable price oracle, a counting auth provider, and
//! a broker adapter with programmable outcomes.

use crate::domain::broker::BrokerKind;
use crate::domain::connection::{Connection, TokenSet};
use crate::domain::errors::{AuthError, BrokerApiError};
use crate::domain::orders::{BrokerOrder, BrokerOrderAck};
use crate::domain::portfolio::{BrokerAccount, BrokerPortfolio, RawPosition};
use crate::domain::ports::{AuthProvider, BrokerAdapter, MarketPrice, MarketStatus, PriceOracle};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

pub struct MockPriceOracle {
    prices: RwLock<HashMap<String, Decimal>>,
    market_open: RwLock<bool>,
    circuit_hit: RwLock<HashSet<String>>,
}

impl MockPriceOracle {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            market_open: RwLock::new(true),
            circuit_hit: RwLock::new(HashSet::new()),
        }
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    pub async fn set_market_open(&self, open: bool) {
        *self.market_open.write().await = open;
    }

    pub async fn set_circuit_hit(&self, symbol: &str) {
        self.circuit_hit.write().await.insert(symbol.to_string());
    }
}

impl Default for MockPriceOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceOracle for MockPriceOracle {
    async fn current_price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.read().await.get(symbol).copied()
    }

    async fn market_price(&self, symbol: &str) -> Option<MarketPrice> {
        let price = self.prices.read().await.get(symbol).copied()?;
        let open = *self.market_open.read().await;
        Some(MarketPrice {
            price,
            market_status: if open { MarketStatus::Open } else { MarketStatus::Closed },
            circuit_limit_hit: self.circuit_hit.read().await.contains(symbol),
        })
    }

    async fn batch_prices(&self, symbols: &[String]) -> HashMap<String, Decimal> {
        let prices = self.prices.read().await;
        symbols
            .iter()
            .filter_map(|s| prices.get(s).map(|p| (s.clone(), *p)))
            .collect()
    }
}

/// Auth provider returning scripted tokens; counts refresh calls so tests
/// can assert single-flight behavior.
pub struct MockAuthProvider {
    pub refresh_calls: AtomicUsize,
    pub probe_calls: AtomicUsize,
    refresh_delay: Duration,
    probe_result: RwLock<bool>,
}

impl MockAuthProvider {
    pub fn new() -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            refresh_delay: Duration::from_millis(0),
            probe_result: RwLock::new(true),
        }
    }

    /// Make each refresh take a while, widening the race window that
    /// single-flight must close.
    pub fn with_refresh_delay(delay: Duration) -> Self {
        Self {
            refresh_delay: delay,
            ..Self::new()
        }
    }

    pub async fn set_probe_result(&self, ok: bool) {
        *self.probe_result.write().await = ok;
    }
}

impl Default for MockAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthProvider for MockAuthProvider {
    async fn refresh(&self, _kind: BrokerKind, _refresh_token: &str) -> Result<TokenSet, AuthError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.refresh_delay).await;
        Ok(TokenSet {
            access_token: format!("refreshed-access-{}", n),
            refresh_token: Some(format!("refreshed-refresh-{}", n)),
            token_type: "Bearer".into(),
            expires_in: 3600,
            scope: None,
            issued_at: Utc::now(),
        })
    }

    async fn probe(&self, _kind: BrokerKind, _access_token: &str) -> Result<bool, AuthError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.probe_result.read().await)
    }
}

/// What the mock adapter should do on its next calls.
pub enum MockBehavior {
    Positions(Vec<RawPosition>),
    Transport(String),
    AuthFailure(String),
    /// Reject the first call as unauthorized, then serve positions;
    /// exercises the refresh-and-retry path.
    AuthFailureOnce(Vec<RawPosition>),
    Delay(Duration, Vec<RawPosition>),
}

pub struct MockBrokerAdapter {
    kind: BrokerKind,
    behavior: RwLock<MockBehavior>,
    pub fetch_calls: AtomicUsize,
    pub order_calls: AtomicUsize,
}

impl MockBrokerAdapter {
    pub fn new(kind: BrokerKind, behavior: MockBehavior) -> Self {
        Self {
            kind,
            behavior: RwLock::new(behavior),
            fetch_calls: AtomicUsize::new(0),
            order_calls: AtomicUsize::new(0),
        }
    }

    pub async fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.write().await = behavior;
    }

    async fn positions_for(
        &self,
        conn: &Connection,
        attempt: usize,
    ) -> Result<Vec<RawPosition>, BrokerApiError> {
        let behavior = self.behavior.read().await;
        match &*behavior {
            MockBehavior::Positions(raw) => Ok(rebind(raw, conn)),
            MockBehavior::AuthFailureOnce(raw) => {
                if attempt <= 1 {
                    Err(BrokerApiError::Auth {
                        broker: self.kind,
                        reason: "token revoked".into(),
                    })
                } else {
                    Ok(rebind(raw, conn))
                }
            }
            MockBehavior::Delay(delay, raw) => {
                let raw = rebind(raw, conn);
                let delay = *delay;
                drop(behavior);
                tokio::time::sleep(delay).await;
                Ok(raw)
            }
            MockBehavior::Transport(reason) => Err(BrokerApiError::Transport {
                broker: self.kind,
                reason: reason.clone(),
            }),
            MockBehavior::AuthFailure(reason) => Err(BrokerApiError::Auth {
                broker: self.kind,
                reason: reason.clone(),
            }),
        }
    }
}

fn rebind(raw: &[RawPosition], conn: &Connection) -> Vec<RawPosition> {
    raw.iter()
        .map(|p| RawPosition {
            connection_id: conn.id,
            ..p.clone()
        })
        .collect()
}

#[async_trait]
impl BrokerAdapter for MockBrokerAdapter {
    fn kind(&self) -> BrokerKind {
        self.kind
    }

    async fn fetch_portfolio(
        &self,
        conn: &Connection,
        _access_token: &str,
        _deadline: Instant,
    ) -> Result<BrokerPortfolio, BrokerApiError> {
        let attempt = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(BrokerPortfolio {
            connection_id: conn.id,
            broker: self.kind,
            positions: self.positions_for(conn, attempt).await?,
            currency: None,
            fetched_at: Utc::now(),
        })
    }

    async fn fetch_positions(
        &self,
        conn: &Connection,
        _access_token: &str,
        _deadline: Instant,
    ) -> Result<Vec<RawPosition>, BrokerApiError> {
        let attempt = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.positions_for(conn, attempt).await
    }

    async fn get_profile(
        &self,
        conn: &Connection,
        _access_token: &str,
        _deadline: Instant,
    ) -> Result<BrokerAccount, BrokerApiError> {
        let account_id = if conn.account_id.is_empty() {
            format!("{}-acct", self.kind)
        } else {
            conn.account_id.clone()
        };
        Ok(BrokerAccount {
            account_id,
            name: Some("Mock User".into()),
            email: None,
            broker: self.kind,
        })
    }

    async fn place_order(
        &self,
        _conn: &Connection,
        _access_token: &str,
        _order: &BrokerOrder,
        _deadline: Instant,
    ) -> Result<BrokerOrderAck, BrokerApiError> {
        let attempt = self.order_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let behavior = self.behavior.read().await;
        match &*behavior {
            MockBehavior::Transport(reason) => {
                return Err(BrokerApiError::Transport {
                    broker: self.kind,
                    reason: reason.clone(),
                });
            }
            MockBehavior::AuthFailure(reason) => {
                return Err(BrokerApiError::Auth {
                    broker: self.kind,
                    reason: reason.clone(),
                });
            }
            MockBehavior::AuthFailureOnce(_) if attempt <= 1 => {
                return Err(BrokerApiError::Auth {
                    broker: self.kind,
                    reason: "token revoked".into(),
                });
            }
            _ => {}
        }
        Ok(BrokerOrderAck {
            broker_order_id: format!("MOCK-{}", attempt),
            status_text: "success".into(),
        })
    }

    async fn validate_account(
        &self,
        _conn: &Connection,
        _access_token: &str,
        _deadline: Instant,
    ) -> Result<bool, BrokerApiError> {
        Ok(!matches!(&*self.behavior.read().await, MockBehavior::AuthFailure(_)))
    }
}
