//! Ports consumed by the core: the persistence boundary, market-data and
//! FX oracles, the asset master-data catalog, token refresh, and the
//! per-broker adapter surface.
//!
//! Everything here is a trait so the outer application (and the tests)
//! choose the implementations.

use crate::domain::broker::BrokerKind;
use crate::domain::connection::{Connection, ConnectionStatus, TokenSet};
use crate::domain::errors::{AuthError, BrokerApiError, StoreError};
use crate::domain::orders::{BrokerOrder, BrokerOrderAck};
use crate::domain::portfolio::{BrokerAccount, BrokerPortfolio, RawPosition};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::time::Instant;
use uuid::Uuid;

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn insert(&self, conn: &Connection) -> Result<(), StoreError>;
    async fn update(&self, conn: &Connection) -> Result<(), StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Connection>, StoreError>;
    async fn find_by_user(&self, user_id: &str) -> Result<Vec<Connection>, StoreError>;
    async fn find_by_user_and_broker(
        &self,
        user_id: &str,
        broker: BrokerKind,
    ) -> Result<Vec<Connection>, StoreError>;
    async fn find_by_status(&self, status: ConnectionStatus) -> Result<Vec<Connection>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct MarketPrice {
    pub price: Decimal,
    pub market_status: MarketStatus,
    pub circuit_limit_hit: bool,
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn current_price(&self, symbol: &str) -> Option<Decimal>;
    async fn market_price(&self, symbol: &str) -> Option<MarketPrice>;
    async fn batch_prices(&self, symbols: &[String]) -> HashMap<String, Decimal>;
}

#[async_trait]
pub trait FxOracle: Send + Sync {
    /// Conversion rate `from -> to`. Unknown pair means no conversion.
    async fn rate(&self, from: &str, to: &str) -> Option<Decimal>;
}

/// Asset master data. The lot-reporting policy table lives here too: it is
/// reference data about broker payload conventions, not trading logic.
pub trait AssetCatalog: Send + Sync {
    fn company_name(&self, symbol: &str) -> Option<String>;
    fn sector(&self, symbol: &str) -> Option<String>;
    fn asset_class(&self, symbol: &str) -> Option<String>;
    fn market_cap(&self, symbol: &str) -> Option<Decimal>;
    fn lot_size(&self, symbol: &str) -> Option<u32>;
    fn symbol_for_isin(&self, isin: &str) -> Option<String>;
    fn is_derivative(&self, symbol: &str) -> bool;
    fn is_etf(&self, symbol: &str) -> bool;
    /// Whether this broker reports derivative quantities in lots rather
    /// than units on the given exchange.
    fn reports_in_lots(&self, broker: BrokerKind, exchange: &str) -> bool;
}

/// Token refresh and validity probing, implemented by the OAuth
/// coordinator and mockable in tests.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn refresh(&self, kind: BrokerKind, refresh_token: &str) -> Result<TokenSet, AuthError>;
    async fn probe(&self, kind: BrokerKind, access_token: &str) -> Result<bool, AuthError>;
}

/// One broker's API surface, translated to internal DTOs.
///
/// The decrypted access token is supplied per call and must not be
/// retained by implementations.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn kind(&self) -> BrokerKind;

    async fn fetch_portfolio(
        &self,
        conn: &Connection,
        access_token: &str,
        deadline: Instant,
    ) -> Result<BrokerPortfolio, BrokerApiError>;

    async fn fetch_positions(
        &self,
        conn: &Connection,
        access_token: &str,
        deadline: Instant,
    ) -> Result<Vec<RawPosition>, BrokerApiError>;

    async fn get_profile(
        &self,
        conn: &Connection,
        access_token: &str,
        deadline: Instant,
    ) -> Result<BrokerAccount, BrokerApiError>;

    async fn place_order(
        &self,
        conn: &Connection,
        access_token: &str,
        order: &BrokerOrder,
        deadline: Instant,
    ) -> Result<BrokerOrderAck, BrokerApiError>;

    async fn validate_account(
        &self,
        conn: &Connection,
        access_token: &str,
        deadline: Instant,
    ) -> Result<bool, BrokerApiError>;
}
