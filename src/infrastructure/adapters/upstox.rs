//! Upstox v2 adapter. Bearer auth, JSON bodies, `{"status": ..., "data":
//! ...}` envelopes. Holdings carry the instrument as `NSE_EQ|<ISIN>`;
//! the normalizer resolves the ISIN through the asset catalog.

use crate::domain::broker::BrokerKind;
use crate::domain::connection::Connection;
use crate::domain::errors::BrokerApiError;
use crate::domain::orders::{BrokerOrder, BrokerOrderAck, OrderType};
use crate::domain::portfolio::{BrokerAccount, BrokerPortfolio, RawPosition};
use crate::domain::ports::BrokerAdapter;
use crate::infrastructure::adapters::decode;
use crate::infrastructure::core::http::{ApiCall, HttpClientPool};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

const KIND: BrokerKind = BrokerKind::Upstox;

pub struct UpstoxAdapter {
    pool: Arc<HttpClientPool>,
}

impl UpstoxAdapter {
    pub fn new(pool: Arc<HttpClientPool>) -> Self {
        Self { pool }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", KIND.profile().base_url, path)
    }
}

#[derive(Debug, Deserialize)]
struct UpstoxEnvelope<T> {
    #[allow(dead_code)]
    status: String,
    data: T,
}

#[derive(Debug, Deserialize)]
struct UpstoxHolding {
    /// Instrument key, e.g. `NSE_EQ|INE002A01018`.
    instrument_token: String,
    #[serde(default)]
    trading_symbol: Option<String>,
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default)]
    isin: Option<String>,
    quantity: i64,
    average_price: Decimal,
    last_price: Decimal,
    #[serde(default)]
    pnl: Decimal,
    #[serde(default)]
    day_change: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct UpstoxPosition {
    instrument_token: String,
    #[serde(default)]
    trading_symbol: Option<String>,
    #[serde(default)]
    exchange: Option<String>,
    quantity: i64,
    average_price: Decimal,
    last_price: Decimal,
    #[serde(default)]
    pnl: Decimal,
}

#[derive(Debug, Deserialize)]
struct UpstoxProfile {
    user_id: String,
    user_name: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstoxOrderAck {
    order_id: String,
}

/// Holdings name instruments three ways across API revisions; prefer the
/// plain trading symbol, fall back to the instrument key.
fn instrument_symbol(token: &str, trading_symbol: Option<&str>) -> String {
    match trading_symbol {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => token.to_string(),
    }
}

fn map_holding(connection_id: Uuid, h: UpstoxHolding) -> RawPosition {
    let exchange = h
        .exchange
        .or_else(|| h.instrument_token.split('|').next().map(|s| s.to_string()));
    RawPosition {
        symbol: instrument_symbol(&h.instrument_token, h.trading_symbol.as_deref()),
        exchange,
        quantity: h.quantity,
        avg_price: h.average_price,
        last_traded_price: h.last_price,
        pnl: h.pnl,
        day_change: h.day_change,
        position_type: None,
        isin: h.isin,
        connection_id,
    }
}

fn map_position(connection_id: Uuid, p: UpstoxPosition) -> RawPosition {
    let exchange = p
        .exchange
        .or_else(|| p.instrument_token.split('|').next().map(|s| s.to_string()));
    RawPosition {
        symbol: instrument_symbol(&p.instrument_token, p.trading_symbol.as_deref()),
        exchange,
        quantity: p.quantity,
        avg_price: p.average_price,
        last_traded_price: p.last_price,
        pnl: p.pnl,
        day_change: None,
        position_type: None,
        isin: None,
        connection_id,
    }
}

fn upstox_order_type(t: OrderType) -> &'static str {
    match t {
        OrderType::Market | OrderType::Bracket => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::StopLoss => "SL-M",
    }
}

#[async_trait]
impl BrokerAdapter for UpstoxAdapter {
    fn kind(&self) -> BrokerKind {
        KIND
    }

    async fn fetch_portfolio(
        &self,
        conn: &Connection,
        access_token: &str,
        deadline: Instant,
    ) -> Result<BrokerPortfolio, BrokerApiError> {
        let response = self
            .pool
            .execute(
                KIND,
                ApiCall::get(self.url("/v2/portfolio/long-term-holdings")).with_token(access_token),
                deadline,
            )
            .await?;
        let envelope: UpstoxEnvelope<Vec<UpstoxHolding>> = decode(KIND, response).await?;

        Ok(BrokerPortfolio {
            connection_id: conn.id,
            broker: KIND,
            positions: envelope
                .data
                .into_iter()
                .map(|h| map_holding(conn.id, h))
                .collect(),
            currency: None,
            fetched_at: Utc::now(),
        })
    }

    async fn fetch_positions(
        &self,
        conn: &Connection,
        access_token: &str,
        deadline: Instant,
    ) -> Result<Vec<RawPosition>, BrokerApiError> {
        let response = self
            .pool
            .execute(
                KIND,
                ApiCall::get(self.url("/v2/portfolio/short-term-positions")).with_token(access_token),
                deadline,
            )
            .await?;
        let envelope: UpstoxEnvelope<Vec<UpstoxPosition>> = decode(KIND, response).await?;
        Ok(envelope
            .data
            .into_iter()
            .map(|p| map_position(conn.id, p))
            .collect())
    }

    async fn get_profile(
        &self,
        _conn: &Connection,
        access_token: &str,
        deadline: Instant,
    ) -> Result<BrokerAccount, BrokerApiError> {
        let response = self
            .pool
            .execute(
                KIND,
                ApiCall::get(self.url("/v2/user/profile")).with_token(access_token),
                deadline,
            )
            .await?;
        let envelope: UpstoxEnvelope<UpstoxProfile> = decode(KIND, response).await?;
        Ok(BrokerAccount {
            account_id: envelope.data.user_id,
            name: envelope.data.user_name,
            email: envelope.data.email,
            broker: KIND,
        })
    }

    async fn place_order(
        &self,
        _conn: &Connection,
        access_token: &str,
        order: &BrokerOrder,
        deadline: Instant,
    ) -> Result<BrokerOrderAck, BrokerApiError> {
        let body = serde_json::json!({
            "trading_symbol": order.symbol,
            "exchange": order.exchange,
            "transaction_type": order.side.to_string(),
            "order_type": upstox_order_type(order.order_type),
            "quantity": order.quantity,
            "product": "D",
            "validity": "DAY",
            "price": order.price,
            "trigger_price": order.trigger_price,
            "is_amo": false,
        });

        let response = self
            .pool
            .execute(
                KIND,
                ApiCall::post(self.url("/v2/order/place"))
                    .with_token(access_token)
                    .with_json(body),
                deadline,
            )
            .await?;
        let envelope: UpstoxEnvelope<UpstoxOrderAck> = decode(KIND, response).await?;
        Ok(BrokerOrderAck {
            broker_order_id: envelope.data.order_id,
            status_text: envelope.status,
        })
    }

    async fn validate_account(
        &self,
        conn: &Connection,
        access_token: &str,
        deadline: Instant,
    ) -> Result<bool, BrokerApiError> {
        match self.get_profile(conn, access_token, deadline).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_auth() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn isin_keyed_holding_keeps_instrument_token_as_symbol() {
        let h: UpstoxHolding = serde_json::from_value(serde_json::json!({
            "instrument_token": "NSE_EQ|INE002A01018",
            "isin": "INE002A01018",
            "quantity": 50,
            "average_price": 2600.0,
            "last_price": 2700.0,
            "pnl": 5000.0
        }))
        .unwrap();

        let raw = map_holding(Uuid::new_v4(), h);
        assert_eq!(raw.symbol, "NSE_EQ|INE002A01018");
        assert_eq!(raw.exchange.as_deref(), Some("NSE_EQ"));
        assert_eq!(raw.avg_price, dec!(2600.0));
    }

    #[test]
    fn trading_symbol_wins_when_present() {
        let h: UpstoxHolding = serde_json::from_value(serde_json::json!({
            "instrument_token": "NSE_EQ|INE009A01021",
            "trading_symbol": "INFY",
            "exchange": "NSE",
            "quantity": 10,
            "average_price": 1500.0,
            "last_price": 1520.0
        }))
        .unwrap();

        let raw = map_holding(Uuid::new_v4(), h);
        assert_eq!(raw.symbol, "INFY");
        assert_eq!(raw.exchange.as_deref(), Some("NSE"));
    }
}
