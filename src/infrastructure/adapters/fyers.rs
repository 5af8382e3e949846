//! Fyers adapter. Symbols come prefixed (`NSE:RELIANCE-EQ`), responses
//! signal success with `"s": "ok"`, and order sides/types are numeric
//! codes.

use crate::domain::broker::BrokerKind;
use crate::domain::connection::Connection;
use crate::domain::errors::BrokerApiError;
use crate::domain::orders::{BrokerOrder, BrokerOrderAck, OrderSide, OrderType};
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

const KIND: BrokerKind = BrokerKind::Fyers;

pub struct FyersAdapter {
    pool: Arc<HttpClientPool>,
    #[allow(dead_code)]
    api_key: String,
}

impl FyersAdapter {
    pub fn new(pool: Arc<HttpClientPool>, api_key: String) -> Self {
        Self { pool, api_key }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", KIND.profile().base_url, path)
    }
}

fn check_ok(s: &str, message: Option<&str>) -> Result<(), BrokerApiError> {
    if s == "ok" {
        Ok(())
    } else {
        Err(BrokerApiError::Broker {
            broker: KIND,
            reason: message.unwrap_or("fyers request failed").to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct FyersHoldings {
    s: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    holdings: Vec<FyersHolding>,
}

#[derive(Debug, Deserialize)]
struct FyersHolding {
    symbol: String,
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default)]
    isin: Option<String>,
    quantity: i64,
    #[serde(rename = "costPrice")]
    cost_price: Decimal,
    ltp: Decimal,
    #[serde(default)]
    pl: Decimal,
}

#[derive(Debug, Deserialize)]
struct FyersPositions {
    s: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(rename = "netPositions", default)]
    net_positions: Vec<FyersPosition>,
}

#[derive(Debug, Deserialize)]
struct FyersPosition {
    symbol: String,
    #[serde(rename = "netQty")]
    net_qty: i64,
    #[serde(rename = "netAvg")]
    net_avg: Decimal,
    ltp: Decimal,
    #[serde(default)]
    pl: Decimal,
    #[serde(default)]
    side: Option<i8>,
}

#[derive(Debug, Deserialize)]
struct FyersProfileResponse {
    s: String,
    #[serde(default)]
    message: Option<String>,
    data: Option<FyersProfileData>,
}

#[derive(Debug, Deserialize)]
struct FyersProfileData {
    fy_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FyersOrderAck {
    s: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

fn map_holding(connection_id: Uuid, h: FyersHolding) -> RawPosition {
    RawPosition {
        symbol: h.symbol,
        exchange: h.exchange,
        quantity: h.quantity,
        avg_price: h.cost_price,
        last_traded_price: h.ltp,
        pnl: h.pl,
        day_change: None,
        position_type: None,
        isin: h.isin,
        connection_id,
    }
}

fn map_position(connection_id: Uuid, p: FyersPosition) -> RawPosition {
    let position_type = p.side.map(|s| if s >= 0 { "LONG".into() } else { "SHORT".into() });
    RawPosition {
        symbol: p.symbol,
        exchange: None,
        quantity: p.net_qty,
        avg_price: p.net_avg,
        last_traded_price: p.ltp,
        pnl: p.pl,
        day_change: None,
        position_type,
        isin: None,
        connection_id,
    }
}

fn fyers_type_code(t: OrderType) -> u8 {
    match t {
        OrderType::Limit => 1,
        OrderType::Market | OrderType::Bracket => 2,
        OrderType::StopLoss => 3,
    }
}

fn fyers_side_code(side: OrderSide) -> i8 {
    match side {
        OrderSide::Buy => 1,
        OrderSide::Sell => -1,
    }
}

#[async_trait]
impl BrokerAdapter for FyersAdapter {
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
                ApiCall::get(self.url("/api/v2/holdings")).with_token(access_token),
                deadline,
            )
            .await?;
        let payload: FyersHoldings = decode(KIND, response).await?;
        check_ok(&payload.s, payload.message.as_deref())?;

        Ok(BrokerPortfolio {
            connection_id: conn.id,
            broker: KIND,
            positions: payload
                .holdings
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
                ApiCall::get(self.url("/api/v2/positions")).with_token(access_token),
                deadline,
            )
            .await?;
        let payload: FyersPositions = decode(KIND, response).await?;
        check_ok(&payload.s, payload.message.as_deref())?;
        Ok(payload
            .net_positions
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
                ApiCall::get(self.url("/api/v2/profile")).with_token(access_token),
                deadline,
            )
            .await?;
        let payload: FyersProfileResponse = decode(KIND, response).await?;
        check_ok(&payload.s, payload.message.as_deref())?;
        let data = payload.data.ok_or(BrokerApiError::Decode {
            broker: KIND,
            reason: "profile data missing".into(),
        })?;
        Ok(BrokerAccount {
            account_id: data.fy_id,
            name: data.name,
            email: data.email_id,
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
        let symbol = format!(
            "{}:{}-EQ",
            order.exchange,
            order.symbol.trim_end_matches("-EQ")
        );
        let body = serde_json::json!({
            "symbol": symbol,
            "qty": order.quantity,
            "type": fyers_type_code(order.order_type),
            "side": fyers_side_code(order.side),
            "productType": "CNC",
            "limitPrice": order.price.unwrap_or(Decimal::ZERO),
            "stopPrice": order.trigger_price.unwrap_or(Decimal::ZERO),
            "validity": "DAY",
            "offlineOrder": false,
        });

        let response = self
            .pool
            .execute(
                KIND,
                ApiCall::post(self.url("/api/v2/orders"))
                    .with_token(access_token)
                    .with_json(body),
                deadline,
            )
            .await?;
        let ack: FyersOrderAck = decode(KIND, response).await?;
        check_ok(&ack.s, ack.message.as_deref())?;
        Ok(BrokerOrderAck {
            broker_order_id: ack.id.unwrap_or_default(),
            status_text: ack.message.unwrap_or_else(|| "ok".into()),
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
