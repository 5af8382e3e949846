//! Angel One SmartAPI adapter.
//!
//! SmartAPI serializes every numeric field as a string and wraps payloads
//! in `{"status": bool, "message": ..., "data": ...}`. The client pool
//! injects the SmartAPI header block (client IP, MAC, source type,
//! private key) alongside the bearer token.

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

const KIND: BrokerKind = BrokerKind::AngelOne;

pub struct AngelOneAdapter {
    pool: Arc<HttpClientPool>,
    api_key: String,
}

impl AngelOneAdapter {
    pub fn new(pool: Arc<HttpClientPool>, api_key: String) -> Self {
        Self { pool, api_key }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", KIND.profile().base_url, path)
    }
}

#[derive(Debug, Deserialize)]
struct SmartEnvelope<T> {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

impl<T> SmartEnvelope<T> {
    fn into_data(self) -> Result<T, BrokerApiError> {
        if !self.status {
            return Err(BrokerApiError::Broker {
                broker: KIND,
                reason: self.message,
            });
        }
        self.data.ok_or(BrokerApiError::Decode {
            broker: KIND,
            reason: "status true but data missing".into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SmartHolding {
    tradingsymbol: String,
    exchange: String,
    #[serde(default)]
    isin: Option<String>,
    quantity: String,
    averageprice: String,
    ltp: String,
    #[serde(default)]
    profitandloss: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SmartPosition {
    tradingsymbol: String,
    exchange: String,
    netqty: String,
    avgnetprice: String,
    ltp: String,
    #[serde(default)]
    pnl: Option<String>,
    #[serde(default)]
    producttype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SmartProfile {
    clientcode: String,
    name: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SmartOrderAck {
    orderid: String,
}

fn parse_dec(s: &str) -> Decimal {
    s.parse::<Decimal>().unwrap_or(Decimal::ZERO)
}

fn map_holding(connection_id: Uuid, h: SmartHolding) -> RawPosition {
    RawPosition {
        symbol: h.tradingsymbol,
        exchange: Some(h.exchange),
        quantity: h.quantity.parse::<i64>().unwrap_or(0),
        avg_price: parse_dec(&h.averageprice),
        last_traded_price: parse_dec(&h.ltp),
        pnl: h.profitandloss.as_deref().map(parse_dec).unwrap_or(Decimal::ZERO),
        day_change: None,
        position_type: None,
        isin: h.isin,
        connection_id,
    }
}

fn map_position(connection_id: Uuid, p: SmartPosition) -> RawPosition {
    RawPosition {
        symbol: p.tradingsymbol,
        exchange: Some(p.exchange),
        quantity: p.netqty.parse::<i64>().unwrap_or(0),
        avg_price: parse_dec(&p.avgnetprice),
        last_traded_price: parse_dec(&p.ltp),
        pnl: p.pnl.as_deref().map(parse_dec).unwrap_or(Decimal::ZERO),
        day_change: None,
        position_type: p.producttype,
        isin: None,
        connection_id,
    }
}

fn smart_order_type(t: OrderType) -> &'static str {
    match t {
        OrderType::Market | OrderType::Bracket => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::StopLoss => "STOPLOSS_MARKET",
    }
}

#[async_trait]
impl BrokerAdapter for AngelOneAdapter {
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
                ApiCall::get(self.url("/rest/secure/angelbroking/portfolio/v1/getHolding"))
                    .with_token(access_token)
                    .with_api_key(&self.api_key),
                deadline,
            )
            .await?;
        let envelope: SmartEnvelope<Vec<SmartHolding>> = decode(KIND, response).await?;

        Ok(BrokerPortfolio {
            connection_id: conn.id,
            broker: KIND,
            positions: envelope
                .into_data()?
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
                ApiCall::get(self.url("/rest/secure/angelbroking/order/v1/getPosition"))
                    .with_token(access_token)
                    .with_api_key(&self.api_key),
                deadline,
            )
            .await?;
        let envelope: SmartEnvelope<Vec<SmartPosition>> = decode(KIND, response).await?;
        Ok(envelope
            .into_data()?
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
                ApiCall::get(self.url("/rest/secure/angelbroking/user/v1/getProfile"))
                    .with_token(access_token)
                    .with_api_key(&self.api_key),
                deadline,
            )
            .await?;
        let envelope: SmartEnvelope<SmartProfile> = decode(KIND, response).await?;
        let profile = envelope.into_data()?;
        Ok(BrokerAccount {
            account_id: profile.clientcode,
            name: profile.name,
            email: profile.email,
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
            "variety": "NORMAL",
            "tradingsymbol": order.symbol,
            "exchange": order.exchange,
            "transactiontype": order.side.to_string(),
            "ordertype": smart_order_type(order.order_type),
            "producttype": "DELIVERY",
            "duration": "DAY",
            "quantity": order.quantity.to_string(),
            "price": order.price.map(|p| p.to_string()).unwrap_or_else(|| "0".into()),
            "triggerprice": order
                .trigger_price
                .map(|p| p.to_string())
                .unwrap_or_else(|| "0".into()),
        });

        let response = self
            .pool
            .execute(
                KIND,
                ApiCall::post(self.url("/rest/secure/angelbroking/order/v1/placeOrder"))
                    .with_token(access_token)
                    .with_api_key(&self.api_key)
                    .with_json(body),
                deadline,
            )
            .await?;
        let envelope: SmartEnvelope<SmartOrderAck> = decode(KIND, response).await?;
        let message = envelope.message.clone();
        let ack = envelope.into_data()?;
        Ok(BrokerOrderAck {
            broker_order_id: ack.orderid,
            status_text: message,
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
