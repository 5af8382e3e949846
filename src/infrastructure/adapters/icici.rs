//! ICICI Direct Breeze adapter.
//!
//! Breeze responses carry the payload under `Success` with an HTTP-like
//! `Status` field; stock codes come back as `"RELIANCE NSE"` style
//! strings that the normalizer splits apart.

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

const KIND: BrokerKind = BrokerKind::IciciDirect;

pub struct IciciDirectAdapter {
    pool: Arc<HttpClientPool>,
    api_key: String,
}

impl IciciDirectAdapter {
    pub fn new(pool: Arc<HttpClientPool>, api_key: String) -> Self {
        Self { pool, api_key }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", KIND.profile().base_url, path)
    }
}

#[derive(Debug, Deserialize)]
struct BreezeEnvelope<T> {
    #[serde(rename = "Success")]
    success: Option<T>,
    #[serde(rename = "Status")]
    status: i32,
    #[serde(rename = "Error", default)]
    error: Option<String>,
}

impl<T> BreezeEnvelope<T> {
    fn into_success(self) -> Result<T, BrokerApiError> {
        match self.success {
            Some(payload) if self.status == 200 => Ok(payload),
            _ => Err(BrokerApiError::Broker {
                broker: KIND,
                reason: self
                    .error
                    .unwrap_or_else(|| format!("breeze status {}", self.status)),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BreezeHolding {
    stock_code: String,
    #[serde(default)]
    exchange_code: Option<String>,
    quantity: String,
    average_price: String,
    current_market_price: String,
    #[serde(default)]
    unrealized_profit: Option<String>,
    #[serde(default)]
    change_percentage: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BreezePosition {
    stock_code: String,
    #[serde(default)]
    exchange_code: Option<String>,
    quantity: String,
    average_price: String,
    ltp: String,
    #[serde(default)]
    pnl: Option<String>,
    #[serde(default)]
    action: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BreezeCustomer {
    idirect_userid: String,
    #[serde(default)]
    idirect_user_name: Option<String>,
    #[serde(default)]
    email_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BreezeOrderAck {
    order_id: String,
    #[serde(default)]
    message: Option<String>,
}

fn parse_dec(s: &str) -> Decimal {
    s.trim().parse::<Decimal>().unwrap_or(Decimal::ZERO)
}

fn map_holding(connection_id: Uuid, h: BreezeHolding) -> RawPosition {
    RawPosition {
        symbol: h.stock_code,
        exchange: h.exchange_code,
        quantity: h.quantity.trim().parse::<i64>().unwrap_or(0),
        avg_price: parse_dec(&h.average_price),
        last_traded_price: parse_dec(&h.current_market_price),
        pnl: h.unrealized_profit.as_deref().map(parse_dec).unwrap_or(Decimal::ZERO),
        day_change: h.change_percentage.as_deref().map(parse_dec),
        position_type: None,
        isin: None,
        connection_id,
    }
}

fn map_position(connection_id: Uuid, p: BreezePosition) -> RawPosition {
    RawPosition {
        symbol: p.stock_code,
        exchange: p.exchange_code,
        quantity: p.quantity.trim().parse::<i64>().unwrap_or(0),
        avg_price: parse_dec(&p.average_price),
        last_traded_price: parse_dec(&p.ltp),
        pnl: p.pnl.as_deref().map(parse_dec).unwrap_or(Decimal::ZERO),
        day_change: None,
        position_type: p.action,
        isin: None,
        connection_id,
    }
}

fn breeze_order_type(t: OrderType) -> &'static str {
    match t {
        OrderType::Market | OrderType::Bracket => "market",
        OrderType::Limit => "limit",
        OrderType::StopLoss => "stoploss",
    }
}

#[async_trait]
impl BrokerAdapter for IciciDirectAdapter {
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
                ApiCall::get(self.url("/breezeapi/api/v1/demat_holdings"))
                    .with_token(access_token)
                    .with_api_key(&self.api_key),
                deadline,
            )
            .await?;
        let envelope: BreezeEnvelope<Vec<BreezeHolding>> = decode(KIND, response).await?;

        Ok(BrokerPortfolio {
            connection_id: conn.id,
            broker: KIND,
            positions: envelope
                .into_success()?
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
                ApiCall::get(self.url("/breezeapi/api/v1/portfolio_positions"))
                    .with_token(access_token)
                    .with_api_key(&self.api_key),
                deadline,
            )
            .await?;
        let envelope: BreezeEnvelope<Vec<BreezePosition>> = decode(KIND, response).await?;
        Ok(envelope
            .into_success()?
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
                ApiCall::get(self.url("/breezeapi/api/v1/customerdetails"))
                    .with_token(access_token)
                    .with_api_key(&self.api_key),
                deadline,
            )
            .await?;
        let envelope: BreezeEnvelope<BreezeCustomer> = decode(KIND, response).await?;
        let customer = envelope.into_success()?;
        Ok(BrokerAccount {
            account_id: customer.idirect_userid,
            name: customer.idirect_user_name,
            email: customer.email_id,
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
            "stock_code": order.symbol,
            "exchange_code": order.exchange,
            "action": order.side.to_string().to_lowercase(),
            "order_type": breeze_order_type(order.order_type),
            "quantity": order.quantity.to_string(),
            "price": order.price.map(|p| p.to_string()).unwrap_or_default(),
            "stoploss": order.trigger_price.map(|p| p.to_string()).unwrap_or_default(),
            "product": "cash",
            "validity": "day",
        });

        let response = self
            .pool
            .execute(
                KIND,
                ApiCall::post(self.url("/breezeapi/api/v1/order"))
                    .with_token(access_token)
                    .with_api_key(&self.api_key)
                    .with_json(body),
                deadline,
            )
            .await?;
        let envelope: BreezeEnvelope<BreezeOrderAck> = decode(KIND, response).await?;
        let ack = envelope.into_success()?;
        Ok(BrokerOrderAck {
            broker_order_id: ack.order_id,
            status_text: ack.message.unwrap_or_else(|| "placed".into()),
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
    fn space_separated_stock_code_passes_through_raw() {
        let h: BreezeHolding = serde_json::from_value(serde_json::json!({
            "stock_code": "RELIANCE NSE",
            "quantity": "40",
            "average_price": "2480.50",
            "current_market_price": "2701.00",
            "unrealized_profit": "8820.00"
        }))
        .unwrap();

        let raw = map_holding(Uuid::new_v4(), h);
        // Splitting "RELIANCE NSE" is the normalizer's job.
        assert_eq!(raw.symbol, "RELIANCE NSE");
        assert_eq!(raw.exchange, None);
        assert_eq!(raw.avg_price, dec!(2480.50));
    }

    #[test]
    fn non_200_status_is_a_broker_error() {
        let envelope: BreezeEnvelope<Vec<BreezeHolding>> =
            serde_json::from_value(serde_json::json!({
                "Success": null,
                "Status": 500,
                "Error": "Session expired"
            }))
            .unwrap();

        let err = envelope.into_success().unwrap_err();
        assert!(err.to_string().contains("Session expired"));
    }
}
