//! Zerodha Kite Connect adapter.
//!
//! Holdings and net positions come back in the kite envelope
//! `{"status": "success", "data": ...}`; orders are form-encoded posts.
//! Auth uses the `token <api_key>:<access_token>` header scheme applied
//! by the client pool.

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

const KIND: BrokerKind = BrokerKind::Zerodha;

pub struct ZerodhaAdapter {
    pool: Arc<HttpClientPool>,
    api_key: String,
}

impl ZerodhaAdapter {
    pub fn new(pool: Arc<HttpClientPool>, api_key: String) -> Self {
        Self { pool, api_key }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", KIND.profile().base_url, path)
    }
}

#[derive(Debug, Deserialize)]
struct KiteEnvelope<T> {
    #[allow(dead_code)]
    status: String,
    data: T,
}

#[derive(Debug, Deserialize)]
struct KiteHolding {
    tradingsymbol: String,
    exchange: String,
    isin: Option<String>,
    quantity: i64,
    #[serde(default)]
    t1_quantity: i64,
    average_price: Decimal,
    last_price: Decimal,
    #[serde(default)]
    pnl: Decimal,
    #[serde(default)]
    day_change: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct KitePositions {
    net: Vec<KitePosition>,
}

#[derive(Debug, Deserialize)]
struct KitePosition {
    tradingsymbol: String,
    exchange: String,
    quantity: i64,
    average_price: Decimal,
    last_price: Decimal,
    #[serde(default)]
    pnl: Decimal,
}

#[derive(Debug, Deserialize)]
struct KiteProfile {
    user_id: String,
    user_name: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KiteOrderAck {
    order_id: String,
}

fn map_holding(connection_id: Uuid, h: KiteHolding) -> RawPosition {
    RawPosition {
        symbol: h.tradingsymbol,
        exchange: Some(h.exchange),
        // t1 quantity is stock delivered but not yet settled; it is still
        // part of the economic position.
        quantity: h.quantity + h.t1_quantity,
        avg_price: h.average_price,
        last_traded_price: h.last_price,
        pnl: h.pnl,
        day_change: h.day_change,
        position_type: None,
        isin: h.isin,
        connection_id,
    }
}

fn map_position(connection_id: Uuid, p: KitePosition) -> RawPosition {
    RawPosition {
        symbol: p.tradingsymbol,
        exchange: Some(p.exchange),
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

fn kite_order_type(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::StopLoss => "SL-M",
        // Bracket entries are routed as market fills.
        OrderType::Bracket => "MARKET",
    }
}

#[async_trait]
impl BrokerAdapter for ZerodhaAdapter {
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
                ApiCall::get(self.url("/portfolio/holdings"))
                    .with_token(access_token)
                    .with_api_key(&self.api_key),
                deadline,
            )
            .await?;
        let envelope: KiteEnvelope<Vec<KiteHolding>> = decode(KIND, response).await?;

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
                ApiCall::get(self.url("/portfolio/positions"))
                    .with_token(access_token)
                    .with_api_key(&self.api_key),
                deadline,
            )
            .await?;
        let envelope: KiteEnvelope<KitePositions> = decode(KIND, response).await?;
        Ok(envelope
            .data
            .net
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
                ApiCall::get(self.url("/user/profile"))
                    .with_token(access_token)
                    .with_api_key(&self.api_key),
                deadline,
            )
            .await?;
        let envelope: KiteEnvelope<KiteProfile> = decode(KIND, response).await?;
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
        let mut form = vec![
            ("tradingsymbol".to_string(), order.symbol.clone()),
            ("exchange".to_string(), order.exchange.clone()),
            ("transaction_type".to_string(), order.side.to_string()),
            ("order_type".to_string(), kite_order_type(order.order_type).to_string()),
            ("quantity".to_string(), order.quantity.to_string()),
            ("product".to_string(), "CNC".to_string()),
            ("validity".to_string(), "DAY".to_string()),
        ];
        if let Some(price) = order.price {
            form.push(("price".to_string(), price.to_string()));
        }
        if let Some(trigger) = order.trigger_price {
            form.push(("trigger_price".to_string(), trigger.to_string()));
        }

        let response = self
            .pool
            .execute(
                KIND,
                ApiCall::post(self.url("/orders/regular"))
                    .with_token(access_token)
                    .with_api_key(&self.api_key)
                    .with_form(form),
                deadline,
            )
            .await?;
        let envelope: KiteEnvelope<KiteOrderAck> = decode(KIND, response).await?;
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
    fn holding_maps_including_t1_quantity() {
        let h: KiteHolding = serde_json::from_value(serde_json::json!({
            "tradingsymbol": "RELIANCE",
            "exchange": "NSE",
            "isin": "INE002A01018",
            "quantity": 90,
            "t1_quantity": 10,
            "average_price": 2500.0,
            "last_price": 2650.5,
            "pnl": 15050.0,
            "day_change": 12.5
        }))
        .unwrap();

        let raw = map_holding(Uuid::new_v4(), h);
        assert_eq!(raw.symbol, "RELIANCE");
        assert_eq!(raw.quantity, 100);
        assert_eq!(raw.avg_price, dec!(2500.0));
        assert_eq!(raw.isin.as_deref(), Some("INE002A01018"));
    }

    #[test]
    fn short_net_position_keeps_sign() {
        let p: KitePosition = serde_json::from_value(serde_json::json!({
            "tradingsymbol": "NIFTY24AUGFUT",
            "exchange": "NFO",
            "quantity": -50,
            "average_price": 24500.0,
            "last_price": 24480.0,
            "pnl": 1000.0
        }))
        .unwrap();

        let raw = map_position(Uuid::new_v4(), p);
        assert_eq!(raw.quantity, -50);
        assert_eq!(raw.exchange.as_deref(), Some("NFO"));
    }

    #[test]
    fn stop_orders_go_out_as_sl_m() {
        assert_eq!(kite_order_type(OrderType::StopLoss), "SL-M");
        assert_eq!(kite_order_type(OrderType::Market), "MARKET");
    }
}
