//! IIFL Securities adapter over the XTS interactive API. Responses wrap
//! payloads in `{"type": "success" | "error", "result": ...}`.

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

const KIND: BrokerKind = BrokerKind::Iifl;

pub struct IiflAdapter {
    pool: Arc<HttpClientPool>,
}

impl IiflAdapter {
    pub fn new(pool: Arc<HttpClientPool>) -> Self {
        Self { pool }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", KIND.profile().base_url, path)
    }
}

#[derive(Debug, Deserialize)]
struct XtsEnvelope<T> {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

impl<T> XtsEnvelope<T> {
    fn into_result(self) -> Result<T, BrokerApiError> {
        if self.kind != "success" {
            return Err(BrokerApiError::Broker {
                broker: KIND,
                reason: self.description.unwrap_or_else(|| "xts request failed".into()),
            });
        }
        self.result.ok_or(BrokerApiError::Decode {
            broker: KIND,
            reason: "success without result".into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct XtsHoldings {
    #[serde(rename = "RMSHoldings", default)]
    holdings: Vec<XtsHolding>,
}

#[derive(Debug, Deserialize)]
struct XtsHolding {
    #[serde(rename = "TradingSymbol")]
    trading_symbol: String,
    #[serde(rename = "ExchangeSegment", default)]
    exchange_segment: Option<String>,
    #[serde(rename = "ISIN", default)]
    isin: Option<String>,
    #[serde(rename = "HoldingQuantity")]
    holding_quantity: i64,
    #[serde(rename = "BuyAvgPrice")]
    buy_avg_price: Decimal,
    #[serde(rename = "LastTradedPrice", default)]
    last_traded_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct XtsPositions {
    #[serde(rename = "positionList", default)]
    position_list: Vec<XtsPosition>,
}

#[derive(Debug, Deserialize)]
struct XtsPosition {
    #[serde(rename = "TradingSymbol")]
    trading_symbol: String,
    #[serde(rename = "ExchangeSegment", default)]
    exchange_segment: Option<String>,
    #[serde(rename = "Quantity")]
    quantity: i64,
    #[serde(rename = "BuyAveragePrice")]
    buy_average_price: Decimal,
    #[serde(rename = "LastTradedPrice", default)]
    last_traded_price: Decimal,
    #[serde(rename = "UnrealizedMTM", default)]
    unrealized_mtm: Decimal,
    #[serde(rename = "ProductType", default)]
    product_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XtsProfile {
    #[serde(rename = "ClientId")]
    client_id: String,
    #[serde(rename = "ClientName", default)]
    client_name: Option<String>,
    #[serde(rename = "EmailId", default)]
    email_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XtsOrderAck {
    #[serde(rename = "AppOrderID")]
    app_order_id: i64,
}

/// XTS names exchange segments `NSECM`/`NSEFO`/...; map to the exchange
/// codes the normalizer understands.
fn segment_to_exchange(segment: Option<&str>) -> Option<String> {
    segment.map(|s| {
        match s {
            "NSECM" => "NSE",
            "NSEFO" => "NFO",
            "NSECD" => "CDS",
            "BSECM" => "BSE",
            "MCXFO" => "MCX",
            other => other,
        }
        .to_string()
    })
}

fn map_holding(connection_id: Uuid, h: XtsHolding) -> RawPosition {
    RawPosition {
        symbol: h.trading_symbol,
        exchange: segment_to_exchange(h.exchange_segment.as_deref()),
        quantity: h.holding_quantity,
        avg_price: h.buy_avg_price,
        last_traded_price: h.last_traded_price,
        pnl: Decimal::ZERO,
        day_change: None,
        position_type: None,
        isin: h.isin,
        connection_id,
    }
}

fn map_position(connection_id: Uuid, p: XtsPosition) -> RawPosition {
    RawPosition {
        symbol: p.trading_symbol,
        exchange: segment_to_exchange(p.exchange_segment.as_deref()),
        quantity: p.quantity,
        avg_price: p.buy_average_price,
        last_traded_price: p.last_traded_price,
        pnl: p.unrealized_mtm,
        day_change: None,
        position_type: p.product_type,
        isin: None,
        connection_id,
    }
}

fn xts_order_type(t: OrderType) -> &'static str {
    match t {
        OrderType::Market | OrderType::Bracket => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::StopLoss => "STOPMARKET",
    }
}

#[async_trait]
impl BrokerAdapter for IiflAdapter {
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
                ApiCall::get(self.url("/interactive/portfolio/holdings")).with_token(access_token),
                deadline,
            )
            .await?;
        let envelope: XtsEnvelope<XtsHoldings> = decode(KIND, response).await?;

        Ok(BrokerPortfolio {
            connection_id: conn.id,
            broker: KIND,
            positions: envelope
                .into_result()?
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
                ApiCall::get(self.url("/interactive/portfolio/positions")).with_token(access_token),
                deadline,
            )
            .await?;
        let envelope: XtsEnvelope<XtsPositions> = decode(KIND, response).await?;
        Ok(envelope
            .into_result()?
            .position_list
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
                ApiCall::get(self.url("/interactive/user/profile")).with_token(access_token),
                deadline,
            )
            .await?;
        let envelope: XtsEnvelope<XtsProfile> = decode(KIND, response).await?;
        let profile = envelope.into_result()?;
        Ok(BrokerAccount {
            account_id: profile.client_id,
            name: profile.client_name,
            email: profile.email_id,
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
        let segment = match order.exchange.as_str() {
            "NFO" => "NSEFO",
            "BSE" => "BSECM",
            "CDS" => "NSECD",
            "MCX" => "MCXFO",
            _ => "NSECM",
        };
        let body = serde_json::json!({
            "exchangeSegment": segment,
            "productType": "CNC",
            "orderType": xts_order_type(order.order_type),
            "orderSide": order.side.to_string(),
            "timeInForce": "DAY",
            "orderQuantity": order.quantity,
            "limitPrice": order.price.unwrap_or(Decimal::ZERO),
            "stopPrice": order.trigger_price.unwrap_or(Decimal::ZERO),
            "orderUniqueIdentifier": Uuid::new_v4().to_string(),
            "tradingSymbol": order.symbol,
        });

        let response = self
            .pool
            .execute(
                KIND,
                ApiCall::post(self.url("/interactive/orders"))
                    .with_token(access_token)
                    .with_json(body),
                deadline,
            )
            .await?;
        let envelope: XtsEnvelope<XtsOrderAck> = decode(KIND, response).await?;
        let ack = envelope.into_result()?;
        Ok(BrokerOrderAck {
            broker_order_id: ack.app_order_id.to_string(),
            status_text: "success".into(),
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

    #[test]
    fn exchange_segments_map_to_normalizer_codes() {
        assert_eq!(segment_to_exchange(Some("NSECM")).as_deref(), Some("NSE"));
        assert_eq!(segment_to_exchange(Some("NSEFO")).as_deref(), Some("NFO"));
        assert_eq!(segment_to_exchange(Some("XXX")).as_deref(), Some("XXX"));
        assert_eq!(segment_to_exchange(None), None);
    }

    #[test]
    fn error_envelope_carries_description() {
        let envelope: XtsEnvelope<XtsHoldings> = serde_json::from_value(serde_json::json!({
            "type": "error",
            "description": "Invalid token",
            "result": null
        }))
        .unwrap();
        let err = envelope.into_result().unwrap_err();
        assert!(err.to_string().contains("Invalid token"));
    }

    #[test]
    fn holding_maps_with_segment_translation() {
        let h: XtsHolding = serde_json::from_value(serde_json::json!({
            "TradingSymbol": "ITC",
            "ExchangeSegment": "NSECM",
            "ISIN": "INE154A01025",
            "HoldingQuantity": 120,
            "BuyAvgPrice": 440.25,
            "LastTradedPrice": 452.00
        }))
        .unwrap();

        let raw = map_holding(Uuid::new_v4(), h);
        assert_eq!(raw.exchange.as_deref(), Some("NSE"));
        assert_eq!(raw.quantity, 120);
    }
}
