use crate::domain::broker::BrokerKind;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    Bracket,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::StopLoss => write!(f, "STOPLOSS"),
            OrderType::Bracket => write!(f, "BRACKET"),
        }
    }
}

/// An order as submitted by the user, before broker selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub exchange: Option<String>,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: i64,
    /// Limit price; required for Limit orders.
    pub price: Option<Decimal>,
    /// Trigger price; required for StopLoss orders.
    pub stop_price: Option<Decimal>,
    /// Profit target; required for Bracket orders.
    pub target_price: Option<Decimal>,
}

/// The fully resolved order handed to a broker adapter for placement.
#[derive(Debug, Clone)]
pub struct BrokerOrder {
    pub symbol: String,
    pub exchange: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: i64,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
}

/// Broker-side acknowledgement of a placed order.
#[derive(Debug, Clone)]
pub struct BrokerOrderAck {
    pub broker_order_id: String,
    pub status_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderOutcome {
    Executed,
    Pending,
    Failed,
}

impl fmt::Display for OrderOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Target/stop legs recorded on a bracket fill. Emission of the child
/// orders is the caller's responsibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketLegs {
    pub target_price: Decimal,
    pub stop_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: Uuid,
    pub broker: Option<BrokerKind>,
    pub connection_id: Option<Uuid>,
    pub broker_order_id: Option<String>,
    pub status: OrderOutcome,
    pub executed_price: Option<Decimal>,
    pub quantity: i64,
    pub executed_value: Option<Decimal>,
    pub bracket_legs: Option<BracketLegs>,
    pub reason: Option<String>,
    pub placed_at: DateTime<Utc>,
}

impl OrderResult {
    pub fn failed(quantity: i64, reason: impl Into<String>) -> Self {
        Self {
            order_id: Uuid::new_v4(),
            broker: None,
            connection_id: None,
            broker_order_id: None,
            status: OrderOutcome::Failed,
            executed_price: None,
            quantity,
            executed_value: None,
            bracket_legs: None,
            reason: Some(reason.into()),
            placed_at: Utc::now(),
        }
    }
}
