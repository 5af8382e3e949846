//! Position and portfolio models, from raw broker payloads through the
//! normalized and consolidated views.
//!
//! All monetary values are `Decimal` in the portfolio base currency (INR)
//! at scale 4.

use crate::domain::broker::BrokerKind;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Round half-up to the fixed money scale used throughout aggregation.
pub fn scale4(d: Decimal) -> Decimal {
    d.round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
}

/// A position exactly as a broker reported it. Symbol, exchange and
/// position type are free-form until normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPosition {
    pub symbol: String,
    pub exchange: Option<String>,
    pub quantity: i64,
    pub avg_price: Decimal,
    pub last_traded_price: Decimal,
    pub pnl: Decimal,
    pub day_change: Option<Decimal>,
    pub position_type: Option<String>,
    pub isin: Option<String>,
    pub connection_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedPosition {
    pub original_symbol: String,
    pub normalized_symbol: String,
    pub original_exchange: Option<String>,
    pub normalized_exchange: String,
    /// Always >= 0; direction lives in `side`.
    pub quantity: i64,
    pub side: PositionSide,
    pub avg_price: Decimal,
    pub last_traded_price: Decimal,
    pub pnl: Decimal,
    pub day_change: Decimal,
    pub broker: BrokerKind,
    pub connection_id: Uuid,
}

/// One broker's contribution to a consolidated position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSlice {
    pub broker: BrokerKind,
    pub connection_id: Uuid,
    pub quantity: i64,
    pub avg_price: Decimal,
    pub value: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedPosition {
    pub symbol: String,
    pub company_name: Option<String>,
    pub sector: Option<String>,
    pub asset_class: String,
    pub total_quantity: i64,
    pub weighted_avg_price: Decimal,
    pub current_price: Decimal,
    pub total_cost: Decimal,
    pub current_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_pct: Decimal,
    pub day_change: Decimal,
    pub day_change_pct: Decimal,
    pub slices: Vec<BrokerSlice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerBreakdown {
    pub broker: BrokerKind,
    pub connection_id: Uuid,
    pub value: Decimal,
    pub allocation_pct: Decimal,
    pub position_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetAllocation {
    pub asset_class: String,
    pub value: Decimal,
    pub allocation_pct: Decimal,
}

/// Age bucket of the oldest input slice in an aggregated result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Freshness {
    /// < 1 minute
    RealTime,
    /// < 5 minutes
    Fresh,
    /// < 30 minutes
    Stale,
    /// >= 30 minutes
    VeryStale,
}

impl Freshness {
    pub fn from_age(age: chrono::Duration) -> Self {
        if age < chrono::Duration::minutes(1) {
            Freshness::RealTime
        } else if age < chrono::Duration::minutes(5) {
            Freshness::Fresh
        } else if age < chrono::Duration::minutes(30) {
            Freshness::Stale
        } else {
            Freshness::VeryStale
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedPortfolio {
    pub user_id: String,
    pub total_value: Decimal,
    pub total_cost: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_pct: Decimal,
    pub day_change: Decimal,
    pub day_change_pct: Decimal,
    pub positions: Vec<ConsolidatedPosition>,
    pub broker_breakdown: Vec<BrokerBreakdown>,
    pub asset_allocation: Vec<AssetAllocation>,
    pub broker_statuses: Vec<FetchStatus>,
    pub last_updated: DateTime<Utc>,
    pub freshness: Freshness,
}

/// Per-broker snapshot returned by one adapter fetch.
#[derive(Debug, Clone)]
pub struct BrokerPortfolio {
    pub connection_id: Uuid,
    pub broker: BrokerKind,
    pub positions: Vec<RawPosition>,
    /// Currency the broker reports values in; `None` means the portfolio
    /// base currency (INR).
    pub currency: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Broker-side account identity, from the profile/whoami endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAccount {
    pub account_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub broker: BrokerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchOutcomeKind {
    Ok,
    Error,
    ServiceUnavailable,
}

/// Per-broker status reported alongside a partially successful fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchStatus {
    pub connection_id: Uuid,
    pub broker: BrokerKind,
    pub outcome: FetchOutcomeKind,
    pub detail: Option<String>,
}
