//! Weighted cross-broker consolidation: group normalized positions by
//! symbol, price them, compute cost basis and P&L, roll up per-broker and
//! per-asset-class allocations, and grade freshness.
//!
//! All percentage and money arithmetic is fixed-scale decimal (scale 4,
//! half-up); division by zero yields zero.

use crate::application::normalizer;
use crate::domain::portfolio::{
    AssetAllocation, BrokerBreakdown, BrokerPortfolio, BrokerSlice, ConsolidatedPortfolio,
    ConsolidatedPosition, FetchStatus, Freshness, NormalizedPosition, PositionSide, scale4,
};
use crate::domain::ports::{AssetCatalog, FxOracle, PriceOracle};
use crate::infrastructure::catalog;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const BASE_CURRENCY: &str = "INR";

pub struct Aggregator {
    price_oracle: Arc<dyn PriceOracle>,
    fx_oracle: Arc<dyn FxOracle>,
    asset_catalog: Arc<dyn AssetCatalog>,
}

fn pct(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator.is_zero() {
        Decimal::ZERO
    } else {
        scale4(numerator / denominator * Decimal::ONE_HUNDRED)
    }
}

fn signed(pos: &NormalizedPosition) -> i64 {
    match pos.side {
        PositionSide::Long => pos.quantity,
        PositionSide::Short => -pos.quantity,
    }
}

impl Aggregator {
    pub fn new(
        price_oracle: Arc<dyn PriceOracle>,
        fx_oracle: Arc<dyn FxOracle>,
        asset_catalog: Arc<dyn AssetCatalog>,
    ) -> Self {
        Self {
            price_oracle,
            fx_oracle,
            asset_catalog,
        }
    }

    pub async fn aggregate(
        &self,
        user_id: &str,
        portfolios: &[BrokerPortfolio],
        broker_statuses: Vec<FetchStatus>,
    ) -> ConsolidatedPortfolio {
        let now = Utc::now();

        // Flatten, convert to base currency, normalize, group by symbol.
        let mut groups: BTreeMap<String, Vec<NormalizedPosition>> = BTreeMap::new();
        for bp in portfolios {
            let fx = self.base_rate(bp.currency.as_deref()).await;
            for raw in &bp.positions {
                if let Some(mut pos) = normalizer::normalize(bp.broker, raw, self.asset_catalog.as_ref())
                {
                    if fx != Decimal::ONE {
                        pos.avg_price = scale4(pos.avg_price * fx);
                        pos.last_traded_price = scale4(pos.last_traded_price * fx);
                        pos.pnl *= fx;
                        pos.day_change *= fx;
                    }
                    groups.entry(pos.normalized_symbol.clone()).or_default().push(pos);
                }
            }
        }

        let symbols: Vec<String> = groups.keys().cloned().collect();
        let prices = self.price_oracle.batch_prices(&symbols).await;

        let mut positions: Vec<ConsolidatedPosition> = Vec::with_capacity(groups.len());
        for (symbol, members) in groups {
            let total_quantity: i64 = members.iter().map(signed).sum();
            let total_cost: Decimal = members
                .iter()
                .map(|p| Decimal::from(signed(p)) * p.avg_price)
                .sum();
            let weighted_avg_price = if total_quantity > 0 {
                scale4(total_cost / Decimal::from(total_quantity))
            } else {
                Decimal::ZERO
            };

            let current_price = prices
                .get(&symbol)
                .copied()
                .unwrap_or(weighted_avg_price);
            let current_value = scale4(Decimal::from(total_quantity) * current_price);
            let unrealized_pnl = current_value - scale4(total_cost);
            let day_change: Decimal = members.iter().map(|p| p.day_change).sum();

            let slices = members
                .iter()
                .map(|p| BrokerSlice {
                    broker: p.broker,
                    connection_id: p.connection_id,
                    quantity: signed(p),
                    avg_price: p.avg_price,
                    value: scale4(Decimal::from(signed(p)) * current_price),
                })
                .collect();

            let (company_name, sector, asset_class) = self.enrich(&symbol);

            positions.push(ConsolidatedPosition {
                symbol,
                company_name,
                sector,
                asset_class,
                total_quantity,
                weighted_avg_price,
                current_price,
                total_cost: scale4(total_cost),
                current_value,
                unrealized_pnl,
                unrealized_pnl_pct: pct(unrealized_pnl, scale4(total_cost)),
                day_change,
                day_change_pct: pct(day_change, current_value - day_change),
                slices,
            });
        }

        let total_value: Decimal = positions.iter().map(|p| p.current_value).sum();
        let total_cost: Decimal = positions.iter().map(|p| p.total_cost).sum();
        let unrealized_pnl = total_value - total_cost;
        let day_change: Decimal = positions.iter().map(|p| p.day_change).sum();

        let broker_breakdown = Self::broker_breakdown(&positions, portfolios, total_value);
        let asset_allocation = Self::asset_allocation(&positions, total_value);

        // Freshness is bounded by the oldest input slice.
        let freshness = portfolios
            .iter()
            .map(|bp| Freshness::from_age(now - bp.fetched_at))
            .max_by_key(|f| match f {
                Freshness::RealTime => 0,
                Freshness::Fresh => 1,
                Freshness::Stale => 2,
                Freshness::VeryStale => 3,
            })
            .unwrap_or(Freshness::RealTime);

        positions.sort_by(|a, b| b.current_value.cmp(&a.current_value));

        debug!(
            user_id,
            position_count = positions.len(),
            brokers = portfolios.len(),
            %total_value,
            "aggregated consolidated portfolio"
        );

        ConsolidatedPortfolio {
            user_id: user_id.to_string(),
            total_value,
            total_cost,
            unrealized_pnl,
            unrealized_pnl_pct: pct(unrealized_pnl, total_cost),
            day_change,
            day_change_pct: pct(day_change, total_value - day_change),
            positions,
            broker_breakdown,
            asset_allocation,
            broker_statuses,
            last_updated: now,
            freshness,
        }
    }

    async fn base_rate(&self, currency: Option<&str>) -> Decimal {
        match currency {
            None => Decimal::ONE,
            Some(c) if c == BASE_CURRENCY => Decimal::ONE,
            Some(c) => self.fx_oracle.rate(c, BASE_CURRENCY).await.unwrap_or(Decimal::ONE),
        }
    }

    /// Catalog enrichment with the built-in table of well-known symbols as
    /// fallback; asset class defaults to EQUITY.
    fn enrich(&self, symbol: &str) -> (Option<String>, Option<String>, String) {
        let static_info = catalog::lookup(symbol);
        let company_name = self
            .asset_catalog
            .company_name(symbol)
            .or_else(|| static_info.map(|a| a.company_name.to_string()));
        let sector = self
            .asset_catalog
            .sector(symbol)
            .or_else(|| static_info.map(|a| a.sector.to_string()));
        let asset_class = self
            .asset_catalog
            .asset_class(symbol)
            .or_else(|| static_info.map(|a| a.asset_class.to_string()))
            .unwrap_or_else(|| "EQUITY".to_string());
        (company_name, sector, asset_class)
    }

    fn broker_breakdown(
        positions: &[ConsolidatedPosition],
        portfolios: &[BrokerPortfolio],
        total_value: Decimal,
    ) -> Vec<BrokerBreakdown> {
        let mut per_connection: BTreeMap<Uuid, (Decimal, usize)> = BTreeMap::new();
        for pos in positions {
            for slice in &pos.slices {
                let entry = per_connection.entry(slice.connection_id).or_default();
                entry.0 += slice.value;
                entry.1 += 1;
            }
        }

        let mut breakdown: Vec<BrokerBreakdown> = portfolios
            .iter()
            .map(|bp| {
                let (value, position_count) = per_connection
                    .get(&bp.connection_id)
                    .copied()
                    .unwrap_or((Decimal::ZERO, 0));
                BrokerBreakdown {
                    broker: bp.broker,
                    connection_id: bp.connection_id,
                    value,
                    allocation_pct: pct(value, total_value),
                    position_count,
                }
            })
            .collect();
        breakdown.sort_by(|a, b| b.value.cmp(&a.value));
        breakdown
    }

    fn asset_allocation(
        positions: &[ConsolidatedPosition],
        total_value: Decimal,
    ) -> Vec<AssetAllocation> {
        let mut per_class: BTreeMap<String, Decimal> = BTreeMap::new();
        for pos in positions {
            *per_class.entry(pos.asset_class.clone()).or_default() += pos.current_value;
        }

        let mut allocation: Vec<AssetAllocation> = per_class
            .into_iter()
            .map(|(asset_class, value)| AssetAllocation {
                asset_class,
                value,
                allocation_pct: pct(value, total_value),
            })
            .collect();
        allocation.sort_by(|a, b| b.value.cmp(&a.value));
        allocation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::broker::BrokerKind;
    use crate::domain::portfolio::RawPosition;
    use crate::infrastructure::catalog::StaticAssetCatalog;
    use crate::infrastructure::mock::MockPriceOracle;
    use rust_decimal_macros::dec;

    struct NoFx;

    #[async_trait::async_trait]
    impl FxOracle for NoFx {
        async fn rate(&self, _from: &str, _to: &str) -> Option<Decimal> {
            None
        }
    }

    fn raw(symbol: &str, qty: i64, avg: Decimal, conn: Uuid) -> RawPosition {
        RawPosition {
            symbol: symbol.to_string(),
            exchange: Some("NSE".into()),
            quantity: qty,
            avg_price: avg,
            last_traded_price: avg,
            pnl: Decimal::ZERO,
            day_change: None,
            position_type: None,
            isin: None,
            connection_id: conn,
        }
    }

    fn portfolio(broker: BrokerKind, positions: Vec<RawPosition>) -> BrokerPortfolio {
        BrokerPortfolio {
            connection_id: positions
                .first()
                .map(|p| p.connection_id)
                .unwrap_or_else(Uuid::new_v4),
            broker,
            positions,
            currency: None,
            fetched_at: Utc::now(),
        }
    }

    fn aggregator(oracle: Arc<MockPriceOracle>) -> Aggregator {
        Aggregator::new(oracle, Arc::new(NoFx), Arc::new(StaticAssetCatalog))
    }

    #[tokio::test]
    async fn same_symbol_across_two_brokers_merges() {
        let oracle = Arc::new(MockPriceOracle::new());
        oracle.set_price("RELIANCE", dec!(2700.00)).await;

        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        let inputs = vec![
            portfolio(BrokerKind::Zerodha, vec![raw("RELIANCE", 100, dec!(2500.00), conn_a)]),
            portfolio(BrokerKind::AngelOne, vec![raw("RELIANCE-EQ", 50, dec!(2600.00), conn_b)]),
        ];

        let result = aggregator(oracle).aggregate("u1", &inputs, vec![]).await;

        assert_eq!(result.positions.len(), 1);
        let pos = &result.positions[0];
        assert_eq!(pos.symbol, "RELIANCE");
        assert_eq!(pos.total_quantity, 150);
        assert_eq!(pos.weighted_avg_price, dec!(2533.3333));
        assert_eq!(pos.current_value, dec!(405000.0000));
        assert_eq!(pos.unrealized_pnl, dec!(25000.0000));
        assert_eq!(pos.slices.len(), 2);

        // Consolidation invariants.
        let slice_qty: i64 = pos.slices.iter().map(|s| s.quantity).sum();
        assert_eq!(slice_qty, pos.total_quantity);
        let slice_cost: Decimal = pos
            .slices
            .iter()
            .map(|s| Decimal::from(s.quantity) * s.avg_price)
            .sum();
        assert_eq!(scale4(slice_cost), pos.total_cost);
    }

    #[tokio::test]
    async fn oracle_miss_defaults_price_to_weighted_avg() {
        let oracle = Arc::new(MockPriceOracle::new());
        let conn = Uuid::new_v4();
        let inputs = vec![portfolio(
            BrokerKind::Zerodha,
            vec![raw("OBSCURECO", 10, dec!(150.00), conn)],
        )];

        let result = aggregator(oracle).aggregate("u1", &inputs, vec![]).await;
        let pos = &result.positions[0];
        assert_eq!(pos.current_price, pos.weighted_avg_price);
        assert_eq!(pos.unrealized_pnl, Decimal::ZERO);
    }

    #[tokio::test]
    async fn breakdown_percentages_sum_to_one_hundred() {
        let oracle = Arc::new(MockPriceOracle::new());
        oracle.set_price("TCS", dec!(3500.00)).await;
        oracle.set_price("INFY", dec!(1500.00)).await;

        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        let inputs = vec![
            portfolio(BrokerKind::Zerodha, vec![raw("TCS", 30, dec!(3400.00), conn_a)]),
            portfolio(BrokerKind::Upstox, vec![raw("INFY", 100, dec!(1400.00), conn_b)]),
        ];

        let result = aggregator(oracle).aggregate("u1", &inputs, vec![]).await;
        let pct_sum: Decimal = result.broker_breakdown.iter().map(|b| b.allocation_pct).sum();
        assert!(pct_sum >= dec!(99.99) && pct_sum <= dec!(100.01));

        // Ordered by value descending.
        assert!(result.broker_breakdown[0].value >= result.broker_breakdown[1].value);

        let total: Decimal = result.positions.iter().map(|p| p.current_value).sum();
        assert_eq!(total, result.total_value);
    }

    #[tokio::test]
    async fn asset_classes_roll_up_with_equity_default() {
        let oracle = Arc::new(MockPriceOracle::new());
        oracle.set_price("NIFTYBEES", dec!(250.00)).await;
        oracle.set_price("ZOMATO", dec!(200.00)).await;

        let conn = Uuid::new_v4();
        let inputs = vec![portfolio(
            BrokerKind::Zerodha,
            vec![
                raw("NIFTYBEES", 100, dec!(240.00), conn),
                raw("ZOMATO", 50, dec!(180.00), conn),
            ],
        )];

        let result = aggregator(oracle).aggregate("u1", &inputs, vec![]).await;
        let classes: Vec<&str> = result
            .asset_allocation
            .iter()
            .map(|a| a.asset_class.as_str())
            .collect();
        assert!(classes.contains(&"ETF"));
        assert!(classes.contains(&"EQUITY"));
    }

    #[tokio::test]
    async fn freshness_tracks_oldest_input() {
        let oracle = Arc::new(MockPriceOracle::new());
        oracle.set_price("TCS", dec!(3500.00)).await;

        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        let mut fresh = portfolio(BrokerKind::Zerodha, vec![raw("TCS", 1, dec!(3400.00), conn_a)]);
        fresh.fetched_at = Utc::now();
        let mut stale = portfolio(BrokerKind::Upstox, vec![raw("TCS", 1, dec!(3400.00), conn_b)]);
        stale.fetched_at = Utc::now() - chrono::Duration::minutes(10);

        let result = aggregator(oracle)
            .aggregate("u1", &[fresh, stale], vec![])
            .await;
        assert_eq!(result.freshness, Freshness::Stale);
    }

    #[tokio::test]
    async fn empty_input_produces_empty_portfolio() {
        let oracle = Arc::new(MockPriceOracle::new());
        let result = aggregator(oracle).aggregate("u1", &[], vec![]).await;
        assert!(result.positions.is_empty());
        assert_eq!(result.total_value, Decimal::ZERO);
        assert_eq!(result.unrealized_pnl_pct, Decimal::ZERO);
        assert_eq!(result.freshness, Freshness::RealTime);
    }
}
