//! End-to-end read path: parallel fetch over mock broker adapters,
//! normalization, and cross-broker consolidation.

mod common;

use common::{rig, seed_connection};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tradegate::application::aggregator::Aggregator;
use tradegate::application::fetcher::PortfolioFetcher;
use tradegate::domain::broker::BrokerKind;
use tradegate::domain::errors::GatewayError;
use tradegate::domain::portfolio::{FetchOutcomeKind, RawPosition};
use tradegate::domain::ports::{ConnectionStore, FxOracle};
use tradegate::infrastructure::catalog::StaticAssetCatalog;
use tradegate::infrastructure::mock::{
    MockAuthProvider, MockBehavior, MockBrokerAdapter, MockPriceOracle,
};
use uuid::Uuid;

struct NoFx;

#[async_trait::async_trait]
impl FxOracle for NoFx {
    async fn rate(&self, _from: &str, _to: &str) -> Option<Decimal> {
        None
    }
}

fn raw(symbol: &str, qty: i64, avg: Decimal) -> RawPosition {
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
        connection_id: Uuid::nil(),
    }
}

#[tokio::test]
async fn same_symbol_held_at_two_brokers_consolidates() {
    let zerodha = Arc::new(MockBrokerAdapter::new(
        BrokerKind::Zerodha,
        MockBehavior::Positions(vec![raw("RELIANCE", 100, dec!(2500.00))]),
    ));
    let angel = Arc::new(MockBrokerAdapter::new(
        BrokerKind::AngelOne,
        MockBehavior::Positions(vec![raw("RELIANCE-EQ", 50, dec!(2600.00))]),
    ));
    let rig = rig(
        Arc::new(MockAuthProvider::new()),
        vec![zerodha.clone(), angel.clone()],
    );

    seed_connection(&rig, "u1", BrokerKind::Zerodha, 7200, false).await;
    seed_connection(&rig, "u1", BrokerKind::AngelOne, 7200, true).await;

    let fetcher = PortfolioFetcher::new(
        rig.manager.clone(),
        rig.adapters.clone(),
        rig.breakers.clone(),
        Duration::from_secs(2),
    );
    let outcome = fetcher.fetch_all("u1").await.unwrap();
    assert_eq!(outcome.portfolios.len(), 2);
    assert!(outcome
        .statuses
        .iter()
        .all(|s| s.outcome == FetchOutcomeKind::Ok));

    let oracle = Arc::new(MockPriceOracle::new());
    oracle.set_price("RELIANCE", dec!(2700.00)).await;
    let aggregator = Aggregator::new(oracle, Arc::new(NoFx), Arc::new(StaticAssetCatalog));
    let portfolio = aggregator
        .aggregate("u1", &outcome.portfolios, outcome.statuses)
        .await;

    assert_eq!(portfolio.positions.len(), 1);
    let pos = &portfolio.positions[0];
    assert_eq!(pos.symbol, "RELIANCE");
    assert_eq!(pos.total_quantity, 150);
    assert_eq!(pos.weighted_avg_price, dec!(2533.3333));
    assert_eq!(pos.current_value, dec!(405000.00));
    assert_eq!(pos.unrealized_pnl, dec!(25000.00));
    assert_eq!(pos.slices.len(), 2);

    // The portfolio totals mirror the single position.
    assert_eq!(portfolio.total_value, pos.current_value);
    let alloc_sum: Decimal = portfolio
        .broker_breakdown
        .iter()
        .map(|b| b.allocation_pct)
        .sum();
    assert!(alloc_sum >= dec!(99.99) && alloc_sum <= dec!(100.01));
}

#[tokio::test]
async fn one_failing_broker_is_isolated() {
    let a = Arc::new(MockBrokerAdapter::new(
        BrokerKind::Zerodha,
        MockBehavior::Positions(vec![raw("TCS", 10, dec!(3400.00))]),
    ));
    let b = Arc::new(MockBrokerAdapter::new(
        BrokerKind::Upstox,
        MockBehavior::Transport("connection reset by peer".into()),
    ));
    let c = Arc::new(MockBrokerAdapter::new(
        BrokerKind::Fyers,
        MockBehavior::Positions(vec![raw("INFY", 20, dec!(1500.00))]),
    ));
    let rig = rig(Arc::new(MockAuthProvider::new()), vec![a, b, c]);

    seed_connection(&rig, "u1", BrokerKind::Zerodha, 7200, false).await;
    let upstox_conn = seed_connection(&rig, "u1", BrokerKind::Upstox, 7200, true).await;
    seed_connection(&rig, "u1", BrokerKind::Fyers, 7200, true).await;

    let fetcher = PortfolioFetcher::new(
        rig.manager.clone(),
        rig.adapters.clone(),
        rig.breakers.clone(),
        Duration::from_secs(2),
    );
    let outcome = fetcher.fetch_all("u1").await.unwrap();

    assert_eq!(outcome.portfolios.len(), 2);
    let upstox_status = outcome
        .statuses
        .iter()
        .find(|s| s.broker == BrokerKind::Upstox)
        .unwrap();
    assert_eq!(upstox_status.outcome, FetchOutcomeKind::Error);
    assert!(upstox_status.detail.as_deref().unwrap().contains("connection reset"));

    let oracle = Arc::new(MockPriceOracle::new());
    oracle.set_price("TCS", dec!(3500.00)).await;
    oracle.set_price("INFY", dec!(1550.00)).await;
    let aggregator = Aggregator::new(oracle, Arc::new(NoFx), Arc::new(StaticAssetCatalog));
    let portfolio = aggregator
        .aggregate("u1", &outcome.portfolios, outcome.statuses)
        .await;

    // Only the two successful brokers contribute to the total.
    let expected = dec!(3500.00) * Decimal::from(10) + dec!(1550.00) * Decimal::from(20);
    assert_eq!(portfolio.total_value, expected);

    // The failure was recorded against the connection's metrics.
    let reloaded = rig
        .store
        .find_by_id(upstox_conn.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.error_count, 1);
    assert_eq!(reloaded.consecutive_failures, 1);
}

#[tokio::test]
async fn auth_rejection_refreshes_and_retries_once() {
    let adapter = Arc::new(MockBrokerAdapter::new(
        BrokerKind::Upstox,
        MockBehavior::AuthFailureOnce(vec![raw("TCS", 10, dec!(3400.00))]),
    ));
    let auth = Arc::new(MockAuthProvider::new());
    let rig = rig(auth.clone(), vec![adapter.clone()]);

    // Far from expiry, so only the broker's rejection can trigger the
    // refresh.
    seed_connection(&rig, "u1", BrokerKind::Upstox, 7200, true).await;

    let fetcher = PortfolioFetcher::new(
        rig.manager.clone(),
        rig.adapters.clone(),
        rig.breakers.clone(),
        Duration::from_secs(2),
    );
    let outcome = fetcher.fetch_all("u1").await.unwrap();

    assert_eq!(outcome.portfolios.len(), 1);
    assert!(outcome
        .statuses
        .iter()
        .all(|s| s.outcome == FetchOutcomeKind::Ok));
    assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(adapter.fetch_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn auth_rejection_without_refresh_token_is_not_retried() {
    // Zerodha connections carry no refresh token; the rejection stands.
    let adapter = Arc::new(MockBrokerAdapter::new(
        BrokerKind::Zerodha,
        MockBehavior::AuthFailure("session expired".into()),
    ));
    let auth = Arc::new(MockAuthProvider::new());
    let rig = rig(auth.clone(), vec![adapter.clone()]);
    seed_connection(&rig, "u1", BrokerKind::Zerodha, 7200, false).await;

    let fetcher = PortfolioFetcher::new(
        rig.manager.clone(),
        rig.adapters.clone(),
        rig.breakers.clone(),
        Duration::from_secs(2),
    );
    let err = fetcher.fetch_all("u1").await.unwrap_err();
    assert!(matches!(err, GatewayError::AllBrokersFailed));
    assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 0);
    assert_eq!(adapter.fetch_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn all_brokers_failing_is_an_error() {
    let a = Arc::new(MockBrokerAdapter::new(
        BrokerKind::Zerodha,
        MockBehavior::Transport("down".into()),
    ));
    let b = Arc::new(MockBrokerAdapter::new(
        BrokerKind::Upstox,
        MockBehavior::Transport("down".into()),
    ));
    let rig = rig(Arc::new(MockAuthProvider::new()), vec![a, b]);

    seed_connection(&rig, "u1", BrokerKind::Zerodha, 7200, false).await;
    seed_connection(&rig, "u1", BrokerKind::Upstox, 7200, true).await;

    let fetcher = PortfolioFetcher::new(
        rig.manager.clone(),
        rig.adapters.clone(),
        rig.breakers.clone(),
        Duration::from_secs(2),
    );
    let err = fetcher.fetch_all("u1").await.unwrap_err();
    assert!(matches!(err, GatewayError::AllBrokersFailed));
}

#[tokio::test]
async fn no_connections_is_an_empty_portfolio_not_an_error() {
    let rig = rig(Arc::new(MockAuthProvider::new()), vec![]);
    let fetcher = PortfolioFetcher::new(
        rig.manager.clone(),
        rig.adapters.clone(),
        rig.breakers.clone(),
        Duration::from_secs(2),
    );
    let outcome = fetcher.fetch_all("nobody").await.unwrap();
    assert!(outcome.portfolios.is_empty());
    assert!(outcome.statuses.is_empty());
}

#[tokio::test]
async fn slow_broker_is_cut_off_at_the_shared_deadline() {
    let fast = Arc::new(MockBrokerAdapter::new(
        BrokerKind::Zerodha,
        MockBehavior::Positions(vec![raw("SBIN", 100, dec!(600.00))]),
    ));
    let slow = Arc::new(MockBrokerAdapter::new(
        BrokerKind::Iifl,
        MockBehavior::Delay(Duration::from_secs(5), vec![raw("ITC", 10, dec!(450.00))]),
    ));
    let rig = rig(Arc::new(MockAuthProvider::new()), vec![fast, slow]);

    seed_connection(&rig, "u1", BrokerKind::Zerodha, 7200, false).await;
    seed_connection(&rig, "u1", BrokerKind::Iifl, 7200, true).await;

    let fetcher = PortfolioFetcher::new(
        rig.manager.clone(),
        rig.adapters.clone(),
        rig.breakers.clone(),
        Duration::from_millis(300),
    );
    let outcome = fetcher.fetch_all("u1").await.unwrap();

    assert_eq!(outcome.portfolios.len(), 1);
    assert_eq!(outcome.portfolios[0].broker, BrokerKind::Zerodha);
    let slow_status = outcome
        .statuses
        .iter()
        .find(|s| s.broker == BrokerKind::Iifl)
        .unwrap();
    assert_eq!(slow_status.outcome, FetchOutcomeKind::Error);
    assert!(slow_status.detail.as_deref().unwrap().contains("deadline"));
}
