//! Gateway facade: the 30-second portfolio cache and its eager
//! invalidation on connectivity changes.

mod common;

use common::{rig, seed_connection};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tradegate::application::aggregator::Aggregator;
use tradegate::application::fetcher::PortfolioFetcher;
use tradegate::application::gateway::TradeGateway;
use tradegate::application::oauth::OAuthCoordinator;
use tradegate::application::router::OrderRouter;
use tradegate::domain::broker::BrokerKind;
use tradegate::domain::portfolio::RawPosition;
use tradegate::domain::ports::FxOracle;
use tradegate::infrastructure::catalog::StaticAssetCatalog;
use tradegate::infrastructure::core::http::HttpClientPool;
use tradegate::infrastructure::core::rate_limiter::RateLimiter;
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

fn holdings() -> Vec<RawPosition> {
    vec![RawPosition {
        symbol: "TCS".into(),
        exchange: Some("NSE".into()),
        quantity: 10,
        avg_price: dec!(3400.00),
        last_traded_price: dec!(3500.00),
        pnl: dec!(1000.00),
        day_change: None,
        position_type: None,
        isin: None,
        connection_id: Uuid::nil(),
    }]
}

async fn gateway(
    adapter: Arc<MockBrokerAdapter>,
) -> (Arc<TradeGateway>, common::TestRig, Arc<MockPriceOracle>) {
    let rig = rig(Arc::new(MockAuthProvider::new()), vec![adapter]);
    let oracle = Arc::new(MockPriceOracle::new());
    oracle.set_price("TCS", dec!(3500.00)).await;

    let fetcher = PortfolioFetcher::new(
        rig.manager.clone(),
        rig.adapters.clone(),
        rig.breakers.clone(),
        Duration::from_secs(2),
    );
    let aggregator = Aggregator::new(
        oracle.clone(),
        Arc::new(NoFx),
        Arc::new(StaticAssetCatalog),
    );
    let router = OrderRouter::new(
        rig.manager.clone(),
        rig.adapters.clone(),
        rig.breakers.clone(),
        oracle.clone(),
        Duration::from_secs(2),
    );
    let oauth = Arc::new(OAuthCoordinator::new(
        Arc::new(HttpClientPool::new(Arc::new(RateLimiter::new()))),
        rig.breakers.clone(),
        HashMap::new(),
    ));

    let gw = TradeGateway::with_components(
        rig.manager.clone(),
        fetcher,
        aggregator,
        router,
        oauth,
        Duration::from_secs(30),
    );
    (gw, rig, oracle)
}

#[tokio::test]
async fn portfolio_is_cached_within_ttl() {
    let adapter = Arc::new(MockBrokerAdapter::new(
        BrokerKind::Zerodha,
        MockBehavior::Positions(holdings()),
    ));
    let (gw, rig, _) = gateway(adapter.clone()).await;
    seed_connection(&rig, "u1", BrokerKind::Zerodha, 7200, false).await;

    let first = gw.get_portfolio("u1").await.unwrap();
    assert_eq!(first.positions.len(), 1);
    assert_eq!(adapter.fetch_calls.load(Ordering::SeqCst), 1);

    // Second read inside the TTL never reaches the broker.
    let second = gw.get_portfolio("u1").await.unwrap();
    assert_eq!(second.positions.len(), 1);
    assert_eq!(adapter.fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.last_updated, first.last_updated);
}

#[tokio::test]
async fn disconnect_invalidates_the_cache() {
    let adapter = Arc::new(MockBrokerAdapter::new(
        BrokerKind::Zerodha,
        MockBehavior::Positions(holdings()),
    ));
    let (gw, rig, _) = gateway(adapter.clone()).await;
    let conn = seed_connection(&rig, "u1", BrokerKind::Zerodha, 7200, false).await;

    let first = gw.get_portfolio("u1").await.unwrap();
    assert_eq!(first.positions.len(), 1);

    gw.disconnect("u1", conn.id).await.unwrap();

    // The cached pre-disconnect view must not be served.
    let after = gw.get_portfolio("u1").await.unwrap();
    assert!(after.positions.is_empty());
}

#[tokio::test]
async fn caches_are_per_user() {
    let adapter = Arc::new(MockBrokerAdapter::new(
        BrokerKind::Zerodha,
        MockBehavior::Positions(holdings()),
    ));
    let (gw, rig, _) = gateway(adapter.clone()).await;
    seed_connection(&rig, "u1", BrokerKind::Zerodha, 7200, false).await;
    seed_connection(&rig, "u2", BrokerKind::Zerodha, 7200, false).await;

    gw.get_portfolio("u1").await.unwrap();
    gw.get_portfolio("u2").await.unwrap();
    // One fan-out per user; caches do not bleed across users.
    assert_eq!(adapter.fetch_calls.load(Ordering::SeqCst), 2);
}
