//! Inbound facade of the gateway: connection lifecycle, consolidated
//! portfolio reads with a short-lived per-user cache, health, and order
//! placement.

use crate::application::aggregator::Aggregator;
use crate::application::connections::{ConnectionManager, ManagerSettings};
use crate::application::fetcher::PortfolioFetcher;
use crate::application::oauth::OAuthCoordinator;
use crate::application::router::OrderRouter;
use crate::config::Config;
use crate::domain::broker::BrokerKind;
use crate::domain::connection::{Connection, HealthSummary, TokenSet};
use crate::domain::errors::GatewayError;
use crate::domain::orders::{OrderOutcome, OrderRequest, OrderResult};
use crate::domain::portfolio::ConsolidatedPortfolio;
use crate::domain::ports::{AssetCatalog, ConnectionStore, FxOracle, PriceOracle};
use crate::infrastructure::adapters::AdapterRegistry;
use crate::infrastructure::core::circuit_breaker::{BreakerConfig, CircuitBreakerRegistry};
use crate::infrastructure::core::http::HttpClientPool;
use crate::infrastructure::core::rate_limiter::RateLimiter;
use crate::infrastructure::fx::CachingFxOracle;
use crate::infrastructure::vault::CredentialVault;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;
use uuid::Uuid;

struct CachedPortfolio {
    portfolio: ConsolidatedPortfolio,
    cached_at: Instant,
}

pub struct TradeGateway {
    manager: Arc<ConnectionManager>,
    fetcher: PortfolioFetcher,
    aggregator: Aggregator,
    router: OrderRouter,
    oauth: Arc<OAuthCoordinator>,
    cache_ttl: Duration,
    cache: RwLock<HashMap<String, CachedPortfolio>>,
}

impl TradeGateway {
    /// Wire the full production stack from configuration plus the
    /// injected collaborator ports.
    pub fn new(
        config: &Config,
        store: Arc<dyn ConnectionStore>,
        price_oracle: Arc<dyn PriceOracle>,
        fx_oracle: Arc<dyn FxOracle>,
        asset_catalog: Arc<dyn AssetCatalog>,
    ) -> Arc<Self> {
        let limiter = Arc::new(RateLimiter::new());
        let pool = Arc::new(HttpClientPool::new(limiter));
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default()));
        let vault = Arc::new(CredentialVault::new(config.vault_master_secret.as_deref()));
        let oauth = Arc::new(OAuthCoordinator::new(
            pool.clone(),
            breakers.clone(),
            config.broker_credentials.clone(),
        ));
        let adapters = Arc::new(AdapterRegistry::new(pool.clone(), &config.broker_credentials));

        let manager = Arc::new(ConnectionManager::new(
            store,
            vault,
            oauth.clone(),
            adapters.clone(),
            breakers.clone(),
            ManagerSettings::from_config(config),
        ));

        let fetcher = PortfolioFetcher::new(
            manager.clone(),
            adapters.clone(),
            breakers.clone(),
            Duration::from_millis(config.fetch_deadline_ms),
        );
        let aggregator = Aggregator::new(
            price_oracle.clone(),
            Arc::new(CachingFxOracle::new(fx_oracle)),
            asset_catalog,
        );
        let router = OrderRouter::new(
            manager.clone(),
            adapters,
            breakers,
            price_oracle,
            Duration::from_millis(config.order_deadline_ms),
        );

        Arc::new(Self {
            manager,
            fetcher,
            aggregator,
            router,
            oauth,
            cache_ttl: Duration::from_secs(config.portfolio_cache_ttl_secs),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Assembly from pre-built parts; used by tests that wire mocks.
    pub fn with_components(
        manager: Arc<ConnectionManager>,
        fetcher: PortfolioFetcher,
        aggregator: Aggregator,
        router: OrderRouter,
        oauth: Arc<OAuthCoordinator>,
        cache_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            fetcher,
            aggregator,
            router,
            oauth,
            cache_ttl,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub async fn build_auth_url(
        &self,
        user_id: &str,
        kind: BrokerKind,
        redirect_uri: &str,
    ) -> Result<Url, GatewayError> {
        Ok(self.oauth.build_auth_url(user_id, kind, redirect_uri).await?)
    }

    /// Complete the authorization-code flow and persist the connection.
    pub async fn connect(
        &self,
        user_id: &str,
        kind: BrokerKind,
        code: &str,
        state: &str,
        redirect_uri: &str,
    ) -> Result<Connection, GatewayError> {
        let (state_user, tokens) = self
            .oauth
            .exchange_code(kind, code, state, redirect_uri)
            .await?;
        if state_user != user_id {
            return Err(GatewayError::Unauthorized);
        }
        let conn = self.manager.connect_with_tokens(user_id, kind, tokens).await?;
        self.invalidate_cache(user_id).await;
        Ok(conn)
    }

    pub async fn connect_with_tokens(
        &self,
        user_id: &str,
        kind: BrokerKind,
        tokens: TokenSet,
    ) -> Result<Connection, GatewayError> {
        let conn = self.manager.connect_with_tokens(user_id, kind, tokens).await?;
        self.invalidate_cache(user_id).await;
        Ok(conn)
    }

    pub async fn disconnect(&self, user_id: &str, connection_id: Uuid) -> Result<(), GatewayError> {
        self.manager.disconnect(user_id, connection_id).await?;
        self.invalidate_cache(user_id).await;
        Ok(())
    }

    pub async fn list_connections(&self, user_id: &str) -> Result<Vec<Connection>, GatewayError> {
        self.manager.list_connections(user_id).await
    }

    pub async fn get_health(&self, user_id: &str) -> Result<HealthSummary, GatewayError> {
        self.manager.health_summary(user_id).await
    }

    /// Consolidated portfolio, served from the per-user cache within the
    /// TTL and rebuilt from a parallel broker fan-out otherwise.
    pub async fn get_portfolio(&self, user_id: &str) -> Result<ConsolidatedPortfolio, GatewayError> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(user_id) {
                if entry.cached_at.elapsed() < self.cache_ttl {
                    debug!(user_id, "portfolio served from cache");
                    return Ok(entry.portfolio.clone());
                }
            }
        }

        let outcome = self.fetcher.fetch_all(user_id).await?;
        let portfolio = self
            .aggregator
            .aggregate(user_id, &outcome.portfolios, outcome.statuses)
            .await;

        self.cache.write().await.insert(
            user_id.to_string(),
            CachedPortfolio {
                portfolio: portfolio.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(portfolio)
    }

    pub async fn place_order(
        &self,
        user_id: &str,
        request: OrderRequest,
    ) -> Result<OrderResult, GatewayError> {
        let result = self.router.route(user_id, request).await?;
        if result.status == OrderOutcome::Executed {
            // The fill changed positions; the next read must not see the
            // pre-trade snapshot.
            self.invalidate_cache(user_id).await;
        }
        Ok(result)
    }

    /// Start the background health-probe loop.
    pub fn spawn_health_probes(&self) -> tokio::task::JoinHandle<()> {
        self.manager.spawn_probe_scheduler()
    }

    async fn invalidate_cache(&self, user_id: &str) {
        self.cache.write().await.remove(user_id);
    }
}
