//! Parallel portfolio fan-out: one task per readable connection under a
//! shared deadline, tolerant of per-broker failures. The caller gets the
//! subset that succeeded plus a status entry per broker.

use crate::application::connections::ConnectionManager;
use crate::domain::connection::Connection;
use crate::domain::errors::{BrokerApiError, GatewayError, OpClass};
use crate::domain::portfolio::{BrokerPortfolio, FetchOutcomeKind, FetchStatus};
use crate::domain::ports::BrokerAdapter;
use crate::infrastructure::adapters::AdapterRegistry;
use crate::infrastructure::core::circuit_breaker::CircuitBreakerRegistry;
use crate::infrastructure::vault::Plaintext;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug)]
pub struct FetchOutcome {
    pub portfolios: Vec<BrokerPortfolio>,
    pub statuses: Vec<FetchStatus>,
}

pub struct PortfolioFetcher {
    manager: Arc<ConnectionManager>,
    adapters: Arc<AdapterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    fetch_deadline: std::time::Duration,
}

impl PortfolioFetcher {
    pub fn new(
        manager: Arc<ConnectionManager>,
        adapters: Arc<AdapterRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        fetch_deadline: std::time::Duration,
    ) -> Self {
        Self {
            manager,
            adapters,
            breakers,
            fetch_deadline,
        }
    }

    /// Fetch every readable connection's portfolio concurrently. Errors
    /// only when every broker failed; zero connections is an empty result.
    pub async fn fetch_all(&self, user_id: &str) -> Result<FetchOutcome, GatewayError> {
        let connections = self.manager.readable_connections(user_id).await?;
        if connections.is_empty() {
            return Ok(FetchOutcome {
                portfolios: Vec::new(),
                statuses: Vec::new(),
            });
        }

        let deadline = Instant::now() + self.fetch_deadline;
        let mut handles = Vec::with_capacity(connections.len());
        for conn in connections {
            let manager = self.manager.clone();
            let adapters = self.adapters.clone();
            let breakers = self.breakers.clone();
            handles.push(tokio::spawn(async move {
                fetch_one(manager, adapters, breakers, conn, deadline).await
            }));
        }

        let mut portfolios = Vec::new();
        let mut statuses = Vec::new();
        for handle in handles {
            match handle.await {
                Ok((status, portfolio)) => {
                    statuses.push(status);
                    if let Some(p) = portfolio {
                        portfolios.push(p);
                    }
                }
                Err(e) => warn!(error = %e, "portfolio fetch task aborted"),
            }
        }

        if portfolios.is_empty() && !statuses.is_empty() {
            return Err(GatewayError::AllBrokersFailed);
        }

        Ok(FetchOutcome {
            portfolios,
            statuses,
        })
    }
}

async fn fetch_one(
    manager: Arc<ConnectionManager>,
    adapters: Arc<AdapterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    conn: Connection,
    deadline: Instant,
) -> (FetchStatus, Option<BrokerPortfolio>) {
    let status = |outcome, detail| FetchStatus {
        connection_id: conn.id,
        broker: conn.broker,
        outcome,
        detail,
    };

    let Some(adapter) = adapters.for_kind(conn.broker) else {
        return (
            status(
                FetchOutcomeKind::Error,
                Some(format!("no adapter registered for {}", conn.broker)),
            ),
            None,
        );
    };

    let (token, conn) = match manager.access_token(&conn).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(connection_id = %conn.id, broker = %conn.broker, error = %e, "token unavailable");
            return (status(FetchOutcomeKind::Error, Some(e.to_string())), None);
        }
    };

    let started = Instant::now();
    let mut result = attempt_fetch(&breakers, adapter.as_ref(), &conn, &token, deadline).await;
    drop(token);

    // An auth rejection on a connection that holds a refresh token gets
    // one silent refresh-and-retry before it counts as a failure.
    if result.as_ref().err().is_some_and(BrokerApiError::is_auth) && conn.encrypted_refresh.is_some()
    {
        match manager.refresh_after_rejection(&conn).await {
            Ok(refreshed) => match manager.access_token(&refreshed).await {
                Ok((token, refreshed)) => {
                    result =
                        attempt_fetch(&breakers, adapter.as_ref(), &refreshed, &token, deadline)
                            .await;
                }
                Err(e) => {
                    warn!(connection_id = %conn.id, error = %e, "refreshed token unavailable")
                }
            },
            Err(e) => {
                warn!(connection_id = %conn.id, broker = %conn.broker, error = %e, "refresh after auth rejection failed")
            }
        }
    }
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(portfolio) => {
            manager.record_outcome(conn.id, true, latency_ms).await;
            (status(FetchOutcomeKind::Ok, None), Some(portfolio))
        }
        Err(BrokerApiError::CircuitOpen { broker, class }) => {
            // Graceful degradation: the breaker short-circuit is reported
            // as unavailability, never surfaced as an error result.
            (
                status(
                    FetchOutcomeKind::ServiceUnavailable,
                    Some(format!("circuit open for {}/{}", broker, class)),
                ),
                None,
            )
        }
        Err(e) => {
            warn!(connection_id = %conn.id, broker = %conn.broker, error = %e, "portfolio fetch failed");
            manager.record_outcome(conn.id, false, latency_ms).await;
            (status(FetchOutcomeKind::Error, Some(e.to_string())), None)
        }
    }
}

async fn attempt_fetch(
    breakers: &CircuitBreakerRegistry,
    adapter: &dyn BrokerAdapter,
    conn: &Connection,
    token: &Plaintext,
    deadline: Instant,
) -> Result<BrokerPortfolio, BrokerApiError> {
    breakers
        .call(conn.broker, OpClass::Read, async {
            match tokio::time::timeout_at(
                deadline,
                adapter.fetch_portfolio(conn, token.expose(), deadline),
            )
            .await
            {
                Ok(inner) => inner,
                Err(_) => Err(BrokerApiError::DeadlineExceeded { broker: conn.broker }),
            }
        })
        .await
}
