//! Order routing: pre-trade validation, capability- and health-aware
//! broker selection, and the order-type execution state machine.
//!
//! A write either succeeds on exactly one broker or fails cleanly; there
//! is no partial success.

use crate::application::connections::ConnectionManager;
use crate::domain::connection::Connection;
use crate::domain::errors::{BrokerApiError, GatewayError, OpClass};
use crate::domain::orders::{
    BracketLegs, BrokerOrder, BrokerOrderAck, OrderOutcome, OrderRequest, OrderResult, OrderSide,
    OrderType,
};
use crate::domain::portfolio::scale4;
use crate::domain::ports::{BrokerAdapter, MarketPrice, MarketStatus, PriceOracle};
use crate::infrastructure::adapters::AdapterRegistry;
use crate::infrastructure::core::circuit_breaker::CircuitBreakerRegistry;
use crate::infrastructure::vault::Plaintext;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

pub struct OrderRouter {
    manager: Arc<ConnectionManager>,
    adapters: Arc<AdapterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    price_oracle: Arc<dyn PriceOracle>,
    order_deadline: std::time::Duration,
}

impl OrderRouter {
    pub fn new(
        manager: Arc<ConnectionManager>,
        adapters: Arc<AdapterRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        price_oracle: Arc<dyn PriceOracle>,
        order_deadline: std::time::Duration,
    ) -> Self {
        Self {
            manager,
            adapters,
            breakers,
            price_oracle,
            order_deadline,
        }
    }

    pub async fn route(
        &self,
        user_id: &str,
        request: OrderRequest,
    ) -> Result<OrderResult, GatewayError> {
        validate_shape(&request)?;

        let symbol = request.symbol.trim().to_uppercase();
        let exchange = request
            .exchange
            .as_deref()
            .map(str::to_uppercase)
            .unwrap_or_else(|| "NSE".to_string());

        let market = self
            .price_oracle
            .market_price(&symbol)
            .await
            .ok_or_else(|| GatewayError::validation(format!("no market data for {}", symbol)))?;
        validate_market(&symbol, &market)?;
        let current_price = market.price;

        if request.order_type == OrderType::Bracket {
            validate_bracket_legs(&request, current_price)?;
        }

        let candidates = self.candidates(user_id, &request, &exchange).await?;
        let connection = pick_best(candidates).ok_or(GatewayError::NoEligibleBroker)?;

        let decision = decide(&request, current_price);
        let broker_order = BrokerOrder {
            symbol: symbol.clone(),
            exchange,
            side: request.side,
            order_type: decision.placed_as,
            quantity: request.quantity,
            price: request.price,
            trigger_price: request.stop_price,
        };

        let ack = match self.place(&connection, &broker_order).await {
            Ok(ack) => ack,
            Err(BrokerApiError::CircuitOpen { broker, class }) => {
                return Err(GatewayError::ServiceUnavailable {
                    reason: format!("circuit open for {}/{}", broker, class),
                });
            }
            Err(e) => {
                warn!(user_id, broker = %connection.broker, error = %e, "order placement failed");
                let mut failed = OrderResult::failed(request.quantity, e.to_string());
                failed.broker = Some(connection.broker);
                failed.connection_id = Some(connection.id);
                return Ok(failed);
            }
        };

        let executed_price = decision.executed_price;
        let bracket_legs = match request.order_type {
            OrderType::Bracket => Some(BracketLegs {
                // Leg prices are validated above.
                target_price: request.target_price.unwrap_or_default(),
                stop_price: request.stop_price.unwrap_or_default(),
            }),
            _ => None,
        };

        let result = OrderResult {
            order_id: Uuid::new_v4(),
            broker: Some(connection.broker),
            connection_id: Some(connection.id),
            broker_order_id: Some(ack.broker_order_id),
            status: decision.outcome,
            executed_price,
            quantity: request.quantity,
            executed_value: executed_price
                .map(|p| scale4(p * Decimal::from(request.quantity))),
            bracket_legs,
            reason: None,
            placed_at: Utc::now(),
        };

        info!(
            user_id,
            order_id = %result.order_id,
            broker = %connection.broker,
            status = %result.status,
            symbol = %symbol,
            "order routed"
        );
        Ok(result)
    }

    /// Active, healthy connections whose capability snapshot covers the
    /// order type and target exchange.
    async fn candidates(
        &self,
        user_id: &str,
        request: &OrderRequest,
        exchange: &str,
    ) -> Result<Vec<Connection>, GatewayError> {
        Ok(self
            .manager
            .active_connections(user_id)
            .await?
            .into_iter()
            .filter(|c| {
                c.capabilities.order_types.contains(&request.order_type)
                    && c.capabilities
                        .exchanges
                        .iter()
                        .any(|e| e.eq_ignore_ascii_case(exchange))
            })
            .collect())
    }

    async fn place(
        &self,
        connection: &Connection,
        order: &BrokerOrder,
    ) -> Result<BrokerOrderAck, BrokerApiError> {
        let adapter = self
            .adapters
            .for_kind(connection.broker)
            .ok_or(BrokerApiError::NotImplementedForBroker {
                broker: connection.broker,
                operation: "place_order",
            })?;

        let (token, connection) =
            self.manager
                .access_token(connection)
                .await
                .map_err(|e| BrokerApiError::Auth {
                    broker: connection.broker,
                    reason: e.to_string(),
                })?;

        let deadline = Instant::now() + self.order_deadline;
        let started = Instant::now();
        let mut result = self
            .place_once(adapter.as_ref(), &connection, &token, order, deadline)
            .await;
        drop(token);

        // A rejected access token on a refresh-capable connection is
        // rotated once and the placement retried before failing the order.
        if result.as_ref().err().is_some_and(BrokerApiError::is_auth)
            && connection.encrypted_refresh.is_some()
        {
            match self.manager.refresh_after_rejection(&connection).await {
                Ok(refreshed) => {
                    if let Ok((token, refreshed)) = self.manager.access_token(&refreshed).await {
                        result = self
                            .place_once(adapter.as_ref(), &refreshed, &token, order, deadline)
                            .await;
                    }
                }
                Err(e) => {
                    warn!(connection_id = %connection.id, broker = %connection.broker, error = %e, "refresh after auth rejection failed")
                }
            }
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => self.manager.record_outcome(connection.id, true, latency_ms).await,
            Err(e) if e.counts_against_breaker() => {
                self.manager.record_outcome(connection.id, false, latency_ms).await
            }
            Err(_) => {}
        }
        result
    }

    async fn place_once(
        &self,
        adapter: &dyn BrokerAdapter,
        connection: &Connection,
        token: &Plaintext,
        order: &BrokerOrder,
        deadline: Instant,
    ) -> Result<BrokerOrderAck, BrokerApiError> {
        self.breakers
            .call(connection.broker, OpClass::Write, async {
                adapter
                    .place_order(connection, token.expose(), order, deadline)
                    .await
            })
            .await
    }
}

fn validate_shape(request: &OrderRequest) -> Result<(), GatewayError> {
    if request.symbol.trim().is_empty() {
        return Err(GatewayError::validation("symbol is required"));
    }
    if request.quantity <= 0 {
        return Err(GatewayError::validation("quantity must be positive"));
    }
    match request.order_type {
        OrderType::Limit => {
            if request.price.unwrap_or(Decimal::ZERO) <= Decimal::ZERO {
                return Err(GatewayError::validation("limit orders require price > 0"));
            }
        }
        OrderType::StopLoss => {
            if request.stop_price.unwrap_or(Decimal::ZERO) <= Decimal::ZERO {
                return Err(GatewayError::validation("stop-loss orders require stop price > 0"));
            }
        }
        OrderType::Bracket => {
            if request.target_price.unwrap_or(Decimal::ZERO) <= Decimal::ZERO
                || request.stop_price.unwrap_or(Decimal::ZERO) <= Decimal::ZERO
            {
                return Err(GatewayError::validation(
                    "bracket orders require target and stop prices > 0",
                ));
            }
        }
        OrderType::Market => {}
    }
    Ok(())
}

fn validate_market(symbol: &str, market: &MarketPrice) -> Result<(), GatewayError> {
    if market.market_status != MarketStatus::Open {
        return Err(GatewayError::validation(format!("market is closed for {}", symbol)));
    }
    if market.circuit_limit_hit {
        return Err(GatewayError::validation(format!(
            "{} is in a circuit-limit halt",
            symbol
        )));
    }
    Ok(())
}

/// Bracket legs must sit on the correct side of the entry price.
fn validate_bracket_legs(request: &OrderRequest, entry: Decimal) -> Result<(), GatewayError> {
    let target = request.target_price.unwrap_or_default();
    let stop = request.stop_price.unwrap_or_default();
    let ok = match request.side {
        OrderSide::Buy => target > entry && stop < entry,
        OrderSide::Sell => target < entry && stop > entry,
    };
    if ok {
        Ok(())
    } else {
        Err(GatewayError::validation(
            "bracket target/stop prices are on the wrong side of entry",
        ))
    }
}

/// Lowest execution cost wins; ties break on average adapter latency,
/// then lexicographic broker kind.
fn pick_best(mut candidates: Vec<Connection>) -> Option<Connection> {
    candidates.sort_by(|a, b| {
        a.capabilities
            .execution_cost_bps
            .cmp(&b.capabilities.execution_cost_bps)
            .then(a.avg_latency_ms.total_cmp(&b.avg_latency_ms))
            .then(a.broker.as_str().cmp(b.broker.as_str()))
    });
    candidates.into_iter().next()
}

struct Decision {
    outcome: OrderOutcome,
    executed_price: Option<Decimal>,
    placed_as: OrderType,
}

/// Execution semantics per order type against the current price.
fn decide(request: &OrderRequest, current_price: Decimal) -> Decision {
    match request.order_type {
        OrderType::Market => Decision {
            outcome: OrderOutcome::Executed,
            executed_price: Some(current_price),
            placed_as: OrderType::Market,
        },
        OrderType::Limit => {
            let limit = request.price.unwrap_or_default();
            let fills = match request.side {
                OrderSide::Buy => current_price <= limit,
                OrderSide::Sell => current_price >= limit,
            };
            if fills {
                Decision {
                    outcome: OrderOutcome::Executed,
                    executed_price: Some(limit),
                    placed_as: OrderType::Limit,
                }
            } else {
                Decision {
                    outcome: OrderOutcome::Pending,
                    executed_price: None,
                    placed_as: OrderType::Limit,
                }
            }
        }
        OrderType::StopLoss => {
            let stop = request.stop_price.unwrap_or_default();
            let triggered = match request.side {
                OrderSide::Buy => current_price >= stop,
                OrderSide::Sell => current_price <= stop,
            };
            if triggered {
                // Trigger converts to a market fill at the current price.
                Decision {
                    outcome: OrderOutcome::Executed,
                    executed_price: Some(current_price),
                    placed_as: OrderType::Market,
                }
            } else {
                Decision {
                    outcome: OrderOutcome::Pending,
                    executed_price: None,
                    placed_as: OrderType::StopLoss,
                }
            }
        }
        // Bracket entries fill immediately at market; the legs ride along
        // as metadata for the caller to emit as child orders.
        OrderType::Bracket => Decision {
            outcome: OrderOutcome::Executed,
            executed_price: Some(current_price),
            placed_as: OrderType::Market,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::broker::BrokerKind;
    use rust_decimal_macros::dec;

    fn request(order_type: OrderType, side: OrderSide) -> OrderRequest {
        OrderRequest {
            symbol: "RELIANCE".into(),
            exchange: None,
            side,
            order_type,
            quantity: 10,
            price: None,
            stop_price: None,
            target_price: None,
        }
    }

    #[test]
    fn shape_validation_catches_missing_prices() {
        let mut r = request(OrderType::Limit, OrderSide::Buy);
        assert!(validate_shape(&r).is_err());
        r.price = Some(dec!(100));
        assert!(validate_shape(&r).is_ok());

        let mut r = request(OrderType::StopLoss, OrderSide::Sell);
        assert!(validate_shape(&r).is_err());
        r.stop_price = Some(dec!(95));
        assert!(validate_shape(&r).is_ok());

        let mut r = request(OrderType::Market, OrderSide::Buy);
        r.quantity = 0;
        assert!(validate_shape(&r).is_err());
    }

    #[test]
    fn limit_semantics_match_price_crossing() {
        let mut buy = request(OrderType::Limit, OrderSide::Buy);
        buy.price = Some(dec!(101));
        let d = decide(&buy, dec!(100));
        assert_eq!(d.outcome, OrderOutcome::Executed);
        assert_eq!(d.executed_price, Some(dec!(101)));

        buy.price = Some(dec!(99));
        let d = decide(&buy, dec!(100));
        assert_eq!(d.outcome, OrderOutcome::Pending);

        let mut sell = request(OrderType::Limit, OrderSide::Sell);
        sell.price = Some(dec!(99));
        let d = decide(&sell, dec!(100));
        assert_eq!(d.outcome, OrderOutcome::Executed);
        assert_eq!(d.executed_price, Some(dec!(99)));

        sell.price = Some(dec!(101));
        assert_eq!(decide(&sell, dec!(100)).outcome, OrderOutcome::Pending);
    }

    #[test]
    fn stop_loss_triggers_convert_to_market() {
        let mut buy = request(OrderType::StopLoss, OrderSide::Buy);
        buy.stop_price = Some(dec!(100));
        let d = decide(&buy, dec!(102));
        assert_eq!(d.outcome, OrderOutcome::Executed);
        assert_eq!(d.executed_price, Some(dec!(102)));
        assert_eq!(d.placed_as, OrderType::Market);

        let d = decide(&buy, dec!(98));
        assert_eq!(d.outcome, OrderOutcome::Pending);
        assert_eq!(d.placed_as, OrderType::StopLoss);
    }

    #[test]
    fn bracket_legs_must_straddle_entry() {
        let mut r = request(OrderType::Bracket, OrderSide::Buy);
        r.target_price = Some(dec!(110));
        r.stop_price = Some(dec!(95));
        assert!(validate_bracket_legs(&r, dec!(100)).is_ok());

        r.target_price = Some(dec!(90));
        assert!(validate_bracket_legs(&r, dec!(100)).is_err());

        let mut r = request(OrderType::Bracket, OrderSide::Sell);
        r.target_price = Some(dec!(90));
        r.stop_price = Some(dec!(110));
        assert!(validate_bracket_legs(&r, dec!(100)).is_ok());
    }

    #[test]
    fn candidate_scoring_prefers_cheapest_then_fastest() {
        let mut zerodha = Connection::new("u", BrokerKind::Zerodha, "Z1");
        let mut upstox = Connection::new("u", BrokerKind::Upstox, "U1");
        let mut fyers = Connection::new("u", BrokerKind::Fyers, "F1");
        zerodha.avg_latency_ms = 10.0;
        upstox.avg_latency_ms = 500.0;
        fyers.avg_latency_ms = 10.0;

        // Upstox carries 2 bps against Zerodha's and Fyers' 3.
        let best = pick_best(vec![zerodha.clone(), upstox.clone(), fyers.clone()]).unwrap();
        assert_eq!(best.broker, BrokerKind::Upstox);

        // Among equal-cost brokers the faster connection wins.
        fyers.avg_latency_ms = 5.0;
        let best = pick_best(vec![zerodha.clone(), fyers.clone()]).unwrap();
        assert_eq!(best.broker, BrokerKind::Fyers);

        // Full tie falls back to lexicographic broker kind.
        zerodha.avg_latency_ms = 5.0;
        let best = pick_best(vec![zerodha, fyers]).unwrap();
        assert_eq!(best.broker, BrokerKind::Fyers);
    }
}
