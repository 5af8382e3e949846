//! Per-broker, per-operation-class circuit breaking.
//!
//! Closed -> Open when the rolling failure rate over the last `window`
//! calls crosses the threshold (with a minimum call count), Open ->
//! HalfOpen after the cooldown, HalfOpen -> Closed after a run of
//! consecutive successes, HalfOpen -> Open on any failure.

use crate::domain::broker::BrokerKind;
use crate::domain::errors::{BrokerApiError, OpClass};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,   // Normal operation - requests pass through
    Open,     // Failure threshold breached - reject all requests
    HalfOpen, // Testing if service recovered - allow limited requests
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Rolling window length in calls.
    pub window: usize,
    /// Minimum observed calls before the failure rate can trip the breaker.
    pub min_calls: usize,
    /// Failure rate in [0, 1] that opens the circuit.
    pub failure_threshold: f64,
    /// Time spent Open before probing again.
    pub cooldown: Duration,
    /// Consecutive HalfOpen successes required to close.
    pub successes_to_close: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 20,
            min_calls: 10,
            failure_threshold: 0.5,
            cooldown: Duration::from_secs(30),
            successes_to_close: 3,
        }
    }
}

struct Inner {
    state: CircuitState,
    outcomes: VecDeque<bool>,
    half_open_successes: usize,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    cfg: BreakerConfig,
    state: RwLock<Inner>,
}

/// Proof that `allow` admitted this call; handed back to `record`.
#[derive(Debug)]
pub struct Permit {
    half_open: bool,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
            state: RwLock::new(Inner {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Admit a call or report the remaining cooldown.
    pub async fn allow(&self) -> Result<Permit, Duration> {
        let mut inner = self.state.write().await;
        match inner.state {
            CircuitState::Closed => Ok(Permit { half_open: false }),
            CircuitState::HalfOpen => Ok(Permit { half_open: true }),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cfg.cooldown {
                    info!(
                        "CircuitBreaker [{}]: Transitioning Open -> HalfOpen (cooldown elapsed)",
                        self.name
                    );
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    Ok(Permit { half_open: true })
                } else {
                    Err(self.cfg.cooldown - elapsed)
                }
            }
        }
    }

    pub async fn record(&self, permit: Permit, success: bool) {
        let mut inner = self.state.write().await;

        if permit.half_open {
            // State may have moved since the permit was issued; a stale
            // permit only counts while we are still probing.
            if inner.state != CircuitState::HalfOpen {
                return;
            }
            if success {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.cfg.successes_to_close {
                    info!(
                        "CircuitBreaker [{}]: Transitioning HalfOpen -> Closed ({} successes)",
                        self.name, inner.half_open_successes
                    );
                    inner.state = CircuitState::Closed;
                    inner.outcomes.clear();
                    inner.half_open_successes = 0;
                    inner.opened_at = None;
                }
            } else {
                warn!(
                    "CircuitBreaker [{}]: Transitioning HalfOpen -> Open (failure during recovery)",
                    self.name
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
            }
            return;
        }

        if inner.state != CircuitState::Closed {
            return;
        }

        inner.outcomes.push_back(success);
        while inner.outcomes.len() > self.cfg.window {
            inner.outcomes.pop_front();
        }

        let observed = inner.outcomes.len();
        if observed < self.cfg.min_calls {
            return;
        }
        let failures = inner.outcomes.iter().filter(|ok| !**ok).count();
        let rate = failures as f64 / observed as f64;
        if rate >= self.cfg.failure_threshold {
            warn!(
                "CircuitBreaker [{}]: Transitioning Closed -> Open ({}/{} failures)",
                self.name, failures, observed
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.outcomes.clear();
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }
}

/// Process-wide breaker table keyed by broker and operation class.
pub struct CircuitBreakerRegistry {
    cfg: BreakerConfig,
    breakers: RwLock<HashMap<(BrokerKind, OpClass), Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn breaker(&self, kind: BrokerKind, class: OpClass) -> Arc<CircuitBreaker> {
        {
            let map = self.breakers.read().await;
            if let Some(b) = map.get(&(kind, class)) {
                return b.clone();
            }
        }
        let mut map = self.breakers.write().await;
        map.entry((kind, class))
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("{}/{}", kind, class),
                    self.cfg.clone(),
                ))
            })
            .clone()
    }

    /// Run `fut` under the breaker for `(kind, class)`: short-circuit with
    /// `CircuitOpen` when tripped, record the outcome otherwise.
    pub async fn call<T, F>(
        &self,
        kind: BrokerKind,
        class: OpClass,
        fut: F,
    ) -> Result<T, BrokerApiError>
    where
        F: std::future::Future<Output = Result<T, BrokerApiError>>,
    {
        let breaker = self.breaker(kind, class).await;
        let permit = breaker
            .allow()
            .await
            .map_err(|_| BrokerApiError::CircuitOpen { broker: kind, class })?;

        match fut.await {
            Ok(v) => {
                breaker.record(permit, true).await;
                Ok(v)
            }
            Err(e) => {
                if e.counts_against_breaker() {
                    breaker.record(permit, false).await;
                }
                Err(e)
            }
        }
    }
}
