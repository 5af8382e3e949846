//! Custodian of `Connection` records: connect/disconnect, token custody
//! with single-flight refresh, adapter call metrics, health grading and
//! the scheduled probe loop.
//!
//! Writes are serialized per connection id through a striped lock; the
//! store is the single source of truth and every mutation goes through
//! here.

use crate::config::Config;
use crate::domain::broker::BrokerKind;
use crate::domain::connection::{
    Connection, ConnectionStatus, HealthSummary, OverallHealth, TokenSet,
};
use crate::domain::errors::{AuthError, GatewayError, OpClass};
use crate::domain::ports::{AuthProvider, ConnectionStore};
use crate::infrastructure::adapters::AdapterRegistry;
use crate::infrastructure::core::circuit_breaker::CircuitBreakerRegistry;
use crate::infrastructure::vault::{CredentialVault, Plaintext};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

const WRITE_STRIPES: usize = 32;
/// A connection whose last sync is older than this is graded Degraded.
const SYNC_STALENESS_MINUTES: i64 = 10;
/// Consecutive adapter failures before a connection is downgraded.
const FAILURE_DOWNGRADE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub refresh_threshold: Duration,
    pub probe_interval: std::time::Duration,
    pub probe_concurrency: usize,
    pub call_deadline: std::time::Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            refresh_threshold: Duration::minutes(config.token_refresh_threshold_minutes),
            probe_interval: std::time::Duration::from_secs(config.probe_interval_secs),
            probe_concurrency: config.probe_concurrency,
            call_deadline: std::time::Duration::from_millis(config.order_deadline_ms),
        }
    }
}

pub struct ConnectionManager {
    store: Arc<dyn ConnectionStore>,
    vault: Arc<CredentialVault>,
    auth: Arc<dyn AuthProvider>,
    adapters: Arc<AdapterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    settings: ManagerSettings,
    write_stripes: Vec<Mutex<()>>,
    refresh_flights: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ConnectionManager {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        vault: Arc<CredentialVault>,
        auth: Arc<dyn AuthProvider>,
        adapters: Arc<AdapterRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            store,
            vault,
            auth,
            adapters,
            breakers,
            settings,
            write_stripes: (0..WRITE_STRIPES).map(|_| Mutex::new(())).collect(),
            refresh_flights: Mutex::new(HashMap::new()),
        }
    }

    fn stripe(&self, id: Uuid) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.write_stripes[(hasher.finish() as usize) % WRITE_STRIPES]
    }

    /// Create a connection from an already-exchanged token set. Atomic:
    /// the record is only persisted after the token probed valid and the
    /// broker confirmed the account identity.
    pub async fn connect_with_tokens(
        &self,
        user_id: &str,
        kind: BrokerKind,
        tokens: TokenSet,
    ) -> Result<Connection, GatewayError> {
        if tokens.access_token.is_empty() {
            return Err(GatewayError::validation("access token is empty"));
        }
        if tokens.is_expired(Utc::now()) {
            return Err(GatewayError::Auth(AuthError::Rejected {
                broker: kind,
                reason: "token already expired".into(),
            }));
        }

        if !self.auth.probe(kind, &tokens.access_token).await? {
            return Err(GatewayError::Auth(AuthError::Rejected {
                broker: kind,
                reason: "validity probe failed".into(),
            }));
        }

        let adapter = self
            .adapters
            .for_kind(kind)
            .ok_or_else(|| GatewayError::validation(format!("no adapter for {}", kind)))?;

        let mut conn = Connection::new(user_id, kind, "");
        let deadline = tokio::time::Instant::now() + self.settings.call_deadline;
        let account = self
            .breakers
            .call(kind, OpClass::Read, async {
                adapter.get_profile(&conn, &tokens.access_token, deadline).await
            })
            .await?;
        conn.account_id = account.account_id;
        conn.display_name = format!(
            "{} ({})",
            kind.profile().display_name,
            account.name.as_deref().unwrap_or(&conn.account_id)
        );

        // One live connection per (user, broker, account).
        let siblings = self
            .store
            .find_by_user_and_broker(user_id, kind)
            .await
            .map_err(GatewayError::from)?;
        if siblings.iter().any(|c| {
            c.status != ConnectionStatus::Disconnected && c.account_id == conn.account_id
        }) {
            return Err(GatewayError::validation(format!(
                "account {} is already connected via {}",
                conn.account_id, kind
            )));
        }

        conn.encrypted_access = Some(self.vault.encrypt(&tokens.access_token)?);
        conn.encrypted_refresh = match &tokens.refresh_token {
            Some(refresh) => Some(self.vault.encrypt(refresh)?),
            None => None,
        };
        conn.token_expires_at = Some(tokens.expires_at());
        conn.status = ConnectionStatus::Connected;
        conn.healthy = true;
        conn.connected_at = Some(Utc::now());

        self.store.insert(&conn).await.map_err(GatewayError::from)?;
        info!(user_id, broker = %kind, connection_id = %conn.id, "broker connected");
        Ok(conn)
    }

    /// Idempotent disconnect. Secrets are zeroed before the row is
    /// persisted.
    pub async fn disconnect(&self, user_id: &str, connection_id: Uuid) -> Result<(), GatewayError> {
        let _guard = self.stripe(connection_id).lock().await;

        let mut conn = self
            .store
            .find_by_id(connection_id)
            .await
            .map_err(GatewayError::from)?
            .ok_or(GatewayError::NotFound)?;

        if conn.user_id != user_id {
            return Err(GatewayError::Unauthorized);
        }
        if conn.status == ConnectionStatus::Disconnected {
            return Ok(());
        }

        conn.clear_secrets();
        conn.status = ConnectionStatus::Disconnected;
        conn.healthy = false;
        self.store.update(&conn).await.map_err(GatewayError::from)?;
        info!(user_id, connection_id = %connection_id, "broker disconnected");
        Ok(())
    }

    pub async fn list_connections(&self, user_id: &str) -> Result<Vec<Connection>, GatewayError> {
        self.store.find_by_user(user_id).await.map_err(GatewayError::from)
    }

    /// Connections eligible for order routing: Connected and healthy.
    pub async fn active_connections(&self, user_id: &str) -> Result<Vec<Connection>, GatewayError> {
        Ok(self
            .list_connections(user_id)
            .await?
            .into_iter()
            .filter(Connection::is_active)
            .collect())
    }

    /// Connections eligible for portfolio reads. Degraded-but-healthy
    /// connections stay readable so a stale sync can recover through the
    /// next successful fetch.
    pub async fn readable_connections(&self, user_id: &str) -> Result<Vec<Connection>, GatewayError> {
        Ok(self
            .list_connections(user_id)
            .await?
            .into_iter()
            .filter(|c| {
                c.healthy
                    && matches!(
                        c.status,
                        ConnectionStatus::Connected | ConnectionStatus::Degraded
                    )
            })
            .collect())
    }

    /// Decrypted access token for an adapter call, refreshing first when
    /// the token is within the near-expiry threshold. Returns the
    /// possibly-refreshed connection row alongside the plaintext.
    pub async fn access_token(&self, conn: &Connection) -> Result<(Plaintext, Connection), GatewayError> {
        if conn.token_near_expiry(Utc::now(), self.settings.refresh_threshold) {
            let refreshed = self.refresh_connection(conn.id).await?;
            let blob = refreshed
                .encrypted_access
                .as_ref()
                .ok_or_else(|| GatewayError::Invariant {
                    context: format!("connection {} refreshed without access secret", conn.id),
                })?;
            let plaintext = self.vault.decrypt(blob)?;
            return Ok((plaintext, refreshed));
        }

        let blob = conn
            .encrypted_access
            .as_ref()
            .ok_or_else(|| GatewayError::validation("connection holds no access token"))?;
        let plaintext = self.vault.decrypt(blob)?;
        Ok((plaintext, conn.clone()))
    }

    /// Refresh with single-flight per connection: concurrent callers
    /// collapse onto one token exchange and all observe its result.
    pub async fn refresh_connection(&self, connection_id: Uuid) -> Result<Connection, GatewayError> {
        let flight = self.flight(connection_id).await;
        let _in_flight = flight.lock().await;

        let conn = self.load(connection_id).await?;

        // A winner ahead of us may already have refreshed.
        if !conn.token_near_expiry(Utc::now(), self.settings.refresh_threshold) {
            return Ok(conn);
        }

        self.exchange_refresh(conn).await
    }

    /// Refresh after a broker rejected the access token outright, however
    /// far from expiry it claims to be. `stale` is the row the caller
    /// observed failing; when the stored secret is already newer than the
    /// one that was rejected, the refresh it lost to is returned instead
    /// of issuing another exchange.
    pub async fn refresh_after_rejection(&self, stale: &Connection) -> Result<Connection, GatewayError> {
        let flight = self.flight(stale.id).await;
        let _in_flight = flight.lock().await;

        let conn = self.load(stale.id).await?;
        let observed = stale.encrypted_access.as_ref().map(|b| b.created_at);
        let current = conn.encrypted_access.as_ref().map(|b| b.created_at);
        if current > observed {
            return Ok(conn);
        }

        self.exchange_refresh(conn).await
    }

    async fn flight(&self, connection_id: Uuid) -> Arc<Mutex<()>> {
        let mut flights = self.refresh_flights.lock().await;
        flights
            .entry(connection_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(&self, connection_id: Uuid) -> Result<Connection, GatewayError> {
        self.store
            .find_by_id(connection_id)
            .await
            .map_err(GatewayError::from)?
            .ok_or(GatewayError::NotFound)
    }

    async fn exchange_refresh(&self, conn: Connection) -> Result<Connection, GatewayError> {
        if !conn.capabilities.supports_refresh {
            return Err(GatewayError::Auth(AuthError::NotRefreshable { broker: conn.broker }));
        }
        let refresh_blob = conn
            .encrypted_refresh
            .as_ref()
            .ok_or(GatewayError::Auth(AuthError::NotRefreshable { broker: conn.broker }))?;

        let refresh_plain = self.vault.decrypt(refresh_blob)?;
        let tokens = self.auth.refresh(conn.broker, refresh_plain.expose()).await?;
        drop(refresh_plain);

        let _guard = self.stripe(conn.id).lock().await;
        let mut updated = self.load(conn.id).await?;
        updated.encrypted_access = Some(self.vault.encrypt(&tokens.access_token)?);
        if let Some(refresh) = &tokens.refresh_token {
            updated.encrypted_refresh = Some(self.vault.encrypt(refresh)?);
        }
        updated.token_expires_at = Some(tokens.expires_at());
        self.store.update(&updated).await.map_err(GatewayError::from)?;
        info!(connection_id = %updated.id, broker = %updated.broker, "token refreshed");
        Ok(updated)
    }

    /// Fold an adapter call outcome into the connection's metrics.
    pub async fn record_outcome(&self, connection_id: Uuid, success: bool, latency_ms: u64) {
        let _guard = self.stripe(connection_id).lock().await;
        let Ok(Some(mut conn)) = self.store.find_by_id(connection_id).await else {
            return;
        };
        if success {
            conn.record_success(latency_ms);
            if conn.status == ConnectionStatus::Degraded {
                conn.status = ConnectionStatus::Connected;
            }
        } else {
            conn.record_failure();
            if conn.consecutive_failures >= FAILURE_DOWNGRADE_THRESHOLD {
                warn!(
                    connection_id = %connection_id,
                    failures = conn.consecutive_failures,
                    "downgrading connection after repeated failures"
                );
                conn.status = ConnectionStatus::Degraded;
                conn.healthy = false;
            }
        }
        if let Err(e) = self.store.update(&conn).await {
            error!(connection_id = %connection_id, error = %e, "failed to persist call outcome");
        }
    }

    pub async fn health_summary(&self, user_id: &str) -> Result<HealthSummary, GatewayError> {
        let rows: Vec<Connection> = self
            .list_connections(user_id)
            .await?
            .into_iter()
            .filter(|c| c.status != ConnectionStatus::Disconnected)
            .collect();

        let now = Utc::now();
        let total = rows.len();
        let healthy = rows.iter().filter(|c| c.healthy).count();
        let degraded = rows
            .iter()
            .filter(|c| c.status == ConnectionStatus::Degraded)
            .count();
        let errored = rows
            .iter()
            .filter(|c| c.status == ConnectionStatus::Error)
            .count();

        let success_rate = if total == 0 {
            1.0
        } else {
            rows.iter().map(Connection::success_rate).sum::<f64>() / total as f64
        };
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            rows.iter().map(|c| c.avg_latency_ms).sum::<f64>() / total as f64
        };
        let uptime_seconds = rows.iter().map(|c| c.uptime_seconds(now)).max().unwrap_or(0);

        let ratio = if total == 0 { 1.0 } else { healthy as f64 / total as f64 };
        let overall = if ratio >= 0.9 {
            OverallHealth::Healthy
        } else if ratio >= 0.7 {
            OverallHealth::Degraded
        } else {
            OverallHealth::Critical
        };

        Ok(HealthSummary {
            user_id: user_id.to_string(),
            total,
            healthy,
            degraded,
            errored,
            success_rate,
            avg_latency_ms,
            uptime_seconds,
            overall,
        })
    }

    /// Background probe loop; one probe sweep every `probe_interval`.
    pub fn spawn_probe_scheduler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.settings.probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup is quiet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.probe_all().await;
            }
        })
    }

    /// Probe every non-disconnected connection in parallel with bounded
    /// concurrency.
    pub async fn probe_all(&self) {
        let mut targets = Vec::new();
        for status in [
            ConnectionStatus::Pending,
            ConnectionStatus::Connected,
            ConnectionStatus::Degraded,
            ConnectionStatus::Error,
        ] {
            match self.store.find_by_status(status).await {
                Ok(mut rows) => targets.append(&mut rows),
                Err(e) => error!(error = %e, "probe sweep could not load connections"),
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.probe_concurrency.max(1)));
        let mut joins = Vec::with_capacity(targets.len());
        for conn in targets {
            let semaphore = semaphore.clone();
            joins.push(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                self.probe_connection(conn).await;
            });
        }
        futures::future::join_all(joins).await;
    }

    /// One health probe: data integrity, token validity, staleness.
    pub async fn probe_connection(&self, conn: Connection) {
        let now = Utc::now();
        let connection_id = conn.id;

        let status: ConnectionStatus;
        let healthy: bool;
        let mut failed = false;

        // (a) Data integrity: a live connection must hold its secrets.
        let integrity_ok = conn.encrypted_access.is_some()
            && !conn.account_id.is_empty()
            && conn.token_expires_at.is_some();

        if !integrity_ok {
            warn!(connection_id = %connection_id, "probe found incomplete connection record");
            status = ConnectionStatus::Error;
            healthy = false;
            failed = true;
        } else {
            // (b) Token validity via a cheap whoami call.
            let token_valid = match self.access_token(&conn).await {
                Ok((plaintext, _)) => {
                    match self.auth.probe(conn.broker, plaintext.expose()).await {
                        Ok(valid) => valid,
                        Err(e) => {
                            warn!(connection_id = %connection_id, error = %e, "probe call errored");
                            false
                        }
                    }
                }
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "token unavailable for probe");
                    false
                }
            };

            if !token_valid {
                status = ConnectionStatus::Error;
                healthy = false;
                failed = true;
            } else {
                // (c) Staleness of the last successful sync.
                let fresh = conn
                    .last_synced_at
                    .map(|at| now - at <= Duration::minutes(SYNC_STALENESS_MINUTES))
                    .unwrap_or(false);
                if fresh {
                    status = ConnectionStatus::Connected;
                } else {
                    status = ConnectionStatus::Degraded;
                }
                healthy = true;
            }
        }

        let _guard = self.stripe(connection_id).lock().await;
        let Ok(Some(mut row)) = self.store.find_by_id(connection_id).await else {
            return;
        };
        row.status = status;
        row.healthy = healthy;
        row.last_health_check_at = Some(now);
        if failed {
            row.record_failure();
        } else {
            row.consecutive_failures = 0;
        }
        if let Err(e) = self.store.update(&row).await {
            error!(connection_id = %connection_id, error = %e, "failed to persist probe outcome");
        }
    }
}
