//! Shared wiring for integration tests: an in-memory store, the test
//! vault, mock auth, and a connection manager over mock broker adapters.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tradegate::application::connections::{ConnectionManager, ManagerSettings};
use tradegate::domain::broker::BrokerKind;
use tradegate::domain::connection::{Connection, ConnectionStatus};
use tradegate::domain::ports::{AuthProvider, BrokerAdapter, ConnectionStore};
use tradegate::infrastructure::adapters::AdapterRegistry;
use tradegate::infrastructure::core::circuit_breaker::{BreakerConfig, CircuitBreakerRegistry};
use tradegate::infrastructure::stores::in_memory::InMemoryConnectionStore;
use tradegate::infrastructure::vault::CredentialVault;

pub const MASTER_SECRET: &str = "integration-test-master-secret";

pub fn settings() -> ManagerSettings {
    ManagerSettings {
        refresh_threshold: ChronoDuration::minutes(10),
        probe_interval: Duration::from_secs(300),
        probe_concurrency: 4,
        call_deadline: Duration::from_secs(2),
    }
}

pub struct TestRig {
    pub store: Arc<InMemoryConnectionStore>,
    pub vault: Arc<CredentialVault>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub adapters: Arc<AdapterRegistry>,
    pub manager: Arc<ConnectionManager>,
}

pub fn rig(auth: Arc<dyn AuthProvider>, adapters: Vec<Arc<dyn BrokerAdapter>>) -> TestRig {
    rig_with_breakers(auth, adapters, BreakerConfig::default())
}

pub fn rig_with_breakers(
    auth: Arc<dyn AuthProvider>,
    adapters: Vec<Arc<dyn BrokerAdapter>>,
    breaker_cfg: BreakerConfig,
) -> TestRig {
    let store = Arc::new(InMemoryConnectionStore::new());
    let vault = Arc::new(CredentialVault::new(Some(MASTER_SECRET)));
    let breakers = Arc::new(CircuitBreakerRegistry::new(breaker_cfg));
    let adapters = Arc::new(AdapterRegistry::with_adapters(adapters));
    let manager = Arc::new(ConnectionManager::new(
        store.clone(),
        vault.clone(),
        auth,
        adapters.clone(),
        breakers.clone(),
        settings(),
    ));
    TestRig {
        store,
        vault,
        breakers,
        adapters,
        manager,
    }
}

/// Insert a live, healthy connection with encrypted seed tokens.
pub async fn seed_connection(
    rig: &TestRig,
    user_id: &str,
    kind: BrokerKind,
    expires_in_secs: i64,
    with_refresh: bool,
) -> Connection {
    let mut conn = Connection::new(user_id, kind, format!("{}-acct", kind));
    conn.status = ConnectionStatus::Connected;
    conn.healthy = true;
    conn.connected_at = Some(Utc::now());
    conn.last_synced_at = Some(Utc::now());
    conn.encrypted_access = Some(rig.vault.encrypt("seed-access-token").unwrap());
    if with_refresh {
        conn.encrypted_refresh = Some(rig.vault.encrypt("seed-refresh-token").unwrap());
    }
    conn.token_expires_at = Some(Utc::now() + ChronoDuration::seconds(expires_in_secs));
    rig.store.insert(&conn).await.unwrap();
    conn
}
