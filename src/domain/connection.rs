//! Persisted connection model: one authenticated binding between a user
//! and a broker account, plus its encrypted secrets and health state.

use crate::domain::broker::{BrokerCapabilities, BrokerKind};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Pending,
    Connected,
    Degraded,
    Disconnected,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// AEAD ciphertext at rest. `ciphertext` and `iv` are base64; the
/// ciphertext carries the 16-byte authentication tag, the IV is always
/// 12 bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub ciphertext: String,
    pub iv: String,
    pub algorithm: String,
    pub key_size: u16,
    pub created_at: DateTime<Utc>,
}

/// Token material as returned by a broker's token endpoint.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: i64,
    pub scope: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl TokenSet {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + Duration::seconds(self.expires_in)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn near_expiry(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now >= self.expires_at() - threshold
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub user_id: String,
    pub broker: BrokerKind,
    pub account_id: String,
    pub display_name: String,

    pub encrypted_access: Option<EncryptedBlob>,
    pub encrypted_refresh: Option<EncryptedBlob>,
    pub token_expires_at: Option<DateTime<Utc>>,

    pub status: ConnectionStatus,
    pub healthy: bool,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_successful_call_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,

    pub sync_count: u64,
    pub error_count: u64,
    pub consecutive_failures: u32,
    /// EWMA of adapter call latency, fed into order-routing tie-breaks.
    pub avg_latency_ms: f64,

    pub capabilities: BrokerCapabilities,
}

impl Connection {
    pub fn new(user_id: impl Into<String>, broker: BrokerKind, account_id: impl Into<String>) -> Self {
        let account_id = account_id.into();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            broker,
            display_name: format!("{} ({})", broker.profile().display_name, account_id),
            account_id,
            encrypted_access: None,
            encrypted_refresh: None,
            token_expires_at: None,
            status: ConnectionStatus::Pending,
            healthy: false,
            created_at: Utc::now(),
            connected_at: None,
            last_synced_at: None,
            last_successful_call_at: None,
            last_health_check_at: None,
            sync_count: 0,
            error_count: 0,
            consecutive_failures: 0,
            avg_latency_ms: 0.0,
            capabilities: BrokerCapabilities::from(broker.profile()),
        }
    }

    /// Eligible for reads and order routing.
    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Connected && self.healthy
    }

    pub fn token_expired(&self, now: DateTime<Utc>) -> bool {
        match self.token_expires_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    pub fn token_near_expiry(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match self.token_expires_at {
            Some(at) => now >= at - threshold,
            None => true,
        }
    }

    pub fn record_success(&mut self, latency_ms: u64) {
        let now = Utc::now();
        self.sync_count += 1;
        self.consecutive_failures = 0;
        self.last_successful_call_at = Some(now);
        self.last_synced_at = Some(now);
        // EWMA with alpha 0.2; first observation seeds the average.
        if self.avg_latency_ms == 0.0 {
            self.avg_latency_ms = latency_ms as f64;
        } else {
            self.avg_latency_ms = 0.8 * self.avg_latency_ms + 0.2 * latency_ms as f64;
        }
    }

    pub fn record_failure(&mut self) {
        self.error_count += 1;
        self.consecutive_failures += 1;
    }

    /// Secrets are zeroed before a disconnected row is persisted.
    pub fn clear_secrets(&mut self) {
        self.encrypted_access = None;
        self.encrypted_refresh = None;
        self.token_expires_at = None;
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.sync_count + self.error_count;
        if total == 0 {
            return 1.0;
        }
        self.sync_count as f64 / total as f64
    }

    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> i64 {
        match self.connected_at {
            Some(at) if self.status == ConnectionStatus::Connected => (now - at).num_seconds().max(0),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub user_id: String,
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub errored: usize,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub uptime_seconds: i64,
    pub overall: OverallHealth,
}
