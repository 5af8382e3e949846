use crate::domain::broker::BrokerKind;
use thiserror::Error;

/// Errors from the credential vault.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("master key is not configured")]
    KeyUnavailable,

    #[error("encryption failed: {reason}")]
    CryptoFailure { reason: String },

    #[error("ciphertext failed authentication")]
    Tampered,

    #[error("malformed blob: {reason}")]
    Malformed { reason: String },
}

/// Errors from OAuth flows and token lifecycle.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("oauth state is unknown, expired or already used")]
    InvalidState,

    #[error("{broker} does not support token refresh, re-authentication required")]
    NotRefreshable { broker: BrokerKind },

    #[error("{operation} is not implemented for {broker}")]
    NotImplementedForBroker {
        broker: BrokerKind,
        operation: &'static str,
    },

    #[error("token exchange with {broker} failed: {reason}")]
    Exchange { broker: BrokerKind, reason: String },

    #[error("credentials for {broker} are not configured")]
    MissingCredentials { broker: BrokerKind },

    #[error("token for {broker} was rejected: {reason}")]
    Rejected { broker: BrokerKind, reason: String },

    #[error("validity probe against {broker} failed: {reason}")]
    Probe { broker: BrokerKind, reason: String },
}

/// Operation class a circuit breaker isolates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    Oauth,
    Read,
    Write,
}

impl std::fmt::Display for OpClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpClass::Oauth => write!(f, "oauth"),
            OpClass::Read => write!(f, "read"),
            OpClass::Write => write!(f, "write"),
        }
    }
}

/// Typed failure from a broker API call. Adapters return these; callers
/// record them into the circuit breaker and connection metrics.
#[derive(Debug, Error)]
pub enum BrokerApiError {
    #[error("{broker} transport failure: {reason}")]
    Transport { broker: BrokerKind, reason: String },

    #[error("{broker} rejected credentials: {reason}")]
    Auth { broker: BrokerKind, reason: String },

    #[error("rate limited on {broker}")]
    RateLimited { broker: BrokerKind },

    #[error("circuit open for {broker}/{class}")]
    CircuitOpen { broker: BrokerKind, class: OpClass },

    #[error("{broker} returned an error: {reason}")]
    Broker { broker: BrokerKind, reason: String },

    #[error("could not decode {broker} response: {reason}")]
    Decode { broker: BrokerKind, reason: String },

    #[error("deadline exceeded calling {broker}")]
    DeadlineExceeded { broker: BrokerKind },

    #[error("{operation} is not implemented for {broker}")]
    NotImplementedForBroker {
        broker: BrokerKind,
        operation: &'static str,
    },
}

impl BrokerApiError {
    /// Whether the failure is evidence of broker-side trouble for the
    /// circuit breaker window. Local short-circuits and unimplemented
    /// operations are not.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(
            self,
            BrokerApiError::CircuitOpen { .. } | BrokerApiError::NotImplementedForBroker { .. }
        )
    }

    /// Auth-class failures trigger a refresh attempt when the connection
    /// holds a refresh token.
    pub fn is_auth(&self) -> bool {
        matches!(self, BrokerApiError::Auth { .. })
    }
}

/// Failure from the opaque connection store.
#[derive(Debug, Error)]
#[error("connection store failure: {reason}")]
pub struct StoreError {
    pub reason: String,
}

impl StoreError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Top-level error surfaced across the gateway's public API.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    #[error("connection not found")]
    NotFound,

    #[error("caller does not own this connection")]
    Unauthorized,

    #[error("all brokers failed")]
    AllBrokersFailed,

    #[error("no eligible broker for this order")]
    NoEligibleBroker,

    #[error("service unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Broker(#[from] BrokerApiError),

    #[error("invariant violation: {context}")]
    Invariant { context: String },
}

impl GatewayError {
    pub fn validation(reason: impl Into<String>) -> Self {
        GatewayError::Validation {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_classification() {
        let open = BrokerApiError::CircuitOpen {
            broker: BrokerKind::Zerodha,
            class: OpClass::Read,
        };
        assert!(!open.counts_against_breaker());

        let transport = BrokerApiError::Transport {
            broker: BrokerKind::Upstox,
            reason: "connection reset".into(),
        };
        assert!(transport.counts_against_breaker());
        assert!(!transport.is_auth());
    }

    #[test]
    fn error_messages_name_the_broker() {
        let err = AuthError::NotRefreshable {
            broker: BrokerKind::Zerodha,
        };
        assert!(err.to_string().contains("zerodha"));

        let err = BrokerApiError::NotImplementedForBroker {
            broker: BrokerKind::Iifl,
            operation: "exchange_code",
        };
        assert!(err.to_string().contains("iifl"));
        assert!(err.to_string().contains("exchange_code"));
    }
}
