//! Per-broker adapters translating broker payloads to internal DTOs, and
//! the dispatch registry keyed by `BrokerKind`. Adding a broker means one
//! adapter module plus one registration below.

pub mod angel_one;
pub mod fyers;
pub mod icici;
pub mod iifl;
pub mod upstox;
pub mod zerodha;

use crate::config::BrokerCredentials;
use crate::domain::broker::BrokerKind;
use crate::domain::errors::BrokerApiError;
use crate::domain::ports::BrokerAdapter;
use crate::infrastructure::core::http::HttpClientPool;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

pub struct AdapterRegistry {
    adapters: HashMap<BrokerKind, Arc<dyn BrokerAdapter>>,
}

impl AdapterRegistry {
    /// Wire all six production adapters against the shared pool.
    pub fn new(
        pool: Arc<HttpClientPool>,
        credentials: &HashMap<BrokerKind, BrokerCredentials>,
    ) -> Self {
        let api_key = |kind: BrokerKind| {
            credentials
                .get(&kind)
                .map(|c| c.api_key.clone())
                .unwrap_or_default()
        };

        let list: Vec<Arc<dyn BrokerAdapter>> = vec![
            Arc::new(zerodha::ZerodhaAdapter::new(pool.clone(), api_key(BrokerKind::Zerodha))),
            Arc::new(upstox::UpstoxAdapter::new(pool.clone())),
            Arc::new(angel_one::AngelOneAdapter::new(
                pool.clone(),
                api_key(BrokerKind::AngelOne),
            )),
            Arc::new(icici::IciciDirectAdapter::new(
                pool.clone(),
                api_key(BrokerKind::IciciDirect),
            )),
            Arc::new(fyers::FyersAdapter::new(pool.clone(), api_key(BrokerKind::Fyers))),
            Arc::new(iifl::IiflAdapter::new(pool.clone())),
        ];
        Self::with_adapters(list)
    }

    /// Registry over caller-supplied adapters; tests inject mocks here.
    pub fn with_adapters(list: Vec<Arc<dyn BrokerAdapter>>) -> Self {
        let mut adapters = HashMap::new();
        for adapter in list {
            adapters.insert(adapter.kind(), adapter);
        }
        Self { adapters }
    }

    pub fn for_kind(&self, kind: BrokerKind) -> Option<Arc<dyn BrokerAdapter>> {
        self.adapters.get(&kind).cloned()
    }
}

/// Decode a 2xx response body, mapping JSON mismatches to `Decode`.
pub(crate) async fn decode<T: DeserializeOwned>(
    kind: BrokerKind,
    response: reqwest::Response,
) -> Result<T, BrokerApiError> {
    response.json::<T>().await.map_err(|e| BrokerApiError::Decode {
        broker: kind,
        reason: e.to_string(),
    })
}
