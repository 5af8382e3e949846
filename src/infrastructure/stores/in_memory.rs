//! In-memory `ConnectionStore`.
//!
//! Thread-safe and async-ready; suitable for tests and single-instance
//! deployments. Data is lost on restart - production deployments supply
//! their own store behind the same trait.

use crate::domain::broker::BrokerKind;
use crate::domain::connection::{Connection, ConnectionStatus};
use crate::domain::errors::StoreError;
use crate::domain::ports::ConnectionStore;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct InMemoryConnectionStore {
    rows: RwLock<HashMap<Uuid, Connection>>,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryConnectionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn insert(&self, conn: &Connection) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&conn.id) {
            return Err(StoreError::new(format!("duplicate connection id {}", conn.id)));
        }
        rows.insert(conn.id, conn.clone());
        Ok(())
    }

    async fn update(&self, conn: &Connection) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&conn.id) {
            Some(row) => {
                *row = conn.clone();
                Ok(())
            }
            None => Err(StoreError::new(format!("no connection with id {}", conn.id))),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Connection>, StoreError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn find_by_user(&self, user_id: &str) -> Result<Vec<Connection>, StoreError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_by_user_and_broker(
        &self,
        user_id: &str,
        broker: BrokerKind,
    ) -> Result<Vec<Connection>, StoreError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|c| c.user_id == user_id && c.broker == broker)
            .cloned()
            .collect())
    }

    async fn find_by_status(&self, status: ConnectionStatus) -> Result<Vec<Connection>, StoreError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect())
    }
}
