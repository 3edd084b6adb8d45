//! Participant clients
//!
//! A participant is an independently-owned data store that exposes three
//! idempotent operations:
//! - `prepare`: durably stage the write and vote Yes, or vote No
//! - `commit`: make a staged write visible
//! - `abort`: release a staged write
//!
//! Repeating any operation for the same transaction id must have the same
//! effect as issuing it once, because the coordinator retries after timeouts
//! without knowing whether an earlier attempt was delivered.

mod local;
mod postgres;
mod retry;

#[cfg(test)]
pub(crate) mod scripted;

pub use local::LocalParticipant;
pub use postgres::PostgresParticipant;
pub use retry::RetryPolicy;

use crate::config::{ParticipantConfig, ParticipantKind};
use crate::coordination::{ParticipantId, TransactionId, Vote};
use crate::error::CoordinatorResult;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

#[cfg(test)]
use mockall::automock;

/// Capability interface every participant kind implements
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    /// Stage `payload` under `tx_id` and vote
    async fn prepare(&self, tx_id: TransactionId, payload: &Value) -> CoordinatorResult<Vote>;

    /// Make the staged write for `tx_id` durable
    async fn commit(&self, tx_id: TransactionId) -> CoordinatorResult<()>;

    /// Release the staged write for `tx_id`, if any
    async fn abort(&self, tx_id: TransactionId) -> CoordinatorResult<()>;

    /// Check the participant is reachable
    async fn health_check(&self) -> bool;
}

/// Participant clients indexed by participant id
#[derive(Default)]
pub struct ParticipantRegistry {
    clients: DashMap<ParticipantId, Arc<dyn ParticipantClient>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build clients for every enabled participant in the configuration
    pub async fn from_config<'a, I>(participants: I) -> CoordinatorResult<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a ParticipantConfig)>,
    {
        let registry = Self::new();

        for (name, config) in participants {
            let client: Arc<dyn ParticipantClient> = match config.kind {
                ParticipantKind::Postgres => Arc::new(PostgresParticipant::connect(name, config).await?),
                ParticipantKind::Local => Arc::new(LocalParticipant::new(name)),
            };

            info!("Registered participant {} ({:?})", name, config.kind);
            registry.register(ParticipantId::new(name.as_str()), client);
        }

        Ok(registry)
    }

    /// Add or replace a participant client
    pub fn register(&self, id: ParticipantId, client: Arc<dyn ParticipantClient>) {
        self.clients.insert(id, client);
    }

    pub fn get(&self, id: &ParticipantId) -> Option<Arc<dyn ParticipantClient>> {
        self.clients.get(id).map(|c| c.clone())
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.clients.contains_key(id)
    }

    /// Registered participant ids, sorted
    pub fn ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.clients.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Health check for all participants
    pub async fn health_check(&self) -> Vec<(ParticipantId, bool)> {
        let clients: Vec<_> = self
            .clients
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut results = Vec::with_capacity(clients.len());
        for (id, client) in clients {
            let healthy = client.health_check().await;
            crate::metrics::record_participant_health(&id, healthy);
            results.push((id, healthy));
        }

        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}
