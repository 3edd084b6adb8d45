//! In-process transaction log

use super::TransactionLog;
use crate::coordination::{TransactionId, TransactionRecord, TransactionState};
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// Transaction log kept in memory.
///
/// Survives coordinator restarts only as long as the value itself is kept
/// alive, which is enough for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryTransactionLog {
    records: DashMap<TransactionId, TransactionRecord>,
}

impl MemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl TransactionLog for MemoryTransactionLog {
    async fn put(&self, mut record: TransactionRecord) -> CoordinatorResult<TransactionRecord> {
        let now = Utc::now();

        if record.version == 0 {
            return match self.records.entry(record.id) {
                Entry::Occupied(_) => Err(CoordinatorError::Conflict {
                    tx_id: record.id.to_string(),
                    expected: 0,
                }),
                Entry::Vacant(slot) => {
                    record.version = 1;
                    record.updated_at = now;
                    slot.insert(record.clone());
                    debug!("Created transaction {} ({})", record.id, record.label);
                    Ok(record)
                }
            };
        }

        // The shard lock is held from the version check to the write
        let mut stored = self
            .records
            .get_mut(&record.id)
            .ok_or_else(|| CoordinatorError::NotFound {
                tx_id: record.id.to_string(),
            })?;

        if stored.version != record.version {
            return Err(CoordinatorError::Conflict {
                tx_id: record.id.to_string(),
                expected: record.version,
            });
        }

        if stored.state != record.state && !stored.state.can_transition_to(record.state) {
            return Err(CoordinatorError::InvalidStateTransition {
                from: stored.state.to_string(),
                to: record.state.to_string(),
            });
        }

        record.version += 1;
        record.updated_at = now;
        *stored = record.clone();

        Ok(record)
    }

    async fn get(&self, id: &TransactionId) -> CoordinatorResult<Option<TransactionRecord>> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    async fn scan(&self, states: &[TransactionState]) -> CoordinatorResult<Vec<TransactionRecord>> {
        let mut records: Vec<TransactionRecord> = self
            .records
            .iter()
            .filter(|entry| states.contains(&entry.value().state))
            .map(|entry| entry.value().clone())
            .collect();

        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn health_check(&self) -> CoordinatorResult<()> {
        Ok(())
    }
}
