//! Durable transaction log
//!
//! The log is the coordinator's only source of truth across restarts:
//! - Every state transition and vote is written before it is acted upon
//! - Writes are guarded by an optimistic version check
//! - Recovery scans it for transactions left in a transient state

mod memory;
mod postgres;

pub use memory::MemoryTransactionLog;
pub use postgres::PgTransactionLog;

use crate::coordination::{TransactionId, TransactionRecord, TransactionState};
use crate::error::CoordinatorResult;

use async_trait::async_trait;
use std::collections::BTreeMap;

/// Storage for transaction records
#[async_trait]
pub trait TransactionLog: Send + Sync {
    /// Insert a record whose version is 0, or replace the stored record if
    /// its version still equals `record.version`. Returns the record as
    /// stored, with its new version. Fails with `Conflict` on a mismatch.
    async fn put(&self, record: TransactionRecord) -> CoordinatorResult<TransactionRecord>;

    /// Fetch a record by id
    async fn get(&self, id: &TransactionId) -> CoordinatorResult<Option<TransactionRecord>>;

    /// All records currently in one of `states`, oldest first
    async fn scan(&self, states: &[TransactionState]) -> CoordinatorResult<Vec<TransactionRecord>>;

    /// Check the backing store is reachable
    async fn health_check(&self) -> CoordinatorResult<()>;

    /// Number of records per state
    async fn stats(&self) -> CoordinatorResult<BTreeMap<TransactionState, u64>> {
        let mut stats: BTreeMap<TransactionState, u64> =
            TransactionState::ALL.iter().map(|s| (*s, 0)).collect();

        for record in self.scan(&TransactionState::ALL).await? {
            *stats.entry(record.state).or_insert(0) += 1;
        }

        Ok(stats)
    }
}
