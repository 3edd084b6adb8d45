//! In-process participant

use super::ParticipantClient;
use crate::coordination::{TransactionId, Vote};
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tracing::debug;

type Validator = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// Participant whose store lives in the coordinator's process.
///
/// Prepare stages the payload, commit applies it exactly once, abort drops
/// it. An abort that arrives before prepare is remembered so a late prepare
/// votes No instead of holding resources nobody will release.
pub struct LocalParticipant {
    name: String,
    /// Prepared writes holding resources
    staged: DashMap<TransactionId, Value>,
    /// Applied writes
    committed: DashMap<TransactionId, Value>,
    /// Transactions that must never prepare again
    aborted: DashSet<TransactionId>,
    validator: Validator,
}

impl LocalParticipant {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            staged: DashMap::new(),
            committed: DashMap::new(),
            aborted: DashSet::new(),
            validator: Box::new(|_| true),
        }
    }

    /// Vote No for payloads the predicate rejects, like a failing constraint
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validator = Box::new(validator);
        self
    }

    pub fn is_prepared(&self, tx_id: &TransactionId) -> bool {
        self.staged.contains_key(tx_id)
    }

    pub fn committed_value(&self, tx_id: &TransactionId) -> Option<Value> {
        self.committed.get(tx_id).map(|v| v.clone())
    }

    pub fn committed_count(&self) -> usize {
        self.committed.len()
    }

    pub fn is_aborted(&self, tx_id: &TransactionId) -> bool {
        self.aborted.contains(tx_id)
    }
}

#[async_trait]
impl ParticipantClient for LocalParticipant {
    async fn prepare(&self, tx_id: TransactionId, payload: &Value) -> CoordinatorResult<Vote> {
        if self.committed.contains_key(&tx_id) {
            return Ok(Vote::Yes);
        }

        // The entry guard is held until the payload is staged, and abort marks
        // `aborted` before it clears `staged`, so an abort can never slip in
        // between the check and the insert
        match self.staged.entry(tx_id) {
            Entry::Occupied(_) => Ok(Vote::Yes),
            Entry::Vacant(slot) => {
                if self.aborted.contains(&tx_id) {
                    debug!("{}: refusing prepare of aborted transaction {}", self.name, tx_id);
                    return Ok(Vote::No);
                }

                if !(self.validator)(payload) {
                    debug!("{}: payload for {} rejected", self.name, tx_id);
                    return Ok(Vote::No);
                }

                slot.insert(payload.clone());
                debug!("{}: prepared {}", self.name, tx_id);
                Ok(Vote::Yes)
            }
        }
    }

    async fn commit(&self, tx_id: TransactionId) -> CoordinatorResult<()> {
        if self.committed.contains_key(&tx_id) {
            return Ok(());
        }

        match self.staged.remove(&tx_id) {
            Some((_, value)) => {
                self.committed.insert(tx_id, value);
                debug!("{}: committed {}", self.name, tx_id);
                Ok(())
            }
            None if self.committed.contains_key(&tx_id) => Ok(()),
            None => Err(CoordinatorError::ProtocolViolation {
                tx_id: tx_id.to_string(),
                message: format!("{} cannot commit a transaction it never prepared", self.name),
            }),
        }
    }

    async fn abort(&self, tx_id: TransactionId) -> CoordinatorResult<()> {
        if self.committed.contains_key(&tx_id) {
            return Err(CoordinatorError::ProtocolViolation {
                tx_id: tx_id.to_string(),
                message: format!("{} cannot abort a committed transaction", self.name),
            });
        }

        let first = self.aborted.insert(tx_id);
        self.staged.remove(&tx_id);
        if first {
            debug!("{}: aborted {}", self.name, tx_id);
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}
