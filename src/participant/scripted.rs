//! Scriptable participant for coordinator tests

use super::ParticipantClient;
use crate::coordination::{TransactionId, Vote};
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Participant whose answers are set by the test, recording every call
pub struct ScriptedParticipant {
    vote: Mutex<Vote>,
    prepare_error: Mutex<Option<String>>,
    prepare_delay_ms: AtomicU64,
    /// Commit/abort calls that fail before one succeeds
    ack_failures: AtomicU32,
    pub prepare_calls: AtomicU32,
    pub commit_calls: AtomicU32,
    pub abort_calls: AtomicU32,
    committed: Mutex<HashSet<TransactionId>>,
    aborted: Mutex<HashSet<TransactionId>>,
}

impl ScriptedParticipant {
    pub fn voting(vote: Vote) -> Self {
        Self {
            vote: Mutex::new(vote),
            prepare_error: Mutex::new(None),
            prepare_delay_ms: AtomicU64::new(0),
            ack_failures: AtomicU32::new(0),
            prepare_calls: AtomicU32::new(0),
            commit_calls: AtomicU32::new(0),
            abort_calls: AtomicU32::new(0),
            committed: Mutex::new(HashSet::new()),
            aborted: Mutex::new(HashSet::new()),
        }
    }

    pub fn yes() -> Self {
        Self::voting(Vote::Yes)
    }

    pub fn no() -> Self {
        Self::voting(Vote::No)
    }

    pub fn slow(self, delay: Duration) -> Self {
        self.prepare_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub fn unreachable(self, reason: &str) -> Self {
        *self.prepare_error.lock().unwrap() = Some(reason.to_string());
        self
    }

    pub fn failing_acks(self, failures: u32) -> Self {
        self.ack_failures.store(failures, Ordering::SeqCst);
        self
    }

    pub fn prepares(&self) -> u32 {
        self.prepare_calls.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u32 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> u32 {
        self.abort_calls.load(Ordering::SeqCst)
    }

    /// Distinct transactions whose commit took effect
    pub fn effective_commits(&self) -> usize {
        self.committed.lock().unwrap().len()
    }

    pub fn effective_aborts(&self) -> usize {
        self.aborted.lock().unwrap().len()
    }

    fn take_ack_failure(&self) -> bool {
        self.ack_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ParticipantClient for ScriptedParticipant {
    async fn prepare(&self, _tx_id: TransactionId, _payload: &Value) -> CoordinatorResult<Vote> {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.prepare_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let error = self.prepare_error.lock().unwrap().clone();
        if let Some(reason) = error {
            return Err(CoordinatorError::ParticipantUnavailable {
                participant: "scripted".to_string(),
                message: reason,
            });
        }

        Ok(*self.vote.lock().unwrap())
    }

    async fn commit(&self, tx_id: TransactionId) -> CoordinatorResult<()> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_ack_failure() {
            return Err(CoordinatorError::Internal("commit not delivered".to_string()));
        }
        self.committed.lock().unwrap().insert(tx_id);
        Ok(())
    }

    async fn abort(&self, tx_id: TransactionId) -> CoordinatorResult<()> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_ack_failure() {
            return Err(CoordinatorError::Internal("abort not delivered".to_string()));
        }
        self.aborted.lock().unwrap().insert(tx_id);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}
