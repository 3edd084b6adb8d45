//! Synchronous entry point for applications
//!
//! Starts a transaction across a set of participants, runs it to a terminal
//! state and hands back the outcome with a per-participant breakdown.

use crate::coordination::{
    Coordinator, Outcome, ParticipantId, TransactionId, TransactionState, Vote, VoteReceipt,
    VoteRecord,
};
use crate::error::CoordinatorResult;

use serde_json::Value;
use std::time::Duration;
use tracing::info;

/// Application-facing wrapper around the coordinator
#[derive(Clone)]
pub struct Orchestrator {
    coordinator: Coordinator,
    /// Wait used when a caller does not pass its own timeout
    default_timeout: Duration,
}

impl Orchestrator {
    pub fn new(coordinator: Coordinator) -> Self {
        let default_timeout = coordinator.config().run_timeout();
        Self {
            coordinator,
            default_timeout,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub async fn begin(
        &self,
        label: &str,
        participants: Vec<ParticipantId>,
    ) -> CoordinatorResult<TransactionId> {
        self.coordinator.begin(label, participants).await
    }

    pub async fn begin_with_payloads(
        &self,
        label: &str,
        participants: Vec<(ParticipantId, Value)>,
    ) -> CoordinatorResult<TransactionId> {
        self.coordinator.begin_with_payloads(label, participants).await
    }

    /// Run a begun transaction; `Timeout` means the caller should query later
    pub async fn run(
        &self,
        id: TransactionId,
        timeout: Option<Duration>,
    ) -> CoordinatorResult<Outcome> {
        self.coordinator
            .run(id, timeout.unwrap_or(self.default_timeout))
            .await
    }

    /// Begin and run in one call
    pub async fn execute(
        &self,
        label: &str,
        participants: Vec<(ParticipantId, Value)>,
        timeout: Option<Duration>,
    ) -> CoordinatorResult<Outcome> {
        let id = self.begin_with_payloads(label, participants).await?;
        let outcome = self.run(id, timeout).await?;

        info!(
            "Transaction {} ({}) finished {}",
            outcome.transaction_id, outcome.label, outcome.state
        );
        Ok(outcome)
    }

    pub async fn query(&self, id: &TransactionId) -> CoordinatorResult<TransactionState> {
        self.coordinator.query(id).await
    }

    pub async fn outcome(&self, id: &TransactionId) -> CoordinatorResult<Outcome> {
        self.coordinator.outcome(id).await
    }

    pub async fn report_vote(
        &self,
        id: TransactionId,
        participant: ParticipantId,
        vote: Vote,
    ) -> CoordinatorResult<VoteReceipt> {
        self.coordinator.report_vote(id, participant, vote).await
    }

    /// Votes received so far for a transaction still in flight
    pub async fn votes(&self, id: &TransactionId) -> CoordinatorResult<Vec<VoteRecord>> {
        self.coordinator.query(id).await?;
        Ok(self.coordinator.inflight_votes(id))
    }
}
