//! Two-phase commit driver
//!
//! Every advancement of a transaction is a version-guarded write to the
//! transaction log, made before any message is sent to a participant:
//! 1. `Pending -> Preparing` is persisted, then Prepare fans out
//! 2. Votes are folded and decided in a single write
//! 3. `Committing` or `Aborting` is persisted, then Commit/Abort fans out
//! 4. Acks are folded and the terminal state is written

use super::transaction::{
    join_ids, Ack, Outcome, ParticipantId, TransactionId, TransactionRecord, TransactionState,
    Vote, VoteEffect, VoteRecord,
};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::participant::{ParticipantRegistry, RetryPolicy};
use crate::txlog::TransactionLog;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// What happened to a vote handed to `report_vote`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteReceipt {
    Recorded,
    Duplicate,
    /// Arrived while the transaction was not collecting votes
    Discarded,
}

/// Decided phase being delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Commit,
    Abort,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::Commit => "commit",
            Phase::Abort => "abort",
        }
    }

    fn completes_in(&self) -> TransactionState {
        match self {
            Phase::Commit => TransactionState::Committed,
            Phase::Abort => TransactionState::Aborted,
        }
    }
}

/// One prepare answer as it came back from a participant
struct Arrival {
    participant: ParticipantId,
    vote: Vote,
    /// Why the answer was turned into a `No`, if it was
    note: Option<String>,
}

/// Drives transactions through the two-phase commit state machine.
///
/// Cheap to clone; clones share the log, the registry and the in-flight
/// vote buffer. Any number of drivers may work on the same transaction
/// concurrently: the log's version check admits one writer per step and
/// participant operations are idempotent.
#[derive(Clone)]
pub struct Coordinator {
    log: Arc<dyn TransactionLog>,
    registry: Arc<ParticipantRegistry>,
    retry: RetryPolicy,
    config: CoordinatorConfig,
    /// Votes received for transactions that have not finished yet
    inflight: Arc<DashMap<TransactionId, Vec<VoteRecord>>>,
}

impl Coordinator {
    pub fn new(
        log: Arc<dyn TransactionLog>,
        registry: Arc<ParticipantRegistry>,
        retry: RetryPolicy,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            log,
            registry,
            retry,
            config,
            inflight: Arc::new(DashMap::new()),
        }
    }

    pub fn log(&self) -> &Arc<dyn TransactionLog> {
        &self.log
    }

    pub fn registry(&self) -> &Arc<ParticipantRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Create a `Pending` transaction with a `null` payload per participant
    pub async fn begin(
        &self,
        label: &str,
        participants: Vec<ParticipantId>,
    ) -> CoordinatorResult<TransactionId> {
        self.begin_with_payloads(
            label,
            participants.into_iter().map(|p| (p, Value::Null)).collect(),
        )
        .await
    }

    /// Create and persist a `Pending` transaction
    pub async fn begin_with_payloads(
        &self,
        label: &str,
        participants: Vec<(ParticipantId, Value)>,
    ) -> CoordinatorResult<TransactionId> {
        if let Some((unknown, _)) = participants.iter().find(|(p, _)| !self.registry.contains(p)) {
            return Err(CoordinatorError::InvalidArgument(format!(
                "participant {} is not registered",
                unknown
            )));
        }

        let record = TransactionRecord::new(label, participants)?;
        let stored = self.log.put(record).await?;

        crate::metrics::record_transaction_begun();
        info!(
            "Transaction {} ({}) begun with participants [{}]",
            stored.id,
            stored.label,
            join_ids(&stored.participants)
        );

        Ok(stored.id)
    }

    /// Advance a transaction to a terminal state.
    ///
    /// The protocol runs in its own task. When `wait` elapses the caller gets
    /// `Timeout` while the task carries on; the result is then available
    /// through `query`/`outcome`, or from recovery if this process dies.
    pub async fn run(&self, id: TransactionId, wait: Duration) -> CoordinatorResult<Outcome> {
        self.load(&id).await?;

        let started = Instant::now();
        let driver = self.clone();
        let handle = tokio::spawn(async move { driver.drive(id).await });

        match timeout(wait, handle).await {
            Ok(Ok(result)) => {
                let record = result?;
                crate::metrics::record_run_latency(record.state, started.elapsed().as_secs_f64());
                Ok(Outcome::from(&record))
            }
            Ok(Err(e)) => Err(CoordinatorError::Internal(format!(
                "driver for transaction {} stopped: {}",
                id, e
            ))),
            Err(_) => {
                warn!(
                    "Transaction {} not finished after {:?}; protocol continues in background",
                    id, wait
                );
                Err(CoordinatorError::Timeout {
                    operation: format!("transaction {}", id),
                })
            }
        }
    }

    /// Current state of a transaction
    pub async fn query(&self, id: &TransactionId) -> CoordinatorResult<TransactionState> {
        Ok(self.load(id).await?.state)
    }

    /// Current state with the per-participant breakdown
    pub async fn outcome(&self, id: &TransactionId) -> CoordinatorResult<Outcome> {
        Ok(Outcome::from(&self.load(id).await?))
    }

    /// Votes received so far for a transaction still in flight, in arrival order
    pub fn inflight_votes(&self, id: &TransactionId) -> Vec<VoteRecord> {
        self.inflight.get(id).map(|v| v.clone()).unwrap_or_default()
    }

    /// Accept a vote delivered out of band.
    ///
    /// Only a transaction in `Preparing` takes votes; anything else is logged
    /// and discarded. A vote that contradicts an earlier one forces the
    /// transaction into `Aborting` and is reported as a protocol violation.
    pub async fn report_vote(
        &self,
        id: TransactionId,
        participant: ParticipantId,
        vote: Vote,
    ) -> CoordinatorResult<VoteReceipt> {
        if vote == Vote::Unknown {
            return Err(CoordinatorError::InvalidArgument(
                "vote must be yes or no".to_string(),
            ));
        }

        let current = self.load(&id).await?;
        if !current.is_participant(&participant) {
            crate::metrics::record_protocol_violation();
            warn!(
                "Discarding vote from {} for transaction {}: not a participant",
                participant, id
            );
            return Err(CoordinatorError::ProtocolViolation {
                tx_id: id.to_string(),
                message: format!("{} is not a participant", participant),
            });
        }

        if current.state == TransactionState::Preparing
            && self.already_received(&id, &participant, vote)
        {
            debug!("Duplicate vote {:?} from {} for transaction {}", vote, participant, id);
            return Ok(VoteReceipt::Duplicate);
        }

        let mut effect = None;
        let (record, _) = self
            .update(id, |tx| {
                effect = None;
                if tx.state != TransactionState::Preparing {
                    return Ok(false);
                }

                let folded = tx.fold_vote(&participant, vote)?;
                effect = Some(folded);
                match folded {
                    VoteEffect::Recorded => {
                        tx.decide()?;
                        Ok(true)
                    }
                    VoteEffect::Duplicate => Ok(false),
                    VoteEffect::Contradicted { previous } => {
                        tx.reason = Some(format!(
                            "{} voted {:?} after voting {:?}",
                            participant, vote, previous
                        ));
                        tx.transition(TransactionState::Aborting)?;
                        Ok(true)
                    }
                }
            })
            .await?;

        match effect {
            None => {
                info!(
                    "Discarding late vote {:?} from {} for transaction {} in state {}",
                    vote, participant, id, record.state
                );
                Ok(VoteReceipt::Discarded)
            }
            Some(VoteEffect::Recorded) => {
                crate::metrics::record_vote(vote);
                self.note_arrival(id, &participant, vote);
                debug!(
                    "Recorded vote {:?} from {} for transaction {} (now {})",
                    vote, participant, id, record.state
                );
                Ok(VoteReceipt::Recorded)
            }
            Some(VoteEffect::Duplicate) => Ok(VoteReceipt::Duplicate),
            Some(VoteEffect::Contradicted { previous }) => {
                crate::metrics::record_protocol_violation();
                warn!(
                    "Participant {} contradicted its {:?} vote on transaction {}; aborting",
                    participant, previous, id
                );
                Err(CoordinatorError::ProtocolViolation {
                    tx_id: id.to_string(),
                    message: format!(
                        "{} voted {:?} after voting {:?}",
                        participant, vote, previous
                    ),
                })
            }
        }
    }

    /// Run the state machine from whatever state the log holds until the
    /// transaction is terminal. Safe to call from several places at once.
    pub(crate) async fn drive(&self, id: TransactionId) -> CoordinatorResult<TransactionRecord> {
        loop {
            let record = self.load(&id).await?;
            let state = record.state;

            match state {
                _ if state.is_terminal() => {
                    self.inflight.remove(&id);
                    return Ok(record);
                }
                TransactionState::Pending => {
                    self.advance(id, TransactionState::Pending, TransactionState::Preparing)
                        .await?;
                }
                TransactionState::Preparing => self.prepare_phase(record).await?,
                TransactionState::Prepared => {
                    self.advance(id, TransactionState::Prepared, TransactionState::Committing)
                        .await?;
                }
                TransactionState::Committing => self.finish_phase(record, Phase::Commit).await?,
                TransactionState::Aborting => self.finish_phase(record, Phase::Abort).await?,
                _ => {
                    return Err(CoordinatorError::Internal(format!(
                        "no driver step for state {}",
                        state
                    )))
                }
            }
        }
    }

    /// Persist `from -> to` unless another driver already moved on
    async fn advance(
        &self,
        id: TransactionId,
        from: TransactionState,
        to: TransactionState,
    ) -> CoordinatorResult<()> {
        let (_, applied) = self
            .update(id, |tx| {
                if tx.state != from {
                    return Ok(false);
                }
                tx.transition(to)?;
                Ok(true)
            })
            .await?;

        if applied {
            debug!("Transaction {} {} -> {}", id, from, to);
        }
        Ok(())
    }

    /// Send Prepare to every participant that has not voted, then fold the
    /// answers and decide in one write
    async fn prepare_phase(&self, record: TransactionRecord) -> CoordinatorResult<()> {
        let id = record.id;
        let voters = record.unknown_voters();
        debug!(
            "Transaction {} requesting votes from [{}]",
            id,
            join_ids(&voters)
        );

        let mut calls: FuturesUnordered<_> = voters
            .into_iter()
            .map(|participant| {
                let payload = record.payload_of(&participant);
                async move { self.request_vote(id, participant, payload).await }
            })
            .collect();

        let mut arrivals = Vec::new();
        while let Some(arrival) = calls.next().await {
            self.note_arrival(id, &arrival.participant, arrival.vote);
            arrivals.push(arrival);
        }

        let mut late = false;
        let (record, applied) = self
            .update(id, |tx| {
                late = tx.state != TransactionState::Preparing;
                if late {
                    return Ok(false);
                }

                for arrival in &arrivals {
                    match tx.fold_vote(&arrival.participant, arrival.vote)? {
                        VoteEffect::Recorded => {
                            if tx.reason.is_none() {
                                tx.reason = arrival.note.clone();
                            }
                        }
                        VoteEffect::Duplicate => {}
                        VoteEffect::Contradicted { previous } => {
                            if tx.state == TransactionState::Preparing {
                                tx.reason = Some(format!(
                                    "{} answered prepare with {:?} after voting {:?}",
                                    arrival.participant, arrival.vote, previous
                                ));
                                tx.transition(TransactionState::Aborting)?;
                            }
                        }
                    }
                }

                tx.decide()?;
                Ok(true)
            })
            .await?;

        if late {
            info!(
                "Discarding {} late vote(s) for transaction {} in state {}",
                arrivals.len(),
                id,
                record.state
            );
            return Ok(());
        }

        if applied {
            for arrival in &arrivals {
                crate::metrics::record_vote(arrival.vote);
            }
            match record.state {
                TransactionState::Prepared => info!("Transaction {} prepared", id),
                TransactionState::Aborting => warn!(
                    "Transaction {} aborting: {}",
                    id,
                    record.reason.as_deref().unwrap_or("no reason recorded")
                ),
                _ => {}
            }
        }

        Ok(())
    }

    /// Ask one participant for its vote. Errors, timeouts and unregistered
    /// participants all come back as `No` with a note saying why.
    async fn request_vote(
        &self,
        id: TransactionId,
        participant: ParticipantId,
        payload: Value,
    ) -> Arrival {
        let client = match self.registry.get(&participant) {
            Some(client) => client,
            None => {
                warn!("Participant {} of transaction {} is not registered", participant, id);
                let note = Some(format!("{} is not registered", participant));
                return Arrival { participant, vote: Vote::No, note };
            }
        };

        let (vote, note) = match timeout(self.config.prepare_timeout(), client.prepare(id, &payload)).await {
            Ok(Ok(Vote::Unknown)) => (
                Vote::No,
                Some(format!("{} answered prepare without a vote", participant)),
            ),
            Ok(Ok(vote)) => (vote, None),
            Ok(Err(e)) => {
                warn!("Participant {} failed prepare of {}: {}", participant, id, e);
                (Vote::No, Some(format!("{} prepare failed: {}", participant, e)))
            }
            Err(_) => {
                warn!(
                    "Participant {} prepare of {} timed out after {:?}",
                    participant,
                    id,
                    self.config.prepare_timeout()
                );
                (Vote::No, Some(format!("{} prepare timed out", participant)))
            }
        };

        let result = match (&note, vote) {
            (Some(_), _) => "error",
            (None, Vote::Yes) => "yes",
            (None, _) => "no",
        };
        crate::metrics::record_participant_call(&participant, "prepare", result);

        Arrival { participant, vote, note }
    }

    /// Deliver the decided phase to every participant that has not
    /// acknowledged it, then write the acks and the terminal state
    async fn finish_phase(&self, record: TransactionRecord, phase: Phase) -> CoordinatorResult<()> {
        let id = record.id;
        let dispatch_state = record.state;
        let pending = record.unacked();
        debug!(
            "Transaction {} delivering {} to [{}]",
            id,
            phase.as_str(),
            join_ids(&pending)
        );

        let results = join_all(pending.into_iter().map(|participant| async move {
            let result = self.deliver(id, &participant, phase).await;
            (participant, result)
        }))
        .await;

        let (record, applied) = self
            .update(id, |tx| {
                if tx.state != dispatch_state {
                    return Ok(false);
                }

                for (participant, result) in &results {
                    if let Some(ack) = tx.acks.get_mut(participant) {
                        if *ack != Ack::Acked {
                            *ack = if result.is_ok() { Ack::Acked } else { Ack::Failed };
                        }
                    }
                }

                if tx.all_acked() {
                    tx.transition(phase.completes_in())?;
                } else {
                    let missing = format!(
                        "{} not acknowledged by {}",
                        phase.as_str(),
                        join_ids(&tx.unacked())
                    );
                    tx.reason = Some(match tx.reason.take() {
                        Some(earlier) => format!("{}; {}", earlier, missing),
                        None => missing,
                    });
                    tx.transition(TransactionState::Failed)?;
                }
                Ok(true)
            })
            .await?;

        if applied {
            self.finished(&record);
        }
        Ok(())
    }

    async fn deliver(
        &self,
        id: TransactionId,
        participant: &ParticipantId,
        phase: Phase,
    ) -> CoordinatorResult<()> {
        let client = self.registry.get(participant).ok_or_else(|| {
            CoordinatorError::UnknownParticipant {
                participant: participant.to_string(),
            }
        })?;

        let result = self
            .retry
            .run(participant, phase.as_str(), || {
                let client = client.clone();
                async move {
                    match phase {
                        Phase::Commit => client.commit(id).await,
                        Phase::Abort => client.abort(id).await,
                    }
                }
            })
            .await;

        let label = if result.is_ok() { "acked" } else { "failed" };
        crate::metrics::record_participant_call(participant, phase.as_str(), label);

        if let Err(e) = &result {
            error!("Transaction {}: {}", id, e);
        }
        result
    }

    fn finished(&self, record: &TransactionRecord) {
        crate::metrics::record_outcome(record.state);

        match record.state {
            TransactionState::Committed => info!("Transaction {} committed", record.id),
            TransactionState::Aborted => info!(
                "Transaction {} aborted: {}",
                record.id,
                record.reason.as_deref().unwrap_or("no reason recorded")
            ),
            TransactionState::Failed => error!(
                "Transaction {} failed and needs operator attention: {}",
                record.id,
                record.reason.as_deref().unwrap_or("no reason recorded")
            ),
            _ => {}
        }
    }

    /// Same vote from the same participant already folded in
    fn already_received(&self, id: &TransactionId, participant: &ParticipantId, vote: Vote) -> bool {
        self.inflight.get(id).map_or(false, |votes| {
            votes
                .iter()
                .any(|v| &v.participant == participant && v.vote == vote)
        })
    }

    fn note_arrival(&self, id: TransactionId, participant: &ParticipantId, vote: Vote) {
        self.inflight.entry(id).or_default().push(VoteRecord {
            participant: participant.clone(),
            vote,
            received_at: Utc::now(),
        });
    }

    async fn load(&self, id: &TransactionId) -> CoordinatorResult<TransactionRecord> {
        self.log
            .get(id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound {
                tx_id: id.to_string(),
            })
    }

    /// Read, mutate and write back under the version check.
    ///
    /// `mutate` returns whether it changed anything; when it does not, the
    /// fresh record is returned unwritten. On a conflict the record is
    /// re-read and `mutate` runs again, up to `max_conflict_retries` times.
    async fn update<F>(
        &self,
        id: TransactionId,
        mut mutate: F,
    ) -> CoordinatorResult<(TransactionRecord, bool)>
    where
        F: FnMut(&mut TransactionRecord) -> CoordinatorResult<bool>,
    {
        let mut conflicts = 0;

        loop {
            let mut record = self.load(&id).await?;
            if !mutate(&mut record)? {
                return Ok((record, false));
            }

            match self.log.put(record).await {
                Ok(stored) => return Ok((stored, true)),
                Err(CoordinatorError::Conflict { .. })
                    if conflicts < self.config.max_conflict_retries =>
                {
                    conflicts += 1;
                    crate::metrics::record_conflict();
                    debug!(
                        "Version conflict on transaction {} (retry {}/{})",
                        id, conflicts, self.config.max_conflict_retries
                    );
                }
                Err(e) => {
                    if matches!(e, CoordinatorError::Conflict { .. }) {
                        crate::metrics::record_conflict();
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::scripted::ScriptedParticipant;
    use crate::participant::{LocalParticipant, MockParticipantClient, ParticipantClient};
    use crate::txlog::MemoryTransactionLog;
    use serde_json::json;

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            call_timeout: Duration::from_millis(200),
        }
    }

    fn coordinator(participants: Vec<(&str, Arc<dyn ParticipantClient>)>) -> Coordinator {
        let registry = Arc::new(ParticipantRegistry::new());
        for (name, client) in participants {
            registry.register(name.into(), client);
        }

        let config = CoordinatorConfig {
            prepare_timeout_ms: 100,
            ..CoordinatorConfig::default()
        };

        Coordinator::new(Arc::new(MemoryTransactionLog::new()), registry, retry(), config)
    }

    fn ids(names: &[&str]) -> Vec<ParticipantId> {
        names.iter().map(|n| ParticipantId::from(*n)).collect()
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_unanimous_yes_commits_once_each() {
        let a = Arc::new(ScriptedParticipant::yes());
        let b = Arc::new(ScriptedParticipant::yes());
        let coordinator = coordinator(vec![("a", a.clone()), ("b", b.clone())]);

        let id = coordinator.begin("PWv2", ids(&["a", "b"])).await.unwrap();
        let outcome = coordinator.run(id, WAIT).await.unwrap();

        assert_eq!(outcome.state, TransactionState::Committed);
        assert!(outcome.unacknowledged().is_empty());
        assert_eq!(a.effective_commits(), 1);
        assert_eq!(b.effective_commits(), 1);
        assert_eq!(a.aborts() + b.aborts(), 0);
    }

    #[tokio::test]
    async fn test_single_no_aborts_every_participant() {
        let a = Arc::new(ScriptedParticipant::yes());
        let b = Arc::new(ScriptedParticipant::no());
        let coordinator = coordinator(vec![("a", a.clone()), ("b", b.clone())]);

        let id = coordinator.begin("PWv2", ids(&["a", "b"])).await.unwrap();
        let outcome = coordinator.run(id, WAIT).await.unwrap();

        assert_eq!(outcome.state, TransactionState::Aborted);
        assert_eq!(outcome.reason.as_deref(), Some("voted no: b"));
        assert_eq!(a.effective_aborts(), 1);
        assert_eq!(b.effective_aborts(), 1);
        assert_eq!(a.commits(), 0);
    }

    #[tokio::test]
    async fn test_prepare_timeout_counts_as_no() {
        let a = Arc::new(ScriptedParticipant::yes());
        let b = Arc::new(ScriptedParticipant::yes().slow(Duration::from_millis(500)));
        let coordinator = coordinator(vec![("a", a.clone()), ("b", b.clone())]);

        let id = coordinator.begin("PWv2", ids(&["a", "b"])).await.unwrap();
        let outcome = coordinator.run(id, WAIT).await.unwrap();

        assert_eq!(outcome.state, TransactionState::Aborted);
        assert!(outcome.reason.unwrap().contains("b prepare timed out"));
        assert_eq!(a.effective_aborts(), 1);
        assert_eq!(a.commits(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_participant_aborts() {
        let a = Arc::new(ScriptedParticipant::yes());
        let b = Arc::new(ScriptedParticipant::yes().unreachable("connection refused"));
        let coordinator = coordinator(vec![("a", a.clone()), ("b", b.clone())]);

        let id = coordinator.begin("PWv2", ids(&["a", "b"])).await.unwrap();
        let outcome = coordinator.run(id, WAIT).await.unwrap();

        assert_eq!(outcome.state, TransactionState::Aborted);
        assert_eq!(a.effective_aborts(), 1);
    }

    #[tokio::test]
    async fn test_commit_ack_exhaustion_fails_transaction() {
        let a = Arc::new(ScriptedParticipant::yes());
        let b = Arc::new(ScriptedParticipant::yes().failing_acks(10));
        let coordinator = coordinator(vec![("a", a.clone()), ("b", b.clone())]);

        let id = coordinator.begin("PWv2", ids(&["a", "b"])).await.unwrap();
        let outcome = coordinator.run(id, WAIT).await.unwrap();

        assert_eq!(outcome.state, TransactionState::Failed);
        assert_eq!(outcome.unacknowledged(), vec![&ParticipantId::from("b")]);
        assert_eq!(b.commits(), 3);
        assert_eq!(a.effective_commits(), 1);
        assert!(outcome.reason.unwrap().contains("commit not acknowledged by b"));
    }

    #[tokio::test]
    async fn test_transient_ack_failures_are_retried() {
        let a = Arc::new(ScriptedParticipant::yes().failing_acks(2));
        let coordinator = coordinator(vec![("a", a.clone())]);

        let id = coordinator.begin("single", ids(&["a"])).await.unwrap();
        let outcome = coordinator.run(id, WAIT).await.unwrap();

        assert_eq!(outcome.state, TransactionState::Committed);
        assert_eq!(a.commits(), 3);
        assert_eq!(a.effective_commits(), 1);
    }

    #[tokio::test]
    async fn test_begin_validates_participants() {
        let coordinator = coordinator(vec![("a", Arc::new(ScriptedParticipant::yes()))]);

        let empty = coordinator.begin("PWv2", vec![]).await;
        assert!(matches!(empty, Err(CoordinatorError::InvalidArgument(_))));

        let duplicate = coordinator.begin("PWv2", ids(&["a", "a"])).await;
        assert!(matches!(duplicate, Err(CoordinatorError::InvalidArgument(_))));

        let unknown = coordinator.begin("PWv2", ids(&["a", "z"])).await;
        assert!(matches!(unknown, Err(CoordinatorError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_not_found() {
        let coordinator = coordinator(vec![]);
        let missing = TransactionId::new();

        assert!(matches!(
            coordinator.query(&missing).await,
            Err(CoordinatorError::NotFound { .. })
        ));
        assert!(matches!(
            coordinator.run(missing, WAIT).await,
            Err(CoordinatorError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_timeout_leaves_protocol_running() {
        let a = Arc::new(ScriptedParticipant::yes().slow(Duration::from_millis(40)));
        let coordinator = coordinator(vec![("a", a.clone())]);

        let id = coordinator.begin("slow", ids(&["a"])).await.unwrap();
        let result = coordinator.run(id, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(CoordinatorError::Timeout { .. })));

        let mut state = coordinator.query(&id).await.unwrap();
        for _ in 0..100 {
            if state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            state = coordinator.query(&id).await.unwrap();
        }
        assert_eq!(state, TransactionState::Committed);
        assert_eq!(a.effective_commits(), 1);
    }

    #[tokio::test]
    async fn test_reported_votes_are_idempotent_and_contradictions_abort() {
        let a = Arc::new(ScriptedParticipant::yes());
        let b = Arc::new(ScriptedParticipant::yes());
        let coordinator = coordinator(vec![("a", a.clone()), ("b", b.clone())]);

        let id = coordinator.begin("PWv2", ids(&["a", "b"])).await.unwrap();
        coordinator
            .advance(id, TransactionState::Pending, TransactionState::Preparing)
            .await
            .unwrap();

        let first = coordinator.report_vote(id, "a".into(), Vote::Yes).await.unwrap();
        let version = coordinator.log().get(&id).await.unwrap().unwrap().version;
        let again = coordinator.report_vote(id, "a".into(), Vote::Yes).await.unwrap();
        assert_eq!(first, VoteReceipt::Recorded);
        assert_eq!(again, VoteReceipt::Duplicate);
        assert_eq!(coordinator.inflight_votes(&id).len(), 1);
        assert_eq!(coordinator.log().get(&id).await.unwrap().unwrap().version, version);

        let flip = coordinator.report_vote(id, "a".into(), Vote::No).await;
        assert!(matches!(flip, Err(CoordinatorError::ProtocolViolation { .. })));
        assert_eq!(coordinator.query(&id).await.unwrap(), TransactionState::Aborting);

        let outcome = coordinator.run(id, WAIT).await.unwrap();
        assert_eq!(outcome.state, TransactionState::Aborted);
        assert_eq!(a.effective_aborts(), 1);
        assert_eq!(b.effective_aborts(), 1);
        assert_eq!(a.prepares() + b.prepares(), 0);
        assert!(coordinator.inflight_votes(&id).is_empty());
    }

    #[tokio::test]
    async fn test_reported_votes_decide_transaction() {
        let a = Arc::new(ScriptedParticipant::yes());
        let coordinator = coordinator(vec![("a", a.clone())]);

        let id = coordinator.begin("single", ids(&["a"])).await.unwrap();
        coordinator
            .advance(id, TransactionState::Pending, TransactionState::Preparing)
            .await
            .unwrap();

        coordinator.report_vote(id, "a".into(), Vote::Yes).await.unwrap();
        assert_eq!(coordinator.query(&id).await.unwrap(), TransactionState::Prepared);

        let outcome = coordinator.run(id, WAIT).await.unwrap();
        assert_eq!(outcome.state, TransactionState::Committed);
        assert_eq!(a.prepares(), 0);
    }

    #[tokio::test]
    async fn test_late_and_foreign_votes_are_discarded() {
        let a = Arc::new(ScriptedParticipant::yes());
        let coordinator = coordinator(vec![("a", a.clone())]);

        let id = coordinator.begin("single", ids(&["a"])).await.unwrap();

        let early = coordinator.report_vote(id, "a".into(), Vote::Yes).await.unwrap();
        assert_eq!(early, VoteReceipt::Discarded);

        coordinator.run(id, WAIT).await.unwrap();

        let late = coordinator.report_vote(id, "a".into(), Vote::No).await.unwrap();
        assert_eq!(late, VoteReceipt::Discarded);
        assert_eq!(coordinator.query(&id).await.unwrap(), TransactionState::Committed);

        let foreign = coordinator.report_vote(id, "z".into(), Vote::Yes).await;
        assert!(matches!(foreign, Err(CoordinatorError::ProtocolViolation { .. })));

        let unknown = coordinator.report_vote(id, "a".into(), Vote::Unknown).await;
        assert!(matches!(unknown, Err(CoordinatorError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_concurrent_drivers_commit_once() {
        let a = Arc::new(ScriptedParticipant::yes());
        let b = Arc::new(ScriptedParticipant::yes());
        let coordinator = coordinator(vec![("a", a.clone()), ("b", b.clone())]);

        let id = coordinator.begin("PWv2", ids(&["a", "b"])).await.unwrap();
        let (first, second) = tokio::join!(coordinator.drive(id), coordinator.drive(id));

        assert_eq!(first.unwrap().state, TransactionState::Committed);
        assert_eq!(second.unwrap().state, TransactionState::Committed);
        assert_eq!(a.effective_commits(), 1);
        assert_eq!(b.effective_commits(), 1);
    }

    #[tokio::test]
    async fn test_payloads_reach_participants() {
        let a = Arc::new(LocalParticipant::new("a"));
        let coordinator = coordinator(vec![("a", a.clone())]);

        let id = coordinator
            .begin_with_payloads("PWv2", vec![("a".into(), json!({"firstName": "Ada"}))])
            .await
            .unwrap();
        coordinator.run(id, WAIT).await.unwrap();

        assert_eq!(a.committed_value(&id), Some(json!({"firstName": "Ada"})));
    }

    #[tokio::test]
    async fn test_mock_participant_sees_each_phase_once() {
        let mut mock = MockParticipantClient::new();
        mock.expect_prepare().times(1).returning(|_, _| Ok(Vote::Yes));
        mock.expect_commit().times(1).returning(|_| Ok(()));
        mock.expect_abort().never();

        let coordinator = coordinator(vec![("a", Arc::new(mock))]);
        let id = coordinator.begin("mocked", ids(&["a"])).await.unwrap();
        let outcome = coordinator.run(id, WAIT).await.unwrap();

        assert!(outcome.is_committed());
    }

    #[tokio::test]
    async fn test_mock_prepare_error_aborts() {
        let mut mock = MockParticipantClient::new();
        mock.expect_prepare().returning(|_, _| {
            Err(CoordinatorError::ParticipantUnavailable {
                participant: "a".to_string(),
                message: "connection reset".to_string(),
            })
        });
        mock.expect_abort().times(1).returning(|_| Ok(()));
        mock.expect_commit().never();

        let coordinator = coordinator(vec![("a", Arc::new(mock))]);
        let id = coordinator.begin("mocked", ids(&["a"])).await.unwrap();
        let outcome = coordinator.run(id, WAIT).await.unwrap();

        assert_eq!(outcome.state, TransactionState::Aborted);
        assert!(outcome.reason.unwrap().contains("a prepare failed"));
    }
}
