//! Transaction records, votes and the two-phase commit state machine

use crate::error::{CoordinatorError, CoordinatorResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Globally unique transaction identifier, generated by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoordinatorError::InvalidArgument(format!("invalid transaction id {}: {}", s, e)))
    }
}

/// Identifier of a participant service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle of a transaction.
///
/// ```text
/// Pending -> Preparing -> Prepared -> Committing -> Committed
///                 \                       \
///                  -> Aborting -> Aborted  -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Pending,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
    Failed,
}

impl TransactionState {
    pub const ALL: [TransactionState; 8] = [
        TransactionState::Pending,
        TransactionState::Preparing,
        TransactionState::Prepared,
        TransactionState::Committing,
        TransactionState::Committed,
        TransactionState::Aborting,
        TransactionState::Aborted,
        TransactionState::Failed,
    ];

    /// States a driver still has work to do in
    pub const TRANSIENT: [TransactionState; 5] = [
        TransactionState::Pending,
        TransactionState::Preparing,
        TransactionState::Prepared,
        TransactionState::Committing,
        TransactionState::Aborting,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Failed
        )
    }

    /// Whether `next` is an edge of the state graph. `Aborting -> Aborting` is
    /// allowed so abort dispatch can be re-entered.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;

        matches!(
            (self, next),
            (Pending, Preparing)
                | (Preparing, Prepared)
                | (Preparing, Aborting)
                | (Prepared, Committing)
                | (Committing, Committed)
                | (Aborting, Aborting)
                | (Aborting, Aborted)
                | (Preparing, Failed)
                | (Committing, Failed)
                | (Aborting, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Pending => "pending",
            TransactionState::Preparing => "preparing",
            TransactionState::Prepared => "prepared",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::Aborting => "aborting",
            TransactionState::Aborted => "aborted",
            TransactionState::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionState {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| CoordinatorError::Internal(format!("unknown transaction state: {}", s)))
    }
}

/// A participant's answer to prepare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Unknown,
    Yes,
    No,
}

/// Acknowledgement of the decided phase (commit or abort)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ack {
    Unknown,
    Acked,
    Failed,
}

/// Effect of folding one vote into a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteEffect {
    Recorded,
    Duplicate,
    Contradicted { previous: Vote },
}

/// A vote as it arrived at the coordinator, kept while the transaction is in flight
#[derive(Debug, Clone, Serialize)]
pub struct VoteRecord {
    pub participant: ParticipantId,
    pub vote: Vote,
    pub received_at: DateTime<Utc>,
}

/// Persisted state of one transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub label: String,
    pub state: TransactionState,
    /// Fixed at creation, in caller order
    pub participants: Vec<ParticipantId>,
    pub votes: BTreeMap<ParticipantId, Vote>,
    pub acks: BTreeMap<ParticipantId, Ack>,
    pub payloads: BTreeMap<ParticipantId, Value>,
    pub reason: Option<String>,
    /// Optimistic concurrency token; 0 until first stored
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl TransactionRecord {
    /// Create a new `Pending` transaction with a fresh id.
    ///
    /// Votes and acks are preallocated for every participant and never grow.
    pub fn new(label: &str, participants: Vec<(ParticipantId, Value)>) -> CoordinatorResult<Self> {
        if participants.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "a transaction needs at least one participant".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (participant, _) in &participants {
            if !seen.insert(participant) {
                return Err(CoordinatorError::InvalidArgument(format!(
                    "participant {} listed more than once",
                    participant
                )));
            }
        }

        let now = Utc::now();
        let ids: Vec<ParticipantId> = participants.iter().map(|(id, _)| id.clone()).collect();

        Ok(Self {
            id: TransactionId::new(),
            label: label.to_string(),
            state: TransactionState::Pending,
            votes: ids.iter().map(|id| (id.clone(), Vote::Unknown)).collect(),
            acks: ids.iter().map(|id| (id.clone(), Ack::Unknown)).collect(),
            payloads: participants.into_iter().collect(),
            participants: ids,
            reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
            decided_at: None,
        })
    }

    pub fn is_participant(&self, participant: &ParticipantId) -> bool {
        self.votes.contains_key(participant)
    }

    pub fn vote_of(&self, participant: &ParticipantId) -> Vote {
        self.votes.get(participant).copied().unwrap_or(Vote::Unknown)
    }

    pub fn ack_of(&self, participant: &ParticipantId) -> Ack {
        self.acks.get(participant).copied().unwrap_or(Ack::Unknown)
    }

    pub fn payload_of(&self, participant: &ParticipantId) -> Value {
        self.payloads.get(participant).cloned().unwrap_or(Value::Null)
    }

    /// Participants that have not voted yet, in participant order
    pub fn unknown_voters(&self) -> Vec<ParticipantId> {
        self.participants
            .iter()
            .filter(|p| self.vote_of(p) == Vote::Unknown)
            .cloned()
            .collect()
    }

    /// Participants that have not acknowledged the decided phase
    pub fn unacked(&self) -> Vec<ParticipantId> {
        self.participants
            .iter()
            .filter(|p| self.ack_of(p) != Ack::Acked)
            .cloned()
            .collect()
    }

    pub fn all_voted_yes(&self) -> bool {
        self.participants.iter().all(|p| self.vote_of(p) == Vote::Yes)
    }

    pub fn no_voters(&self) -> Vec<ParticipantId> {
        self.participants
            .iter()
            .filter(|p| self.vote_of(p) == Vote::No)
            .cloned()
            .collect()
    }

    pub fn all_acked(&self) -> bool {
        self.participants.iter().all(|p| self.ack_of(p) == Ack::Acked)
    }

    /// Move to `next`, rejecting edges outside the state graph.
    ///
    /// Entering a decision (`Prepared`, `Aborting`, or `Failed` straight from
    /// `Preparing`) stamps `decided_at`; entering a dispatch phase resets acks.
    pub fn transition(&mut self, next: TransactionState) -> CoordinatorResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoordinatorError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }

        let entering = self.state != next;
        if entering
            && matches!(
                next,
                TransactionState::Prepared | TransactionState::Aborting | TransactionState::Failed
            )
            && self.decided_at.is_none()
        {
            self.decided_at = Some(Utc::now());
        }
        if entering && matches!(next, TransactionState::Committing | TransactionState::Aborting) {
            for ack in self.acks.values_mut() {
                *ack = Ack::Unknown;
            }
        }

        self.state = next;
        Ok(())
    }

    /// Fold a vote into the record. Votes are set-once: repeating the same
    /// vote is a no-op and a different vote is reported, never applied.
    pub fn fold_vote(&mut self, participant: &ParticipantId, vote: Vote) -> CoordinatorResult<VoteEffect> {
        if vote == Vote::Unknown {
            return Err(CoordinatorError::InvalidArgument(
                "cannot record an unknown vote".to_string(),
            ));
        }

        let slot = self.votes.get_mut(participant).ok_or_else(|| {
            CoordinatorError::ProtocolViolation {
                tx_id: self.id.to_string(),
                message: format!("{} is not a participant", participant),
            }
        })?;

        match *slot {
            Vote::Unknown => {
                *slot = vote;
                Ok(VoteEffect::Recorded)
            }
            previous if previous == vote => Ok(VoteEffect::Duplicate),
            previous => Ok(VoteEffect::Contradicted { previous }),
        }
    }

    /// Apply the decision rule while `Preparing`: any `No` aborts, unanimous
    /// `Yes` prepares. Returns whether the state changed.
    pub fn decide(&mut self) -> CoordinatorResult<bool> {
        if self.state != TransactionState::Preparing {
            return Ok(false);
        }

        let no_voters = self.no_voters();
        if !no_voters.is_empty() {
            if self.reason.is_none() {
                self.reason = Some(format!("voted no: {}", join_ids(&no_voters)));
            }
            self.transition(TransactionState::Aborting)?;
            return Ok(true);
        }

        if self.all_voted_yes() {
            self.transition(TransactionState::Prepared)?;
            return Ok(true);
        }

        Ok(false)
    }
}

/// Terminal (or current) result of a transaction with a per-participant breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub transaction_id: TransactionId,
    pub label: String,
    pub state: TransactionState,
    pub reason: Option<String>,
    pub participants: Vec<ParticipantOutcome>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantOutcome {
    pub participant: ParticipantId,
    pub vote: Vote,
    pub ack: Ack,
}

impl Outcome {
    pub fn is_committed(&self) -> bool {
        self.state == TransactionState::Committed
    }

    /// Participants whose durable outcome is not confirmed
    pub fn unacknowledged(&self) -> Vec<&ParticipantId> {
        self.participants
            .iter()
            .filter(|p| p.ack != Ack::Acked)
            .map(|p| &p.participant)
            .collect()
    }
}

impl From<&TransactionRecord> for Outcome {
    fn from(record: &TransactionRecord) -> Self {
        Self {
            transaction_id: record.id,
            label: record.label.clone(),
            state: record.state,
            reason: record.reason.clone(),
            participants: record
                .participants
                .iter()
                .map(|p| ParticipantOutcome {
                    participant: p.clone(),
                    vote: record.vote_of(p),
                    ack: record.ack_of(p),
                })
                .collect(),
            decided_at: record.decided_at,
        }
    }
}

pub(crate) fn join_ids(ids: &[ParticipantId]) -> String {
    ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
}
