//! Two-phase commit coordination
//!
//! The coordination layer:
//! 1. Models transactions and the state machine they move through
//! 2. Drives each transaction through prepare and commit/abort
//! 3. Finishes transactions a crashed coordinator left behind

pub mod engine;
pub mod recovery;
pub mod transaction;

pub use engine::{Coordinator, VoteReceipt};
pub use recovery::{RecoveryManager, RecoveryReport};
pub use transaction::{
    Ack, Outcome, ParticipantId, ParticipantOutcome, TransactionId, TransactionRecord,
    TransactionState, Vote, VoteEffect, VoteRecord,
};
