//! Two-phase commit coordinator
//!
//! Makes a single logical write atomic across independently-owned data
//! stores: either every participant commits or every participant aborts,
//! and a crashed coordinator picks up where it left off from its log.

pub mod api;
pub mod config;
pub mod coordination;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod participant;
pub mod txlog;

pub use coordination::{
    Coordinator, Outcome, ParticipantId, RecoveryManager, RecoveryReport, TransactionId,
    TransactionState, Vote,
};
pub use error::{CoordinatorError, CoordinatorResult};
pub use orchestrator::Orchestrator;
pub use participant::{ParticipantClient, ParticipantRegistry};
pub use txlog::TransactionLog;
