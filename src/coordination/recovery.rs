//! Crash recovery
//!
//! Transactions left in a transient state by a dead coordinator are finished
//! by re-running the state machine from what the log holds. Only work not
//! yet recorded is redone: Prepare goes to participants without a vote,
//! Commit/Abort to participants without an ack.

use super::engine::Coordinator;
use super::transaction::{TransactionId, TransactionRecord, TransactionState};
use crate::config::RecoveryConfig;
use crate::error::{CoordinatorError, CoordinatorResult};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Tally of one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub committed: usize,
    pub aborted: usize,
    pub failed: usize,
    /// Already terminal on re-read, or owned by another driver
    pub skipped: usize,
    pub errors: usize,
}

impl RecoveryReport {
    pub fn recovered(&self) -> usize {
        self.committed + self.aborted + self.failed
    }

    fn tally(&mut self, resolution: Resolution) {
        let label = match resolution {
            Resolution::Finished(TransactionState::Committed) => {
                self.committed += 1;
                "committed"
            }
            Resolution::Finished(TransactionState::Aborted) => {
                self.aborted += 1;
                "aborted"
            }
            Resolution::Finished(_) => {
                self.failed += 1;
                "failed"
            }
            Resolution::Skipped => {
                self.skipped += 1;
                "skipped"
            }
            Resolution::Error => {
                self.errors += 1;
                "error"
            }
        };
        crate::metrics::record_recovery(label);
    }
}

enum Resolution {
    Finished(TransactionState),
    Skipped,
    Error,
}

/// Finishes transactions abandoned in a transient state
pub struct RecoveryManager {
    coordinator: Coordinator,
    config: RecoveryConfig,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl RecoveryManager {
    pub fn new(coordinator: Coordinator, config: RecoveryConfig) -> Self {
        Self {
            coordinator,
            config,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Recover every transient transaction; run once at startup
    pub async fn recover_all(&self) -> CoordinatorResult<RecoveryReport> {
        let records = self
            .coordinator
            .log()
            .scan(&TransactionState::TRANSIENT)
            .await?;

        info!("Startup recovery found {} unfinished transaction(s)", records.len());
        Ok(self.recover(records).await)
    }

    /// Recover transient transactions untouched for longer than `stale_after`,
    /// leaving ones a live driver is still working on
    pub async fn sweep(&self) -> CoordinatorResult<RecoveryReport> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after())
            .map_err(|e| CoordinatorError::Config(format!("stale_after out of range: {}", e)))?;
        let cutoff = Utc::now() - stale_after;

        let records: Vec<_> = self
            .coordinator
            .log()
            .scan(&TransactionState::TRANSIENT)
            .await?
            .into_iter()
            .filter(|record| record.updated_at <= cutoff)
            .collect();

        if !records.is_empty() {
            info!("Recovery sweep found {} stale transaction(s)", records.len());
        }
        Ok(self.recover(records).await)
    }

    async fn recover(&self, records: Vec<TransactionRecord>) -> RecoveryReport {
        let mut report = RecoveryReport {
            scanned: records.len(),
            ..RecoveryReport::default()
        };

        let resolutions: Vec<Resolution> = stream::iter(records)
            .map(|record| self.recover_one(record.id))
            .buffer_unordered(self.config.max_concurrent_recoveries.max(1))
            .collect()
            .await;

        for resolution in resolutions {
            report.tally(resolution);
        }

        if report.scanned > 0 {
            info!(
                "Recovery pass: {} scanned, {} committed, {} aborted, {} failed, {} skipped, {} errors",
                report.scanned,
                report.committed,
                report.aborted,
                report.failed,
                report.skipped,
                report.errors
            );
        }

        report
    }

    async fn recover_one(&self, id: TransactionId) -> Resolution {
        match self.coordinator.log().get(&id).await {
            Ok(Some(record)) if record.state.is_terminal() => {
                debug!("Transaction {} already {}; skipping", id, record.state);
                return Resolution::Skipped;
            }
            Ok(Some(record)) => {
                info!("Recovering transaction {} from state {}", id, record.state);
            }
            Ok(None) => {
                warn!("Transaction {} vanished from the log", id);
                return Resolution::Skipped;
            }
            Err(e) => {
                error!("Failed to read transaction {} for recovery: {}", id, e);
                return Resolution::Error;
            }
        }

        match self.coordinator.drive(id).await {
            Ok(record) => Resolution::Finished(record.state),
            Err(CoordinatorError::Conflict { .. }) => {
                debug!("Transaction {} is being driven elsewhere; skipping", id);
                Resolution::Skipped
            }
            Err(e) => {
                error!("Recovery of transaction {} failed: {}", id, e);
                Resolution::Error
            }
        }
    }

    /// Periodic sweep loop
    pub async fn run(&self) -> CoordinatorResult<()> {
        let mut sweep_interval = interval(self.config.sweep_interval());

        info!(
            "Recovery manager started (every {:?}, stale after {:?})",
            self.config.sweep_interval(),
            self.config.stale_after()
        );

        loop {
            if *self.shutdown.read().await {
                break;
            }

            sweep_interval.tick().await;

            if *self.shutdown.read().await {
                break;
            }

            if let Err(e) = self.sweep().await {
                error!("Recovery sweep failed: {}", e);
            }
        }

        info!("Recovery manager stopped");
        Ok(())
    }

    /// Stop the sweep loop
    pub async fn stop(&self) {
        let mut shutdown = self.shutdown.write().await;
        *shutdown = true;
    }
}
