//! PostgreSQL transaction log

use super::TransactionLog;
use crate::config::DatabaseConfig;
use crate::coordination::{TransactionId, TransactionRecord, TransactionState};
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};

const SELECT_COLUMNS: &str = r#"
    SELECT id, label, state, participants, votes, acks, payloads, reason,
           version, created_at, updated_at, decided_at
    FROM coordinator_transactions
"#;

/// Transaction log persisted in PostgreSQL
pub struct PgTransactionLog {
    pool: PgPool,
}

impl PgTransactionLog {
    /// Connect to the database
    pub async fn new(config: &DatabaseConfig) -> CoordinatorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the log table and its indexes
    pub async fn run_migrations(&self) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS coordinator_transactions (
                id UUID PRIMARY KEY,
                label TEXT NOT NULL,
                state VARCHAR(16) NOT NULL,
                participants JSONB NOT NULL,
                votes JSONB NOT NULL,
                acks JSONB NOT NULL,
                payloads JSONB NOT NULL,
                reason TEXT,
                version BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                decided_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_coordinator_transactions_state
            ON coordinator_transactions (state, updated_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Transaction log migrations complete");
        Ok(())
    }

    async fn insert(&self, mut record: TransactionRecord) -> CoordinatorResult<TransactionRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO coordinator_transactions
                (id, label, state, participants, votes, acks, payloads, reason,
                 version, created_at, updated_at, decided_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1, $9, NOW(), $10)
            ON CONFLICT (id) DO NOTHING
            RETURNING updated_at
            "#,
        )
        .bind(*record.id.as_uuid())
        .bind(&record.label)
        .bind(record.state.as_str())
        .bind(Json(&record.participants))
        .bind(Json(&record.votes))
        .bind(Json(&record.acks))
        .bind(Json(&record.payloads))
        .bind(record.reason.as_deref())
        .bind(record.created_at)
        .bind(record.decided_at)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| CoordinatorError::Conflict {
            tx_id: record.id.to_string(),
            expected: 0,
        })?;

        record.version = 1;
        record.updated_at = row.try_get("updated_at")?;
        debug!("Created transaction {} ({})", record.id, record.label);
        Ok(record)
    }

    async fn update(&self, mut record: TransactionRecord) -> CoordinatorResult<TransactionRecord> {
        let current = self
            .get(&record.id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound {
                tx_id: record.id.to_string(),
            })?;

        if current.state != record.state && !current.state.can_transition_to(record.state) {
            return Err(CoordinatorError::InvalidStateTransition {
                from: current.state.to_string(),
                to: record.state.to_string(),
            });
        }

        // The version predicate makes the write conditional; the read above
        // only produces a better error for illegal transitions
        let row = sqlx::query(
            r#"
            UPDATE coordinator_transactions
            SET state = $3, votes = $4, acks = $5, reason = $6, decided_at = $7,
                version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING version, updated_at
            "#,
        )
        .bind(*record.id.as_uuid())
        .bind(record.version as i64)
        .bind(record.state.as_str())
        .bind(Json(&record.votes))
        .bind(Json(&record.acks))
        .bind(record.reason.as_deref())
        .bind(record.decided_at)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| CoordinatorError::Conflict {
            tx_id: record.id.to_string(),
            expected: record.version,
        })?;

        record.version = row.try_get::<i64, _>("version")? as u64;
        record.updated_at = row.try_get("updated_at")?;
        Ok(record)
    }
}

#[async_trait]
impl TransactionLog for PgTransactionLog {
    async fn put(&self, record: TransactionRecord) -> CoordinatorResult<TransactionRecord> {
        if record.version == 0 {
            self.insert(record).await
        } else {
            self.update(record).await
        }
    }

    async fn get(&self, id: &TransactionId) -> CoordinatorResult<Option<TransactionRecord>> {
        let row = sqlx::query(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    async fn scan(&self, states: &[TransactionState]) -> CoordinatorResult<Vec<TransactionRecord>> {
        let states: Vec<&str> = states.iter().map(|s| s.as_str()).collect();

        let rows = sqlx::query(&format!(
            "{} WHERE state = ANY($1) ORDER BY created_at",
            SELECT_COLUMNS
        ))
        .bind(states)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn health_check(&self) -> CoordinatorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> CoordinatorResult<TransactionRecord> {
    let state: String = row.try_get("state")?;
    let version: i64 = row.try_get("version")?;

    Ok(TransactionRecord {
        id: TransactionId::from_uuid(row.try_get("id")?),
        label: row.try_get("label")?,
        state: state.parse()?,
        participants: row.try_get::<Json<_>, _>("participants")?.0,
        votes: row.try_get::<Json<_>, _>("votes")?.0,
        acks: row.try_get::<Json<_>, _>("acks")?.0,
        payloads: row.try_get::<Json<_>, _>("payloads")?.0,
        reason: row.try_get("reason")?,
        version: version as u64,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        decided_at: row.try_get("decided_at")?,
    })
}
