//! Participant backed by PostgreSQL prepared transactions
//!
//! The server must run with `max_prepared_transactions > 0`.

use super::ParticipantClient;
use crate::config::ParticipantConfig;
use crate::coordination::{TransactionId, Vote};
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::{debug, info, warn};

/// Writes the payload as one row of a table, held in a prepared transaction
/// until the coordinator decides.
pub struct PostgresParticipant {
    name: String,
    pool: PgPool,
    /// Target table, validated as an identifier when settings are loaded
    table: String,
}

impl PostgresParticipant {
    /// Connect using a participant's configuration
    pub async fn connect(name: &str, config: &ParticipantConfig) -> CoordinatorResult<Self> {
        let url = config.url.as_deref().ok_or_else(|| {
            CoordinatorError::Config(format!("participant {} has no database url", name))
        })?;
        let table = config.table.clone().ok_or_else(|| {
            CoordinatorError::Config(format!("participant {} has no table", name))
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;

        info!("Participant {} connected (table {})", name, table);
        Ok(Self::with_pool(name, pool, &table))
    }

    /// Use an existing pool; `table` must already be a valid identifier
    pub fn with_pool(name: &str, pool: PgPool, table: &str) -> Self {
        Self {
            name: name.to_string(),
            pool,
            table: table.to_string(),
        }
    }

    /// Global identifier of the prepared transaction on this server
    fn gid(&self, tx_id: &TransactionId) -> String {
        format!("{}-{}", self.name, tx_id)
    }

    async fn is_prepared(&self, gid: &str) -> CoordinatorResult<bool> {
        let row = sqlx::query("SELECT 1 FROM pg_prepared_xacts WHERE gid = $1")
            .bind(gid)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    /// Run `COMMIT PREPARED` or `ROLLBACK PREPARED`; a missing gid means an
    /// earlier attempt already resolved it
    async fn finish(&self, tx_id: TransactionId, statement: &str) -> CoordinatorResult<()> {
        let gid = self.gid(&tx_id);

        if !self.is_prepared(&gid).await? {
            debug!("{}: {} already resolved", self.name, gid);
            return Ok(());
        }

        sqlx::query(&format!("{} '{}'", statement, gid))
            .execute(&self.pool)
            .await?;

        debug!("{}: {} {}", self.name, statement, gid);
        Ok(())
    }
}

#[async_trait]
impl ParticipantClient for PostgresParticipant {
    async fn prepare(&self, tx_id: TransactionId, payload: &Value) -> CoordinatorResult<Vote> {
        let gid = self.gid(&tx_id);

        if self.is_prepared(&gid).await? {
            return Ok(Vote::Yes);
        }

        // Dropping `tx` on any early exit, including a cancelled call, queues
        // a ROLLBACK that the pool runs before the connection is reused. After
        // a successful PREPARE TRANSACTION that rollback is a no-op.
        let mut tx = self.pool.begin().await?;

        let insert = format!(
            "INSERT INTO {table} SELECT * FROM jsonb_populate_record(NULL::{table}, $1)",
            table = self.table
        );

        // A rejected row is a No vote, not an outage
        if let Err(e) = sqlx::query(&insert).bind(Json(payload)).execute(&mut *tx).await {
            warn!("{}: insert for {} rejected: {}", self.name, tx_id, e);
            tx.rollback().await?;
            return Ok(Vote::No);
        }

        sqlx::query(&format!("PREPARE TRANSACTION '{}'", gid))
            .execute(&mut *tx)
            .await?;

        debug!("{}: prepared {}", self.name, gid);
        Ok(Vote::Yes)
    }

    async fn commit(&self, tx_id: TransactionId) -> CoordinatorResult<()> {
        self.finish(tx_id, "COMMIT PREPARED").await
    }

    async fn abort(&self, tx_id: TransactionId) -> CoordinatorResult<()> {
        self.finish(tx_id, "ROLLBACK PREPARED").await
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    /// Fresh table on the server named by `DATABASE_URL`, which must allow
    /// prepared transactions. The pool holds a single connection so every
    /// call reuses the same session. Rows named `slow` take half a second
    /// to insert.
    async fn participant() -> (PostgresParticipant, PgPool, String) {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .unwrap();

        let table = format!("profiles_{}", Uuid::new_v4().simple());
        sqlx::query(&format!(
            "CREATE TABLE {} (id UUID PRIMARY KEY, first_name TEXT NOT NULL)",
            table
        ))
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(&format!(
            "CREATE FUNCTION {table}_slow() RETURNS trigger AS $$
             BEGIN
                 IF NEW.first_name = 'slow' THEN PERFORM pg_sleep(0.5); END IF;
                 RETURN NEW;
             END
             $$ LANGUAGE plpgsql",
            table = table
        ))
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(&format!(
            "CREATE TRIGGER {table}_slow BEFORE INSERT ON {table}
             FOR EACH ROW EXECUTE FUNCTION {table}_slow()",
            table = table
        ))
        .execute(&pool)
        .await
        .unwrap();

        let participant = PostgresParticipant::with_pool("service_b", pool.clone(), &table);
        (participant, pool, table)
    }

    async fn rows_named(pool: &PgPool, table: &str, first_name: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {} WHERE first_name = $1", table))
            .bind(first_name)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    async fn drop_table(pool: &PgPool, table: &str) {
        sqlx::query(&format!("DROP TABLE {}", table))
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(&format!("DROP FUNCTION {}_slow()", table))
            .execute(pool)
            .await
            .unwrap();
    }

    fn row(first_name: Option<&str>) -> Value {
        json!({"id": Uuid::new_v4(), "first_name": first_name})
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL with max_prepared_transactions > 0"]
    async fn test_prepare_and_commit_are_idempotent() {
        let (participant, pool, table) = participant().await;
        let tx = TransactionId::new();
        let payload = row(Some("Ada"));

        assert_eq!(participant.prepare(tx, &payload).await.unwrap(), Vote::Yes);
        assert_eq!(participant.prepare(tx, &payload).await.unwrap(), Vote::Yes);
        assert_eq!(rows_named(&pool, &table, "Ada").await, 0);

        participant.commit(tx).await.unwrap();
        participant.commit(tx).await.unwrap();
        assert_eq!(rows_named(&pool, &table, "Ada").await, 1);
        assert!(!participant.is_prepared(&participant.gid(&tx)).await.unwrap());

        drop_table(&pool, &table).await;
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL with max_prepared_transactions > 0"]
    async fn test_abort_discards_row_and_is_idempotent() {
        let (participant, pool, table) = participant().await;
        let tx = TransactionId::new();

        assert_eq!(participant.prepare(tx, &row(Some("Grace"))).await.unwrap(), Vote::Yes);
        participant.abort(tx).await.unwrap();
        participant.abort(tx).await.unwrap();
        assert_eq!(rows_named(&pool, &table, "Grace").await, 0);

        // Abort of a transaction never prepared here is already resolved
        participant.abort(TransactionId::new()).await.unwrap();

        drop_table(&pool, &table).await;
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL with max_prepared_transactions > 0"]
    async fn test_not_null_violation_votes_no_and_leaves_session_clean() {
        let (participant, pool, table) = participant().await;
        let rejected = TransactionId::new();

        assert_eq!(participant.prepare(rejected, &row(None)).await.unwrap(), Vote::No);
        assert!(!participant.is_prepared(&participant.gid(&rejected)).await.unwrap());

        let next = TransactionId::new();
        assert_eq!(participant.prepare(next, &row(Some("fsdfdf"))).await.unwrap(), Vote::Yes);
        participant.commit(next).await.unwrap();
        assert_eq!(rows_named(&pool, &table, "fsdfdf").await, 1);

        drop_table(&pool, &table).await;
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL with max_prepared_transactions > 0"]
    async fn test_cancelled_prepare_does_not_ride_along_with_next_commit() {
        let (participant, pool, table) = participant().await;
        let cancelled = TransactionId::new();

        let result = tokio::time::timeout(
            Duration::from_millis(100),
            participant.prepare(cancelled, &row(Some("slow"))),
        )
        .await;
        assert!(result.is_err());

        let next = TransactionId::new();
        assert_eq!(participant.prepare(next, &row(Some("Ada"))).await.unwrap(), Vote::Yes);
        participant.commit(next).await.unwrap();

        assert_eq!(rows_named(&pool, &table, "Ada").await, 1);
        assert_eq!(rows_named(&pool, &table, "slow").await, 0);
        assert!(!participant.is_prepared(&participant.gid(&cancelled)).await.unwrap());

        drop_table(&pool, &table).await;
    }
}
