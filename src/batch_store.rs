use crate::config::DatabaseConfig;
use crate::descriptor::FileDescriptor;
use crate::error::{GateError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Row};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Lifecycle state of one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// Accumulating files, completion not yet claimed
    Waiting,
    /// One tracker claimed the batch and validation is underway
    InProgress,
    /// Validation and relocation finished
    Done,
}

impl BatchState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Done => write!(f, "done"),
        }
    }
}

impl std::str::FromStr for BatchState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid batch state: {s}")),
        }
    }
}

/// Persisted lock record for one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_key: String,
    pub customer: String,
    pub container: String,
    pub state: BatchState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct BatchRow {
    batch_key: String,
    customer: String,
    container: String,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BatchRow> for BatchRecord {
    type Error = GateError;

    fn try_from(row: BatchRow) -> Result<Self> {
        let state = row
            .state
            .parse::<BatchState>()
            .map_err(GateError::StateStore)?;
        Ok(Self {
            batch_key: row.batch_key,
            customer: row.customer,
            container: row.container,
            state,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Keyed record store capability guarding the validate-once property.
///
/// Also holds the per-batch journal of received file types, the durable
/// source the tracker replays after a restart.
#[async_trait]
pub trait BatchStateStore: Send + Sync {
    /// Fetch the record for a batch key, if any
    async fn get(&self, batch_key: &str) -> Result<Option<BatchRecord>>;

    /// Create a `Waiting` record on first notification. Idempotent: an
    /// existing record (any state) is left untouched.
    async fn create_waiting(&self, descriptor: &FileDescriptor) -> Result<()>;

    /// Journal one received file. A repeated file type for the same batch
    /// is a no-op (set semantics).
    async fn record_file(&self, batch_key: &str, file_type: &str, filename: &str) -> Result<()>;

    /// File types journaled so far for a batch
    async fn received_types(&self, batch_key: &str) -> Result<BTreeSet<String>>;

    /// Claim the batch for validation.
    ///
    /// Atomically transitions `Waiting -> InProgress`. Returns `false` when
    /// the record is absent, already claimed, or already done; concurrent
    /// callers racing on the same key see at most one `true`.
    async fn try_begin_validation(&self, batch_key: &str) -> Result<bool>;

    /// Transition the batch to its terminal `Done` state
    async fn mark_done(&self, batch_key: &str) -> Result<()>;
}

/// PostgreSQL-backed batch state store
pub struct PgBatchStore {
    pool: PgPool,
}

impl PgBatchStore {
    /// Connect to PostgreSQL with pool settings from configuration
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    fn store_err(e: sqlx::Error) -> GateError {
        GateError::StateStore(e.to_string())
    }
}

#[async_trait]
impl BatchStateStore for PgBatchStore {
    async fn get(&self, batch_key: &str) -> Result<Option<BatchRecord>> {
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT batch_key, customer, container, state, created_at, updated_at
            FROM batches
            WHERE batch_key = $1
            "#,
        )
        .bind(batch_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::store_err)?;

        row.map(BatchRecord::try_from).transpose()
    }

    #[instrument(skip(self, descriptor), fields(batch_key = %descriptor.batch_prefix))]
    async fn create_waiting(&self, descriptor: &FileDescriptor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO batches (batch_key, customer, container, state)
            VALUES ($1, $2, $3, 'waiting')
            ON CONFLICT (batch_key) DO NOTHING
            "#,
        )
        .bind(&descriptor.batch_prefix)
        .bind(&descriptor.customer_name)
        .bind(&descriptor.container)
        .execute(&self.pool)
        .await
        .map_err(Self::store_err)?;

        Ok(())
    }

    async fn record_file(&self, batch_key: &str, file_type: &str, filename: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO batch_files (batch_key, file_type, filename)
            VALUES ($1, $2, $3)
            ON CONFLICT (batch_key, file_type) DO NOTHING
            "#,
        )
        .bind(batch_key)
        .bind(file_type)
        .bind(filename)
        .execute(&self.pool)
        .await
        .map_err(Self::store_err)?;

        if result.rows_affected() == 0 {
            debug!(
                batch_key = %batch_key,
                file_type = %file_type,
                "Duplicate file type, journal unchanged"
            );
        }

        Ok(())
    }

    async fn received_types(&self, batch_key: &str) -> Result<BTreeSet<String>> {
        let rows = sqlx::query(
            r#"
            SELECT file_type FROM batch_files WHERE batch_key = $1
            "#,
        )
        .bind(batch_key)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::store_err)?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("file_type"))
            .collect())
    }

    #[instrument(skip(self))]
    async fn try_begin_validation(&self, batch_key: &str) -> Result<bool> {
        // The single-winner guard: only a 'waiting' row can move to
        // 'in_progress', and the row count tells us whether we won.
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET state = 'in_progress', updated_at = NOW()
            WHERE batch_key = $1 AND state = 'waiting'
            "#,
        )
        .bind(batch_key)
        .execute(&self.pool)
        .await
        .map_err(Self::store_err)?;

        let claimed = result.rows_affected() == 1;
        if !claimed {
            info!(batch_key = %batch_key, "Validation skipped, batch not in waiting state");
        }
        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn mark_done(&self, batch_key: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE batches
            SET state = 'done', updated_at = NOW()
            WHERE batch_key = $1
            "#,
        )
        .bind(batch_key)
        .execute(&self.pool)
        .await
        .map_err(Self::store_err)?;

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::memory::InMemoryBatchStore;
    use super::*;

    fn descriptor() -> FileDescriptor {
        FileDescriptor {
            container: "acme".to_string(),
            customer_name: "acme".to_string(),
            batch_prefix: "acme-0115".to_string(),
            filename: "acme-0115_type1.csv".to_string(),
            file_type: "type1".to_string(),
        }
    }

    #[test]
    fn test_state_round_trip() {
        for state in [BatchState::Waiting, BatchState::InProgress, BatchState::Done] {
            assert_eq!(state.to_string().parse::<BatchState>().unwrap(), state);
        }
        assert!("bogus".parse::<BatchState>().is_err());
    }

    #[test]
    fn test_only_done_is_terminal() {
        assert!(!BatchState::Waiting.is_terminal());
        assert!(!BatchState::InProgress.is_terminal());
        assert!(BatchState::Done.is_terminal());
    }

    #[tokio::test]
    async fn test_claim_succeeds_once() {
        let store = InMemoryBatchStore::new();
        store.create_waiting(&descriptor()).await.unwrap();

        assert!(store.try_begin_validation("acme-0115").await.unwrap());
        assert!(!store.try_begin_validation("acme-0115").await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_refused_without_record() {
        let store = InMemoryBatchStore::new();
        assert!(!store.try_begin_validation("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_waiting_is_idempotent() {
        let store = InMemoryBatchStore::new();
        store.create_waiting(&descriptor()).await.unwrap();
        assert!(store.try_begin_validation("acme-0115").await.unwrap());

        // a late duplicate create must not reset the claimed state
        store.create_waiting(&descriptor()).await.unwrap();
        let record = store.get("acme-0115").await.unwrap().unwrap();
        assert_eq!(record.state, BatchState::InProgress);
    }

    #[tokio::test]
    async fn test_journal_deduplicates_types() {
        let store = InMemoryBatchStore::new();
        store.create_waiting(&descriptor()).await.unwrap();
        store
            .record_file("acme-0115", "type1", "acme-0115_type1.csv")
            .await
            .unwrap();
        store
            .record_file("acme-0115", "type1", "acme-0115_type1.csv")
            .await
            .unwrap();
        store
            .record_file("acme-0115", "type2", "acme-0115_type2.csv")
            .await
            .unwrap();

        let received = store.received_types("acme-0115").await.unwrap();
        assert_eq!(received.len(), 2);
    }
}
