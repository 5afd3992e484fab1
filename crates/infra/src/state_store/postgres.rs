//! Postgres-backed stream processor state repository.
//!
//! One row per processor key, holding the state as a JSONB document:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS stream_processor_states (
//!     key        TEXT PRIMARY KEY,
//!     state      JSONB NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```
//!
//! ## Error Mapping
//!
//! | SQLx Error | RepositoryError |
//! |------------|-----------------|
//! | Database, Io, PoolTimedOut, PoolClosed, other | `Unavailable` |
//! | ColumnDecode / Decode | `Serialization` |
//!
//! Loaded documents are validated; inconsistent ones fail with `InvalidState`.

use std::sync::Arc;

use anyhow::Context;
use sqlx::{PgPool, Row};
use tracing::instrument;

use streamline_core::ProcessorKey;
use streamline_events::StreamProcessorState;

use super::r#trait::{decode_state, encode_state, RepositoryError, StreamProcessorStateRepository};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stream_processor_states (
    key        TEXT PRIMARY KEY,
    state      JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

#[derive(Debug, Clone)]
pub struct PostgresStateRepository {
    pool: Arc<PgPool>,
}

impl PostgresStateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `database_url` and make sure the state table exists.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("failed to create Postgres pool for stream processor states")?;
        let repository = Self::new(pool);
        repository
            .ensure_schema()
            .await
            .context("failed to create stream_processor_states table")?;
        Ok(repository)
    }

    /// Create the state table if it does not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        sqlx::query(CREATE_TABLE)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", "-", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StreamProcessorStateRepository for PostgresStateRepository {
    #[instrument(skip(self), fields(key = %key), err)]
    async fn try_get(&self, key: &ProcessorKey) -> Result<Option<StreamProcessorState>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT state
            FROM stream_processor_states
            WHERE key = $1
            "#,
        )
        .bind(key.storage_key())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_state", &key.storage_key(), e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let document: serde_json::Value = row
            .try_get("state")
            .map_err(|e| map_sqlx_error("decode_state", &key.storage_key(), e))?;
        decode_state(key, document).map(Some)
    }

    #[instrument(skip(self, state), fields(key = %key, position = %state.position()), err)]
    async fn persist(&self, key: &ProcessorKey, state: &StreamProcessorState) -> Result<(), RepositoryError> {
        let document = encode_state(key, state)?;

        sqlx::query(
            r#"
            INSERT INTO stream_processor_states (key, state)
            VALUES ($1, $2)
            ON CONFLICT (key)
            DO UPDATE SET
                state = EXCLUDED.state,
                updated_at = NOW()
            "#,
        )
        .bind(key.storage_key())
        .bind(document)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("persist_state", &key.storage_key(), e))?;

        Ok(())
    }
}

/// Map SQLx errors to RepositoryError.
fn map_sqlx_error(operation: &str, key: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => RepositoryError::Serialization {
            key: key.to_string(),
            reason: format!("{operation}: {err}"),
        },
        sqlx::Error::PoolClosed => {
            RepositoryError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Database(db_err) => RepositoryError::Unavailable(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        other => RepositoryError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}
