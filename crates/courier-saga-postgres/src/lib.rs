//! PostgreSQL saga repository for Courier.
//!
//! Stores saga instances of any number of state machines in one table, keyed
//! by saga name and correlation id, with the saga data as JSONB.
//!
//! # Features
//!
//! - Optimistic concurrency on a `version` column
//! - Insert races between nodes surface as `SagaConcurrencyConflict`
//! - Maintenance queries for stale instances
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE saga_instances (
//!     saga_name TEXT NOT NULL,
//!     correlation_id UUID NOT NULL,
//!     current_state TEXT NOT NULL,
//!     data JSONB NOT NULL,
//!     version BIGINT NOT NULL,
//!
//!     -- Timestamps
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     modified_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!
//!     PRIMARY KEY (saga_name, correlation_id)
//! );
//!
//! CREATE INDEX idx_saga_instances_state ON saga_instances (saga_name, current_state);
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use courier_saga_postgres::PgSagaRepository;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/orders").await?;
//! let repository = PgSagaRepository::<OrderState>::new(pool, "OrderSaga");
//! repository.ensure_schema().await?;
//!
//! let bus = BusBuilder::new()
//!     .add_saga(Arc::new(order_saga()), Arc::new(repository))
//!     .build()?;
//! ```

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::saga::{SagaData, SagaInstance, SagaRepository};
use courier_core::{BusError, BusResult, CorrelationId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS saga_instances (
    saga_name TEXT NOT NULL,
    correlation_id UUID NOT NULL,
    current_state TEXT NOT NULL,
    data JSONB NOT NULL,
    version BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    modified_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (saga_name, correlation_id)
)
"#;

const STATE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_saga_instances_state
    ON saga_instances (saga_name, current_state)
"#;

/// PostgreSQL saga repository for saga data `D`.
pub struct PgSagaRepository<D> {
    pool: PgPool,
    saga_name: String,
    _data: PhantomData<fn() -> D>,
}

impl<D> Clone for PgSagaRepository<D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            saga_name: self.saga_name.clone(),
            _data: PhantomData,
        }
    }
}

impl<D: SagaData> PgSagaRepository<D> {
    /// # Arguments
    ///
    /// * `pool` - PostgreSQL connection pool
    /// * `saga_name` - Partition key; use the state machine's name
    pub fn new(pool: PgPool, saga_name: impl Into<String>) -> Self {
        Self {
            pool,
            saga_name: saga_name.into(),
            _data: PhantomData,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn saga_name(&self) -> &str {
        &self.saga_name
    }

    /// Create the `saga_instances` table and index if they are missing.
    pub async fn ensure_schema(&self) -> BusResult<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        sqlx::query(STATE_INDEX)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn stored_version(&self, correlation_id: CorrelationId) -> BusResult<u64> {
        let row = sqlx::query(
            r#"
            SELECT version
            FROM saga_instances
            WHERE saga_name = $1 AND correlation_id = $2
            "#,
        )
        .bind(&self.saga_name)
        .bind(correlation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(row.map(|row| to_version(row.get("version"))).unwrap_or(0))
    }

    fn decode(&self, row: PgRow) -> BusResult<SagaInstance<D>> {
        let data: serde_json::Value = row.get("data");
        let data = serde_json::from_value(data).map_err(|e| BusError::Deserialization {
            message_type: self.saga_name.clone(),
            reason: e.to_string(),
        })?;
        Ok(SagaInstance {
            correlation_id: CorrelationId::from_uuid(row.get("correlation_id")),
            current_state: row.get("current_state"),
            created_at: row.get("created_at"),
            modified_at: row.get("modified_at"),
            version: to_version(row.get("version")),
            data,
        })
    }
}

#[async_trait]
impl<D: SagaData> SagaRepository<D> for PgSagaRepository<D> {
    async fn load(&self, correlation_id: CorrelationId) -> BusResult<Option<SagaInstance<D>>> {
        let row = sqlx::query(
            r#"
            SELECT correlation_id, current_state, data, version, created_at, modified_at
            FROM saga_instances
            WHERE saga_name = $1 AND correlation_id = $2
            "#,
        )
        .bind(&self.saga_name)
        .bind(correlation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.map(|row| self.decode(row)).transpose()
    }

    /// Insert a new instance or update the stored one at the same version.
    ///
    /// Zero affected rows means another node got there first; the conflict
    /// reports the version now stored.
    async fn save(&self, instance: &mut SagaInstance<D>) -> BusResult<()> {
        let data = serde_json::to_value(&instance.data).map_err(|e| BusError::Serialization {
            reason: e.to_string(),
        })?;
        let modified_at = Utc::now();
        let next_version = instance.version + 1;

        let result = if instance.is_new() {
            sqlx::query(
                r#"
                INSERT INTO saga_instances
                    (saga_name, correlation_id, current_state, data, version, created_at, modified_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (saga_name, correlation_id) DO NOTHING
                "#,
            )
            .bind(&self.saga_name)
            .bind(instance.correlation_id.as_uuid())
            .bind(&instance.current_state)
            .bind(&data)
            .bind(to_column(next_version))
            .bind(instance.created_at)
            .bind(modified_at)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE saga_instances
                SET current_state = $3,
                    data = $4,
                    version = $5,
                    modified_at = $6
                WHERE saga_name = $1
                  AND correlation_id = $2
                  AND version = $7
                "#,
            )
            .bind(&self.saga_name)
            .bind(instance.correlation_id.as_uuid())
            .bind(&instance.current_state)
            .bind(&data)
            .bind(to_column(next_version))
            .bind(modified_at)
            .bind(to_column(instance.version))
            .execute(&self.pool)
            .await
        }
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            let actual = self.stored_version(instance.correlation_id).await?;
            return Err(BusError::SagaConcurrencyConflict {
                correlation_id: instance.correlation_id,
                expected: instance.version,
                actual,
            });
        }

        debug!(
            saga = %self.saga_name,
            correlation_id = %instance.correlation_id,
            version = next_version,
            "Saved saga instance"
        );
        instance.version = next_version;
        instance.modified_at = modified_at;
        Ok(())
    }

    async fn delete(&self, correlation_id: CorrelationId) -> BusResult<()> {
        sqlx::query(
            r#"
            DELETE FROM saga_instances
            WHERE saga_name = $1 AND correlation_id = $2
            "#,
        )
        .bind(&self.saga_name)
        .bind(correlation_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }
}

/// Maintenance queries.
impl<D: SagaData> PgSagaRepository<D> {
    /// Instances per current state.
    pub async fn state_counts(&self) -> BusResult<Vec<(String, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT current_state, COUNT(*) AS instances
            FROM saga_instances
            WHERE saga_name = $1
            GROUP BY current_state
            ORDER BY current_state
            "#,
        )
        .bind(&self.saga_name)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("current_state"), row.get("instances")))
            .collect())
    }

    /// Remove instances untouched since `older_than`.
    ///
    /// For sagas abandoned before reaching their final state.
    pub async fn delete_stale(&self, older_than: DateTime<Utc>) -> BusResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM saga_instances
            WHERE saga_name = $1
              AND modified_at < $2
            "#,
        )
        .bind(&self.saga_name)
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(result.rows_affected())
    }
}

fn to_column(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn to_version(column: i64) -> u64 {
    u64::try_from(column).unwrap_or(0)
}

/// Map sqlx failures onto bus errors; pool and I/O trouble is a connection failure.
fn storage_error(error: sqlx::Error) -> BusError {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => BusError::ConnectionFailed {
            address: "postgres".to_string(),
            reason: error.to_string(),
        },
        other => BusError::transport(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_connection_failures() {
        let error = storage_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(error, BusError::ConnectionFailed { .. }));
        assert_eq!(error.code(), "courier.connection_failed");
    }

    #[test]
    fn test_query_errors_are_transport_errors() {
        let error = storage_error(sqlx::Error::RowNotFound);
        assert!(matches!(error, BusError::Transport { .. }));
    }

    #[test]
    fn test_versions_round_trip_through_bigint() {
        assert_eq!(to_version(to_column(42)), 42);
        assert_eq!(to_column(u64::MAX), i64::MAX);
        assert_eq!(to_version(-1), 0);
    }
}
