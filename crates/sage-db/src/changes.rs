//! Change repository implementation.

use std::time::Instant;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use sqlx::{Pool, Postgres};
use tracing::{debug, warn};

use sage_core::{ChangeRepository, DocumentChange, Error, PartyChange, Result, TableChange};

use crate::pool::PoolUsage;

/// PostgreSQL implementation of ChangeRepository.
///
/// Rows are written unprocessed (`processed = FALSE`) and flipped by the
/// downstream reconciliation process.
#[derive(Clone)]
pub struct PgChangeRepository {
    pool: Pool<Postgres>,
}

impl PgChangeRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Log a completed write and the pool pressure behind it.
    fn log_write(&self, table: &'static str, id: i64, entity_id: &str, started: Instant) {
        let usage = PoolUsage::of(&self.pool);
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            subsystem = "database",
            db_table = table,
            op = "append",
            id,
            entity_id,
            duration_ms,
            pool_in_use = usage.in_use(),
            pool_max = usage.max,
            "Change stored"
        );
        if usage.is_saturated() {
            warn!(
                subsystem = "database",
                component = "pool",
                db_table = table,
                duration_ms,
                pool_max = usage.max,
                "Store pool saturated, change writes are queueing"
            );
        }
    }
}

#[async_trait]
impl ChangeRepository for PgChangeRepository {
    async fn has_pending_document(
        &self,
        entity_id: &str,
        total_amount: &BigDecimal,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM document_changes
                WHERE num_piece = $1
                  AND processed = FALSE
                  AND total_ht <> $2
            )
            "#,
        )
        .bind(entity_id)
        .bind(total_amount)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(exists)
    }

    async fn party_exists(&self, entity_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM party_changes WHERE num_tiers = $1)",
        )
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(exists)
    }

    async fn append_document(&self, change: &DocumentChange) -> Result<i64> {
        let started = Instant::now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO document_changes
                (num_piece, change_type, updated_date, total_ht, domaine, doc_type)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&change.entity_id)
        .bind(change.operation.as_str())
        .bind(change.occurred_at)
        .bind(&change.total_amount)
        .bind(change.domain)
        .bind(change.subtype)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.log_write("document_changes", id, &change.entity_id, started);
        Ok(id)
    }

    async fn append_party(&self, change: &PartyChange) -> Result<i64> {
        let started = Instant::now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO party_changes (num_tiers, change_type, updated_date, tiers_type)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&change.entity_id)
        .bind(change.operation.as_str())
        .bind(change.occurred_at)
        .bind(change.party_type)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.log_write("party_changes", id, &change.entity_id, started);
        Ok(id)
    }

    async fn append_table(&self, change: &TableChange) -> Result<i64> {
        let started = Instant::now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO table_changes (num_piece, change_type, updated_date, domaine, row_type)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&change.entity_id)
        .bind(change.operation.as_str())
        .bind(change.occurred_at)
        .bind(change.domain)
        .bind(change.subtype)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.log_write("table_changes", id, &change.entity_id, started);
        Ok(id)
    }
}
