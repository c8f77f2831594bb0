use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use std::collections::HashSet;
use tracing::{debug, instrument, warn};

use super::models::*;
use super::store::LedgerStore;
use crate::error::{AppError, AppResult, LedgerError};

const WORKER_COLUMNS: &str = r#"
    eth_address, node_type, region, source_id, is_connected,
    pending_fees, paid_fees, connection, last_updated
"#;

/// Ledger repository - THE source of truth for worker fees, backed by PostgreSQL.
///
/// Every fee mutation is a single row-level statement, so concurrent credits and
/// payouts for the same worker serialize on the row and never on each other's reads.
#[derive(Debug)]
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ========== ROW OPERATIONS (shared by single calls and batches) ==========

    async fn upsert_connection_on(
        conn: &mut PgConnection,
        key: &WorkerKey,
        connected: bool,
        connection: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO remote_workers (eth_address, node_type, region, source_id, is_connected, connection)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (eth_address, node_type, region, source_id)
            DO UPDATE SET
                is_connected = EXCLUDED.is_connected,
                connection = EXCLUDED.connection,
                last_updated = NOW()
            "#,
        )
        .bind(&key.eth_address)
        .bind(&key.node_type)
        .bind(&key.region)
        .bind(&key.source_id)
        .bind(connected)
        .bind(connection)
        .execute(conn)
        .await?;

        Ok(())
    }

    async fn disconnect_all_on(conn: &mut PgConnection, source_id: &str) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE remote_workers
            SET is_connected = FALSE, connection = '', last_updated = NOW()
            WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .execute(conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Credits that would push `pending_fees` past BIGINT are refused with
    /// `Overflow` instead of failing the statement.
    async fn add_pending_on(conn: &mut PgConnection, key: &WorkerKey, amount: i64) -> AppResult<()> {
        if amount < 0 {
            return Err(LedgerError::NegativeAmount(amount).into());
        }

        let result = sqlx::query(
            r#"
            INSERT INTO remote_workers (eth_address, node_type, region, source_id, is_connected, pending_fees)
            VALUES ($1, $2, $3, $4, FALSE, $5)
            ON CONFLICT (eth_address, node_type, region, source_id)
            DO UPDATE SET
                pending_fees = remote_workers.pending_fees + EXCLUDED.pending_fees,
                last_updated = NOW()
            WHERE remote_workers.pending_fees <= 9223372036854775807 - EXCLUDED.pending_fees
            "#,
        )
        .bind(&key.eth_address)
        .bind(&key.node_type)
        .bind(&key.region)
        .bind(&key.source_id)
        .bind(amount)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::Overflow { key: key.clone() }.into());
        }
        Ok(())
    }

    /// Returns false when the event id is already logged for the source.
    async fn append_event_on(conn: &mut PgConnection, entry: &EventLogEntry) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO event_logs (source_id, event_id, event_type, payload, outcome, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source_id, event_id) DO NOTHING
            "#,
        )
        .bind(&entry.source_id)
        .bind(entry.event_id)
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .bind(entry.outcome.as_str())
        .bind(entry.created_at)
        .execute(conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn current_pending(conn: &mut PgConnection, key: &WorkerKey) -> AppResult<Option<i64>> {
        let pending = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT pending_fees FROM remote_workers
            WHERE eth_address = $1 AND node_type = $2 AND region = $3 AND source_id = $4
            "#,
        )
        .bind(&key.eth_address)
        .bind(&key.node_type)
        .bind(&key.region)
        .bind(&key.source_id)
        .fetch_optional(conn)
        .await?;

        Ok(pending)
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    async fn upsert_connection(
        &self,
        key: &WorkerKey,
        connected: bool,
        connection: &str,
    ) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::upsert_connection_on(&mut conn, key, connected, connection).await
    }

    async fn disconnect_all(&self, source_id: &str) -> AppResult<u64> {
        let mut conn = self.pool.acquire().await?;
        Self::disconnect_all_on(&mut conn, source_id).await
    }

    async fn add_pending(&self, key: &WorkerKey, amount: i64) -> AppResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::add_pending_on(&mut conn, key, amount).await
    }

    #[instrument(skip(self), fields(worker = %key))]
    async fn transfer_pending_to_paid(
        &self,
        key: &WorkerKey,
        amount: i64,
        tx_hash: &str,
    ) -> AppResult<PayoutRecord> {
        if amount < 0 {
            return Err(LedgerError::NegativeAmount(amount).into());
        }

        let mut tx = self.pool.begin().await?;

        // Guarded decrement: the WHERE clause is the insufficient-balance check.
        let result = sqlx::query(
            r#"
            UPDATE remote_workers
            SET pending_fees = pending_fees - $5,
                paid_fees = paid_fees + $5,
                last_updated = NOW()
            WHERE eth_address = $1 AND node_type = $2 AND region = $3 AND source_id = $4
              AND pending_fees >= $5
            "#,
        )
        .bind(&key.eth_address)
        .bind(&key.node_type)
        .bind(&key.region)
        .bind(&key.source_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let available = Self::current_pending(&mut tx, key).await?;
            tx.rollback().await?;
            return Err(match available {
                None => LedgerError::NotFound { key: key.clone() },
                Some(available) => LedgerError::InsufficientPending {
                    key: key.clone(),
                    requested: amount,
                    available,
                },
            }
            .into());
        }

        let record = sqlx::query_as::<_, PayoutRecord>(
            r#"
            INSERT INTO pool_payouts (eth_address, tx_hash, amount, region, node_type, source_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, eth_address, tx_hash, amount, region, node_type, source_id, created_at
            "#,
        )
        .bind(&key.eth_address)
        .bind(tx_hash)
        .bind(amount)
        .bind(&key.region)
        .bind(&key.node_type)
        .bind(&key.source_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn list_all(&self) -> AppResult<Vec<WorkerLedgerEntry>> {
        let workers = sqlx::query_as::<_, WorkerLedgerEntry>(&format!(
            "SELECT {} FROM remote_workers ORDER BY eth_address, node_type, source_id",
            WORKER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(workers)
    }

    async fn list_connected(&self) -> AppResult<Vec<WorkerLedgerEntry>> {
        let workers = sqlx::query_as::<_, WorkerLedgerEntry>(&format!(
            "SELECT {} FROM remote_workers WHERE is_connected ORDER BY eth_address, node_type, source_id",
            WORKER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(workers)
    }

    async fn totals(&self) -> AppResult<LedgerTotals> {
        let (pending, paid) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT
                COALESCE(SUM(pending_fees), 0)::BIGINT,
                COALESCE(SUM(paid_fees), 0)::BIGINT
            FROM remote_workers
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerTotals { pending, paid })
    }

    async fn list_payouts(&self) -> AppResult<Vec<PayoutRecord>> {
        let payouts = sqlx::query_as::<_, PayoutRecord>(
            r#"
            SELECT id, eth_address, tx_hash, amount, region, node_type, source_id, created_at
            FROM pool_payouts
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(payouts)
    }

    async fn high_water_mark(&self, source_id: &str) -> AppResult<Option<DateTime<Utc>>> {
        let mark = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(created_at) FROM event_logs WHERE source_id = $1",
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(mark)
    }

    async fn logged_event_ids(
        &self,
        source_id: &str,
        event_ids: &[i64],
    ) -> AppResult<HashSet<i64>> {
        if event_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let known = sqlx::query_scalar::<_, i64>(
            "SELECT event_id FROM event_logs WHERE source_id = $1 AND event_id = ANY($2)",
        )
        .bind(source_id)
        .bind(event_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(known.into_iter().collect())
    }

    #[instrument(skip(self, batch), fields(source_id = %batch.source_id, mutations = batch.mutations.len(), events = batch.events.len()))]
    async fn commit_batch(&self, batch: LedgerBatch) -> AppResult<BatchReceipt> {
        let mut tx = self.pool.begin().await?;

        // Log first: the unique (source_id, event_id) index blocks a concurrent
        // batch carrying the same events until this one commits or rolls back.
        for entry in &batch.events {
            if !Self::append_event_on(&mut tx, entry).await? {
                tx.rollback().await?;
                return Err(LedgerError::DuplicateEvent {
                    source_id: batch.source_id.clone(),
                    event_id: entry.event_id,
                }
                .into());
            }
        }

        let mut rejected = Vec::new();
        for mutation in &batch.mutations {
            match mutation {
                LedgerMutation::UpsertConnection {
                    key,
                    connected,
                    connection,
                } => Self::upsert_connection_on(&mut tx, key, *connected, connection).await?,
                LedgerMutation::DisconnectAll { source_id } => {
                    Self::disconnect_all_on(&mut tx, source_id).await?;
                }
                LedgerMutation::AddPending {
                    key,
                    amount,
                    event_id,
                } => match Self::add_pending_on(&mut tx, key, *amount).await {
                    Ok(()) => {}
                    Err(AppError::Ledger(e @ LedgerError::Overflow { .. })) => {
                        warn!("Credit for event {} refused: {}", event_id, e);
                        rejected.push(*event_id);
                    }
                    Err(e) => return Err(e),
                },
            }
        }

        if !rejected.is_empty() {
            sqlx::query(
                r#"
                UPDATE event_logs SET outcome = $3
                WHERE source_id = $1 AND event_id = ANY($2)
                "#,
            )
            .bind(&batch.source_id)
            .bind(&rejected)
            .bind(EventOutcome::Rejected.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Committed ledger batch");
        Ok(BatchReceipt {
            rejected_events: rejected,
        })
    }
}
