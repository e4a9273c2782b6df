//! SQL-backed journal using PostgreSQL via sqlx.
//!
//! Tables:
//! - `shardhold_events`: one row per event, keyed by (owner_key, sequence)
//! - `shardhold_snapshots`: latest snapshot per key
//! - `shardhold_heads`: highest sequence per key, row-locked to order appends
//!
//! This module is only available when the `sql` feature is enabled.

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::error::ClusterError;
use crate::journal::{
    sequence_conflict, EventJournal, EventStream, PersistedEvent, SeqNr, SnapshotRecord,
};
use crate::types::OwnerKey;

/// PostgreSQL-backed event journal.
pub struct SqlJournal {
    pool: PgPool,
}

impl SqlJournal {
    /// Create a new SQL journal with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<(), ClusterError> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|e| ClusterError::persistence(format!("migration failed: {e}"), e))
    }
}

fn db_error(reason: &str, e: sqlx::Error) -> ClusterError {
    ClusterError::persistence(format!("{reason}: {e}"), e)
}

#[async_trait]
impl EventJournal for SqlJournal {
    async fn append_batch(
        &self,
        owner_key: &OwnerKey,
        first_sequence: SeqNr,
        events: Vec<Vec<u8>>,
    ) -> Result<(), ClusterError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("failed to begin append", e))?;

        let head: Option<i64> = sqlx::query_scalar(
            "SELECT sequence FROM shardhold_heads WHERE owner_key = $1 FOR UPDATE",
        )
        .bind(owner_key.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("failed to read head", e))?;

        let expected = head.unwrap_or(0) as SeqNr + 1;
        if first_sequence != expected {
            return Err(sequence_conflict(owner_key, expected, first_sequence));
        }

        let last = first_sequence + events.len() as SeqNr - 1;
        for (i, payload) in events.into_iter().enumerate() {
            let result = sqlx::query(
                "INSERT INTO shardhold_events (owner_key, sequence, payload) VALUES ($1, $2, $3)",
            )
            .bind(owner_key.as_str())
            .bind((first_sequence + i as SeqNr) as i64)
            .bind(payload)
            .execute(&mut *tx)
            .await;
            if let Err(e) = result {
                let unique = e
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation());
                if unique {
                    return Err(sequence_conflict(owner_key, expected, first_sequence));
                }
                return Err(db_error("failed to insert event", e));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO shardhold_heads (owner_key, sequence) VALUES ($1, $2)
            ON CONFLICT (owner_key) DO UPDATE SET sequence = EXCLUDED.sequence
            "#,
        )
        .bind(owner_key.as_str())
        .bind(last as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("failed to advance head", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("failed to commit append", e))
    }

    fn read_from<'a>(&'a self, owner_key: &'a OwnerKey, from_sequence: SeqNr) -> EventStream<'a> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, payload FROM shardhold_events
            WHERE owner_key = $1 AND sequence >= $2
            ORDER BY sequence
            "#,
        )
        .bind(owner_key.as_str())
        .bind(from_sequence as i64)
        .fetch(&self.pool);

        Box::pin(rows.map(|row| {
            let row = row.map_err(|e| db_error("failed to read events", e))?;
            let sequence: i64 = row
                .try_get("sequence")
                .map_err(|e| db_error("bad sequence column", e))?;
            let payload: Vec<u8> = row
                .try_get("payload")
                .map_err(|e| db_error("bad payload column", e))?;
            Ok(PersistedEvent {
                sequence: sequence as SeqNr,
                payload,
            })
        }))
    }

    async fn highest_sequence(&self, owner_key: &OwnerKey) -> Result<SeqNr, ClusterError> {
        let head: Option<i64> =
            sqlx::query_scalar("SELECT sequence FROM shardhold_heads WHERE owner_key = $1")
                .bind(owner_key.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_error("failed to read head", e))?;
        Ok(head.unwrap_or(0) as SeqNr)
    }

    async fn save_snapshot(
        &self,
        owner_key: &OwnerKey,
        sequence: SeqNr,
        state: Vec<u8>,
    ) -> Result<(), ClusterError> {
        sqlx::query(
            r#"
            INSERT INTO shardhold_snapshots (owner_key, sequence, state, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (owner_key) DO UPDATE
                SET sequence = EXCLUDED.sequence,
                    state = EXCLUDED.state,
                    updated_at = EXCLUDED.updated_at
                WHERE shardhold_snapshots.sequence <= EXCLUDED.sequence
            "#,
        )
        .bind(owner_key.as_str())
        .bind(sequence as i64)
        .bind(state)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("failed to save snapshot", e))?;
        Ok(())
    }

    async fn load_snapshot(
        &self,
        owner_key: &OwnerKey,
    ) -> Result<Option<SnapshotRecord>, ClusterError> {
        let row = sqlx::query("SELECT sequence, state FROM shardhold_snapshots WHERE owner_key = $1")
            .bind(owner_key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("failed to load snapshot", e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let sequence: i64 = row
            .try_get("sequence")
            .map_err(|e| db_error("bad sequence column", e))?;
        let state: Vec<u8> = row
            .try_get("state")
            .map_err(|e| db_error("bad state column", e))?;
        Ok(Some(SnapshotRecord {
            sequence: sequence as SeqNr,
            state,
        }))
    }

    async fn delete_events_up_to(
        &self,
        owner_key: &OwnerKey,
        up_to: SeqNr,
    ) -> Result<(), ClusterError> {
        sqlx::query("DELETE FROM shardhold_events WHERE owner_key = $1 AND sequence <= $2")
            .bind(owner_key.as_str())
            .bind(up_to as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("failed to delete events", e))?;
        Ok(())
    }
}
