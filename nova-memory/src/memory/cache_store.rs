//! SQLite rows behind the tiered cache.
//!
//! Every STM/ITM mutation is written through here so a new process sees the
//! same short-lived tiers. Counters only move forward: concurrent touches may
//! land out of order, so access counts and expiries are merged with `MAX`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;

use super::store::{COLUMNS, embedding_to_blob, row_to_record};
use super::types::MemoryRecord;
use crate::utils::{RetryPolicy, to_millis};
use crate::{MemoryError, MemoryResult};

/// A persisted cache row and its insertion sequence
pub(crate) type CachedRow = (MemoryRecord, u64);

#[derive(Clone)]
pub(crate) struct CacheStore {
    db: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl CacheStore {
    pub(crate) fn new(db: Arc<Mutex<Connection>>, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    async fn with_conn<T, F>(&self, operation: &str, f: F) -> MemoryResult<T>
    where
        F: Fn(&Connection) -> MemoryResult<T> + Send + Sync,
        T: Send,
    {
        let db = &self.db;
        let f = &f;
        self.retry
            .run(operation, move || async move {
                let conn = db.lock().await;
                f(&conn)
            })
            .await
    }

    /// Insert or replace the row for `record`
    pub(crate) async fn upsert(&self, record: &MemoryRecord, seq: u64) -> MemoryResult<()> {
        let expires_at = record
            .expires_at
            .map(to_millis)
            .ok_or_else(|| MemoryError::invalid_operation("cached records need an expiry"))?;
        let tags_json = serde_json::to_string(&record.tags)?;
        let embedding = record.embedding.as_deref().map(embedding_to_blob);

        self.with_conn("cache.upsert", |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO cached_memories ({COLUMNS}, seq) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
                ),
                params![
                    &record.id,
                    &record.owner_id,
                    &record.session_id,
                    record.tier.as_str(),
                    record.kind.as_str(),
                    &record.text,
                    &embedding,
                    &tags_json,
                    record.emotional_weight as f64,
                    record.confidence_score as f64,
                    record.access_count,
                    record.constitutional_valid,
                    record.outcome.as_str(),
                    record.outcome_count,
                    record.success_count,
                    record.size_bytes as i64,
                    to_millis(record.created_at),
                    expires_at,
                    record.deleted_at.map(to_millis),
                    seq as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Persist one counted access
    pub(crate) async fn record_access(
        &self,
        id: &str,
        access_count: u32,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> MemoryResult<()> {
        self.with_conn("cache.record_access", |conn| {
            conn.execute(
                "UPDATE cached_memories
                 SET access_count = MAX(access_count, ?2),
                     expires_at = MAX(expires_at, ?3),
                     last_accessed_at = MAX(COALESCE(last_accessed_at, 0), ?4)
                 WHERE id = ?1",
                params![id, access_count, to_millis(expires_at), to_millis(now)],
            )?;
            Ok(())
        })
        .await
    }

    pub(crate) async fn delete(&self, ids: &[String]) -> MemoryResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.with_conn("cache.delete", |conn| {
            let tx = conn.unchecked_transaction()?;
            for id in ids {
                tx.execute("DELETE FROM cached_memories WHERE id = ?1", params![id])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub(crate) async fn load(&self, id: &str) -> MemoryResult<Option<CachedRow>> {
        self.with_conn("cache.load", |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {COLUMNS}, seq FROM cached_memories WHERE id = ?1"),
                    params![id],
                    row_to_cached,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Every row in insertion order
    pub(crate) async fn load_all(&self) -> MemoryResult<Vec<CachedRow>> {
        self.with_conn("cache.load_all", |conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS}, seq FROM cached_memories ORDER BY seq"))?;
            let rows = stmt.query_map([], row_to_cached)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

fn row_to_cached(row: &rusqlite::Row) -> rusqlite::Result<CachedRow> {
    let record = row_to_record(row)?;
    let seq: i64 = row.get(19)?;
    Ok((record, seq.max(0) as u64))
}
