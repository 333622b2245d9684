//! Distilled knowledge and run checkpoints.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::utils::{RetryPolicy, from_millis, hash_parts, to_millis};
use crate::MemoryResult;

const COLUMNS: &str = "id, owner_id, topic_key, aggregate_score, principle, source_reflection_ids_json, \
     source_hash, created_at";

/// Aggregate of one owner's reflections on one topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistilledKnowledge {
    pub id: String,
    pub owner_id: String,
    pub topic_key: String,
    pub aggregate_score: f32,
    /// Summary of the "how to improve" answers
    pub principle: String,
    pub source_reflection_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl DistilledKnowledge {
    /// Identity of the source set; re-running over the same reflections yields the same hash
    pub fn source_hash(&self) -> String {
        let ids: Vec<&str> = self.source_reflection_ids.iter().map(String::as_str).collect();
        hash_parts(&ids)
    }
}

/// Last successful run for an owner scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub scope: String,
    pub window_end: DateTime<Utc>,
    pub run_id: String,
    pub completed_at: DateTime<Utc>,
}

/// Persistence for distilled rows and checkpoints
#[derive(Clone)]
pub struct KnowledgeStore {
    db: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl KnowledgeStore {
    pub fn new(db: Arc<Mutex<Connection>>, retry: RetryPolicy) -> Self {
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

    /// Insert unless the same sources were already distilled.
    ///
    /// Returns the stored row and whether this call created it.
    pub async fn insert(&self, knowledge: &DistilledKnowledge) -> MemoryResult<(DistilledKnowledge, bool)> {
        let ids_json = serde_json::to_string(&knowledge.source_reflection_ids)?;
        let source_hash = knowledge.source_hash();

        self.with_conn("distilled.insert", |conn| {
            let rows = conn.execute(
                &format!("INSERT OR IGNORE INTO distilled_knowledge ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    &knowledge.id,
                    &knowledge.owner_id,
                    &knowledge.topic_key,
                    knowledge.aggregate_score as f64,
                    &knowledge.principle,
                    &ids_json,
                    &source_hash,
                    to_millis(knowledge.created_at),
                ],
            )?;
            let stored = conn.query_row(
                &format!(
                    "SELECT {COLUMNS} FROM distilled_knowledge
                     WHERE owner_id = ?1 AND topic_key = ?2 AND source_hash = ?3"
                ),
                params![&knowledge.owner_id, &knowledge.topic_key, &source_hash],
                row_to_knowledge,
            )?;
            Ok((stored, rows == 1))
        })
        .await
    }

    /// An owner's distilled knowledge, newest first
    pub async fn list(&self, owner_id: &str) -> MemoryResult<Vec<DistilledKnowledge>> {
        self.with_conn("distilled.list", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM distilled_knowledge WHERE owner_id = ?1 ORDER BY created_at DESC, id ASC"
            ))?;
            let rows = stmt.query_map(params![owner_id], row_to_knowledge)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn checkpoint(&self, scope: &str) -> MemoryResult<Option<Checkpoint>> {
        self.with_conn("checkpoint.get", |conn| {
            let checkpoint = conn
                .query_row(
                    "SELECT scope, window_end, run_id, completed_at FROM distillation_checkpoints WHERE scope = ?1",
                    params![scope],
                    |row| {
                        Ok(Checkpoint {
                            scope: row.get(0)?,
                            window_end: from_millis(row.get(1)?),
                            run_id: row.get(2)?,
                            completed_at: from_millis(row.get(3)?),
                        })
                    },
                )
                .optional()?;
            Ok(checkpoint)
        })
        .await
    }

    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> MemoryResult<()> {
        self.with_conn("checkpoint.save", |conn| {
            conn.execute(
                "INSERT INTO distillation_checkpoints (scope, window_end, run_id, completed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(scope) DO UPDATE SET
                     window_end = excluded.window_end,
                     run_id = excluded.run_id,
                     completed_at = excluded.completed_at",
                params![
                    &checkpoint.scope,
                    to_millis(checkpoint.window_end),
                    &checkpoint.run_id,
                    to_millis(checkpoint.completed_at),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

fn row_to_knowledge(row: &Row) -> rusqlite::Result<DistilledKnowledge> {
    let ids_json: String = row.get(5)?;
    let source_reflection_ids = serde_json::from_str(&ids_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(DistilledKnowledge {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        topic_key: row.get(2)?,
        aggregate_score: row.get::<_, f64>(3)? as f32,
        principle: row.get(4)?,
        source_reflection_ids,
        created_at: from_millis(row.get(7)?),
    })
}
