//! Reflection records.
//!
//! One reflection per source memory: a short self-assessment scored by the
//! validator's alignment check. Rows are append-only and feed distillation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::memory::{MemoryRecord, Outcome};
use crate::policy::{ConstitutionalValidator, ValidationContext};
use crate::utils::{RetryPolicy, from_millis, now_utc, to_millis};
use crate::{MemoryError, MemoryResult};

/// Tags that describe the reflection machinery rather than a topic
const NON_TOPIC_TAGS: [&str; 3] = ["reflection", "self-assessment", "alignment"];

/// Topic used when a memory carries no usable tag
pub const DEFAULT_TOPIC: &str = "general";

/// Alignment score at or above which a reflection counts as a success
const SUCCESS_SCORE: f32 = 0.7;

const COLUMNS: &str = "id, owner_id, source_memory_id, self_assessment_text, alignment_score, \
     aligned, topic_key, outcome, created_at";

/// Post-hoc self-assessment of one memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionRecord {
    pub id: String,
    pub owner_id: String,
    pub source_memory_id: String,
    pub self_assessment_text: String,
    pub alignment_score: f32,
    pub aligned: bool,
    pub topic_key: String,
    pub outcome: Outcome,
    pub created_at: DateTime<Utc>,
}

impl ReflectionRecord {
    /// The "how to improve" answer, if the assessment has one
    pub fn improvement(&self) -> Option<&str> {
        self.self_assessment_text
            .lines()
            .find_map(|line| line.trim().strip_prefix("A3:"))
            .map(str::trim)
            .filter(|answer| !answer.is_empty())
    }
}

/// Topic key for a memory: first tag that is not reflection bookkeeping
pub fn topic_key(record: &MemoryRecord) -> String {
    record
        .tags
        .iter()
        .map(|tag| tag.trim().to_lowercase())
        .find(|tag| !tag.is_empty() && !NON_TOPIC_TAGS.contains(&tag.as_str()))
        .unwrap_or_else(|| DEFAULT_TOPIC.to_string())
}

/// Three-question self-assessment for a memory
pub fn build_self_assessment(record: &MemoryRecord, topic: &str) -> String {
    let attempted: String = record.text.chars().take(160).collect();

    let aligned = if record.constitutional_valid {
        "Yes, the content respected every principle"
    } else {
        "No, the content was flagged by constitutional validation"
    };

    let improve = match (record.constitutional_valid, record.outcome) {
        (false, _) => format!("Rephrase guidance on {} so it respects the violated principles", topic),
        (true, Outcome::Success) => format!("Keep applying this approach to {}", topic),
        (true, Outcome::Failure) => format!("Revisit the approach to {} before relying on it again", topic),
        (true, Outcome::Neutral) => format!("Gather more feedback on {}", topic),
    };

    format!(
        "Q1: What was attempted?\nA1: {} ({})\nQ2: Was it aligned with the constitution?\nA2: {}\nQ3: How can it be improved?\nA3: {}",
        attempted, record.kind, aligned, improve
    )
}

/// Persistence for reflection records
#[derive(Clone)]
pub struct ReflectionStore {
    db: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl ReflectionStore {
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

    /// Insert unless the source memory already has a reflection
    pub async fn insert(&self, reflection: &ReflectionRecord) -> MemoryResult<bool> {
        self.with_conn("reflection.insert", |conn| {
            let rows = conn.execute(
                &format!("INSERT OR IGNORE INTO reflections ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    &reflection.id,
                    &reflection.owner_id,
                    &reflection.source_memory_id,
                    &reflection.self_assessment_text,
                    reflection.alignment_score as f64,
                    reflection.aligned,
                    &reflection.topic_key,
                    reflection.outcome.as_str(),
                    to_millis(reflection.created_at),
                ],
            )?;
            Ok(rows == 1)
        })
        .await
    }

    pub async fn get_by_source(&self, source_memory_id: &str) -> MemoryResult<Option<ReflectionRecord>> {
        self.with_conn("reflection.get", |conn| {
            let reflection = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM reflections WHERE source_memory_id = ?1"),
                    params![source_memory_id],
                    row_to_reflection,
                )
                .optional()?;
            Ok(reflection)
        })
        .await
    }

    /// Reflections created in `[from, to)`, oldest first; `None` spans all owners
    pub async fn list_window(
        &self,
        owner_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> MemoryResult<Vec<ReflectionRecord>> {
        let (from, to) = (to_millis(from), to_millis(to));
        self.with_conn("reflection.list_window", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM reflections
                 WHERE created_at >= ?1 AND created_at < ?2 AND (?3 IS NULL OR owner_id = ?3)
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map(params![from, to, owner_id], row_to_reflection)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

fn row_to_reflection(row: &Row) -> rusqlite::Result<ReflectionRecord> {
    let outcome: String = row.get(7)?;
    Ok(ReflectionRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        source_memory_id: row.get(2)?,
        self_assessment_text: row.get(3)?,
        alignment_score: row.get::<_, f64>(4)? as f32,
        aligned: row.get(5)?,
        topic_key: row.get(6)?,
        outcome: Outcome::from_str(&outcome).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(7, Type::Text, format!("unknown outcome: {}", outcome).into())
        })?,
        created_at: from_millis(row.get(8)?),
    })
}

/// The `reflection_task(memory_id)` contract, minus record lookup
pub struct ReflectionTask {
    store: ReflectionStore,
    validator: Arc<dyn ConstitutionalValidator>,
    timeout: Duration,
}

impl ReflectionTask {
    pub fn new(store: ReflectionStore, validator: Arc<dyn ConstitutionalValidator>, timeout: Duration) -> Self {
        Self {
            store,
            validator,
            timeout,
        }
    }

    /// Reflect on `record` once. Redelivery returns the stored reflection.
    pub async fn run(&self, record: &MemoryRecord) -> MemoryResult<ReflectionRecord> {
        if let Some(existing) = self.store.get_by_source(&record.id).await? {
            tracing::debug!(memory_id = %record.id, "reflection already recorded");
            return Ok(existing);
        }

        let topic = topic_key(record);
        let assessment = build_self_assessment(record, &topic);
        let context = ValidationContext::for_actor(&record.owner_id).with_memory(&record.id);

        let alignment = match tokio::time::timeout(
            self.timeout,
            self.validator.validate_alignment(&record.text, &assessment, &context),
        )
        .await
        {
            Ok(Ok(alignment)) => alignment,
            Ok(Err(e @ MemoryError::ValidationUnavailable { .. })) => return Err(e),
            Ok(Err(e)) => return Err(MemoryError::validation_unavailable(e.to_string())),
            Err(_) => return Err(MemoryError::validation_unavailable("alignment check timed out")),
        };

        let reflection = ReflectionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: record.owner_id.clone(),
            source_memory_id: record.id.clone(),
            self_assessment_text: assessment,
            alignment_score: alignment.score.clamp(0.0, 1.0),
            aligned: alignment.aligned,
            topic_key: topic,
            outcome: if alignment.aligned && alignment.score >= SUCCESS_SCORE {
                Outcome::Success
            } else {
                Outcome::Neutral
            },
            created_at: from_millis(to_millis(now_utc())),
        };

        if !self.store.insert(&reflection).await? {
            // Lost a race with a redelivered task
            return self
                .store
                .get_by_source(&record.id)
                .await?
                .ok_or_else(|| MemoryError::not_found("ReflectionRecord", &record.id));
        }

        tracing::debug!(
            memory_id = %record.id,
            topic = %reflection.topic_key,
            score = reflection.alignment_score,
            aligned = reflection.aligned,
            "reflection recorded"
        );
        Ok(reflection)
    }
}
