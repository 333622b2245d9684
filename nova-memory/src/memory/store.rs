//! Long-Term Memory Store
//!
//! SQLite-backed storage for LTM records. Rows are immutable once written
//! except for access counting, soft deletion and confidence refinement by the
//! distillation job, which is recorded per source so it applies once.

use std::sync::Arc;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tokio::sync::Mutex;

use super::embeddings::cosine_similarity;
use super::types::*;
use crate::utils::{RetryPolicy, from_millis, now_utc, to_millis};
use crate::{MemoryError, MemoryResult};

pub(super) const COLUMNS: &str = "id, owner_id, session_id, tier, kind, text, embedding, tags_json, \
     emotional_weight, confidence_score, access_count, constitutional_valid, outcome, \
     outcome_count, success_count, size_bytes, created_at, expires_at, deleted_at";

/// Store for long-term memory records
#[derive(Clone)]
pub struct LongTermStore {
    db: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl LongTermStore {
    /// Create a new store over an already migrated connection
    pub fn new(db: Arc<Mutex<Connection>>, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    /// Run a statement batch against the connection with bounded retries
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

    /// Insert a record unless a row with the same id already exists.
    ///
    /// Returns `false` when nothing was written, which is how promotion
    /// detects that another caller got there first.
    pub async fn insert(&self, record: &MemoryRecord) -> MemoryResult<bool> {
        let tags_json = serde_json::to_string(&record.tags)?;
        let embedding = record.embedding.as_deref().map(embedding_to_blob);

        let inserted = self
            .with_conn("ltm.insert", |conn| {
                let rows = conn.execute(
                    &format!("INSERT OR IGNORE INTO memories ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"),
                    params![
                        &record.id,
                        &record.owner_id,
                        &record.session_id,
                        MemoryTier::Ltm.as_str(),
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
                        Option::<i64>::None,
                        record.deleted_at.map(to_millis),
                    ],
                )?;
                Ok(rows == 1)
            })
            .await?;

        if inserted {
            tracing::debug!(id = %record.id, owner = %record.owner_id, "ltm record written");
        }
        Ok(inserted)
    }

    /// Fetch a row by id without any owner check
    pub(crate) async fn find(&self, id: &str) -> MemoryResult<Option<MemoryRecord>> {
        self.with_conn("ltm.find", |conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM memories WHERE id = ?1"),
                    params![id],
                    row_to_record,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    /// Get a record owned by `owner_id`
    pub async fn get(&self, owner_id: &str, id: &str, include_deleted: bool) -> MemoryResult<MemoryRecord> {
        let record = self
            .find(id)
            .await?
            .ok_or_else(|| MemoryError::not_found("MemoryRecord", id))?;

        if record.owner_id != owner_id {
            return Err(MemoryError::forbidden(owner_id, id));
        }
        if record.is_deleted() && !include_deleted {
            return Err(MemoryError::not_found("MemoryRecord", id));
        }
        Ok(record)
    }

    /// Count an access and return the updated record
    pub async fn record_access(&self, owner_id: &str, id: &str) -> MemoryResult<MemoryRecord> {
        self.get(owner_id, id, false).await?;
        self.with_conn("ltm.record_access", |conn| {
            conn.execute(
                "UPDATE memories SET access_count = access_count + 1 WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
            )?;
            Ok(())
        })
        .await?;
        self.get(owner_id, id, false).await
    }

    /// List an owner's records, newest first
    pub async fn list(
        &self,
        owner_id: &str,
        kind: Option<MemoryKind>,
        include_deleted: bool,
    ) -> MemoryResult<Vec<MemoryRecord>> {
        self.with_conn("ltm.list", |conn| {
            let mut sql = format!("SELECT {COLUMNS} FROM memories WHERE owner_id = ?1");
            if !include_deleted {
                sql.push_str(" AND deleted_at IS NULL");
            }
            if kind.is_some() {
                sql.push_str(" AND kind = ?2");
            }
            sql.push_str(" ORDER BY created_at DESC, id");

            let mut stmt = conn.prepare(&sql)?;
            let rows = match kind {
                Some(kind) => stmt.query_map(params![owner_id, kind.as_str()], row_to_record)?,
                None => stmt.query_map(params![owner_id], row_to_record)?,
            };
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Similarity search over an owner's live records.
    ///
    /// Records (or queries) without an embedding are scored by keyword
    /// overlap instead of cosine similarity.
    pub async fn search(
        &self,
        query: &SearchQuery,
        query_embedding: Option<&[f32]>,
    ) -> MemoryResult<Vec<ScoredMemory>> {
        if query.tier_filter.is_some_and(|tier| tier != MemoryTier::Ltm) {
            return Ok(Vec::new());
        }

        let candidates = self.list(&query.owner_id, None, false).await?;
        let mut results: Vec<ScoredMemory> = candidates
            .into_iter()
            .filter(|record| query.min_confidence.is_none_or(|min| record.confidence_score >= min))
            .filter_map(|record| score_candidate(record, &query.query_text, query_embedding))
            .collect();

        rank_scored(&mut results);
        results.truncate(query.limit);
        Ok(results)
    }

    /// Soft delete a record; the row stays for audit and lineage
    pub async fn soft_delete(&self, owner_id: &str, id: &str) -> MemoryResult<()> {
        self.get(owner_id, id, false).await?;
        let now = to_millis(now_utc());
        self.with_conn("ltm.soft_delete", |conn| {
            conn.execute(
                "UPDATE memories SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
                params![now, id],
            )?;
            Ok(())
        })
        .await?;
        tracing::info!(id, owner = owner_id, "ltm record soft-deleted");
        Ok(())
    }

    /// Refine confidence at most once per `(record, source)` pair.
    ///
    /// Returns `false` when `source_id` already refined this record, so a
    /// re-run of the same step leaves the score alone.
    pub async fn refine_confidence_once(
        &self,
        owner_id: &str,
        id: &str,
        source_id: &str,
        confidence: f32,
    ) -> MemoryResult<bool> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(MemoryError::invalid_operation(format!(
                "confidence {} out of range",
                confidence
            )));
        }
        self.get(owner_id, id, false).await?;
        let now = to_millis(now_utc());
        let applied = self
            .with_conn("ltm.refine_once", |conn| {
                let tx = conn.unchecked_transaction()?;
                let claimed = tx.execute(
                    "INSERT OR IGNORE INTO memory_refinements (memory_id, source_id, confidence, applied_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, source_id, confidence as f64, now],
                )?;
                if claimed == 1 {
                    tx.execute(
                        "UPDATE memories SET confidence_score = ?1 WHERE id = ?2",
                        params![confidence as f64, id],
                    )?;
                }
                tx.commit()?;
                Ok(claimed == 1)
            })
            .await?;
        if !applied {
            tracing::debug!(id, source = source_id, "refinement already applied");
        }
        Ok(applied)
    }

    /// Bytes held by an owner's live records
    pub async fn usage(&self, owner_id: &str) -> MemoryResult<u64> {
        self.with_conn("ltm.usage", |conn| {
            let bytes: i64 = conn.query_row(
                "SELECT COALESCE(SUM(size_bytes), 0) FROM memories WHERE owner_id = ?1 AND deleted_at IS NULL",
                params![owner_id],
                |row| row.get(0),
            )?;
            Ok(bytes.max(0) as u64)
        })
        .await
    }

    /// (live count, live bytes, soft-deleted count) for an owner
    pub async fn stats(&self, owner_id: &str) -> MemoryResult<(usize, u64, usize)> {
        self.with_conn("ltm.stats", |conn| {
            let (live, bytes): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM memories WHERE owner_id = ?1 AND deleted_at IS NULL",
                params![owner_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let deleted: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE owner_id = ?1 AND deleted_at IS NOT NULL",
                params![owner_id],
                |row| row.get(0),
            )?;
            Ok((live as usize, bytes.max(0) as u64, deleted as usize))
        })
        .await
    }
}

/// Score one record against a query, or drop it.
///
/// Vector scoring needs both sides embedded; a record stored while the
/// embedder was down still matches on keywords.
pub(crate) fn score_candidate(
    record: MemoryRecord,
    query_text: &str,
    query_embedding: Option<&[f32]>,
) -> Option<ScoredMemory> {
    let vector_score = match (query_embedding, record.embedding.as_deref()) {
        (Some(query_vector), Some(embedding)) => Some(cosine_similarity(query_vector, embedding)),
        _ => None,
    };
    match vector_score {
        Some(score) => Some(ScoredMemory {
            record,
            score,
            matched_by: MatchKind::Vector,
        }),
        None => {
            let score = record.matches_keywords(query_text);
            (score > 0.0).then_some(ScoredMemory {
                record,
                score,
                matched_by: MatchKind::Keyword,
            })
        }
    }
}

pub(super) fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

pub(super) fn row_to_record(row: &Row) -> rusqlite::Result<MemoryRecord> {
    let tier: String = row.get(3)?;
    let kind: String = row.get(4)?;
    let embedding: Option<Vec<u8>> = row.get(6)?;
    let tags_json: String = row.get(7)?;
    let outcome: String = row.get(12)?;
    let expires_at: Option<i64> = row.get(17)?;
    let deleted_at: Option<i64> = row.get(18)?;

    Ok(MemoryRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        session_id: row.get(2)?,
        tier: MemoryTier::from_str(&tier)
            .ok_or_else(|| conversion_error(3, format!("invalid tier: {}", tier)))?,
        kind: MemoryKind::from_str(&kind)
            .ok_or_else(|| conversion_error(4, format!("invalid kind: {}", kind)))?,
        text: row.get(5)?,
        embedding: embedding.as_deref().map(blob_to_embedding),
        tags: serde_json::from_str(&tags_json).map_err(|e| conversion_error(7, e.to_string()))?,
        emotional_weight: row.get::<_, f64>(8)? as f32,
        confidence_score: row.get::<_, f64>(9)? as f32,
        access_count: row.get(10)?,
        constitutional_valid: row.get(11)?,
        outcome: Outcome::from_str(&outcome)
            .ok_or_else(|| conversion_error(12, format!("invalid outcome: {}", outcome)))?,
        outcome_count: row.get(13)?,
        success_count: row.get(14)?,
        size_bytes: row.get::<_, i64>(15)?.max(0) as u64,
        created_at: from_millis(row.get(16)?),
        expires_at: expires_at.map(from_millis),
        deleted_at: deleted_at.map(from_millis),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::migrations;

    fn store() -> LongTermStore {
        let conn = Connection::open_in_memory().unwrap();
        migrations::run_migrations(&conn).unwrap();
        LongTermStore::new(Arc::new(Mutex::new(conn)), RetryPolicy::default())
    }

    fn record(id: &str, owner: &str, text: &str, embedding: Option<Vec<f32>>) -> MemoryRecord {
        MemoryRecord {
            id: id.into(),
            owner_id: owner.into(),
            session_id: Some("s1".into()),
            tier: MemoryTier::Ltm,
            kind: MemoryKind::Lesson,
            text: text.into(),
            embedding,
            tags: ["rust".to_string()].into_iter().collect(),
            emotional_weight: 0.4,
            confidence_score: 0.8,
            access_count: 3,
            constitutional_valid: true,
            outcome: Outcome::Success,
            outcome_count: 1,
            success_count: 1,
            size_bytes: 256,
            created_at: now_utc(),
            expires_at: None,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let store = store();
        let original = record("m1", "o1", "prefer iterators", Some(vec![0.25, -0.5, 1.0]));
        assert!(store.insert(&original).await.unwrap());

        let loaded = store.get("o1", "m1", false).await.unwrap();
        assert_eq!(loaded.text, original.text);
        assert_eq!(loaded.embedding, original.embedding);
        assert_eq!(loaded.tags, original.tags);
        assert_eq!(loaded.access_count, 3);
        assert_eq!(loaded.tier, MemoryTier::Ltm);
    }

    #[tokio::test]
    async fn test_insert_is_at_most_once() {
        let store = store();
        let r = record("m1", "o1", "first", None);
        assert!(store.insert(&r).await.unwrap());

        let mut again = r.clone();
        again.text = "second".into();
        assert!(!store.insert(&again).await.unwrap());
        assert_eq!(store.get("o1", "m1", false).await.unwrap().text, "first");
    }

    #[tokio::test]
    async fn test_cross_owner_access_is_forbidden() {
        let store = store();
        store.insert(&record("m1", "o1", "secret", None)).await.unwrap();

        assert!(store.get("o2", "m1", false).await.unwrap_err().is_forbidden());
        assert!(store.soft_delete("o2", "m1").await.unwrap_err().is_forbidden());
        assert!(store.get("o1", "nope", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_soft_delete_hides_record() {
        let store = store();
        store.insert(&record("m1", "o1", "old", None)).await.unwrap();
        store.soft_delete("o1", "m1").await.unwrap();

        assert!(store.get("o1", "m1", false).await.unwrap_err().is_not_found());
        assert!(store.get("o1", "m1", true).await.unwrap().is_deleted());
        assert!(store.list("o1", None, false).await.unwrap().is_empty());

        let (live, bytes, deleted) = store.stats("o1").await.unwrap();
        assert_eq!((live, bytes, deleted), (0, 0, 1));
    }

    #[tokio::test]
    async fn test_vector_search_falls_back_to_keywords_for_unembedded_records() {
        let store = store();
        store.insert(&record("near", "o1", "a", Some(vec![1.0, 0.0]))).await.unwrap();
        store.insert(&record("far", "o1", "b", Some(vec![0.0, 1.0]))).await.unwrap();
        store.insert(&record("keyword", "o1", "rust borrow checker lesson", None)).await.unwrap();
        store.insert(&record("unrelated", "o1", "gardening notes", None)).await.unwrap();
        store.insert(&record("other", "o2", "d", Some(vec![1.0, 0.0]))).await.unwrap();

        let query = SearchQuery::new("o1", "borrow checker");
        let hits = store.search(&query, Some(&[1.0, 0.0])).await.unwrap();

        let mut ids: Vec<&str> = hits.iter().map(|h| h.record.id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["far", "keyword", "near"]);

        let near = hits.iter().find(|h| h.record.id == "near").unwrap();
        assert!((near.score - 1.0).abs() < 1e-6);
        assert_eq!(near.matched_by, MatchKind::Vector);
        let keyword = hits.iter().find(|h| h.record.id == "keyword").unwrap();
        assert_eq!(keyword.matched_by, MatchKind::Keyword);
        assert!(keyword.score > 0.0);
    }

    #[tokio::test]
    async fn test_keyword_search_fallback() {
        let store = store();
        store.insert(&record("m1", "o1", "Use clippy before commits", None)).await.unwrap();
        store.insert(&record("m2", "o1", "Write tests first", None)).await.unwrap();

        let hits = store.search(&SearchQuery::new("o1", "clippy"), None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "m1");
        assert_eq!(hits[0].matched_by, MatchKind::Keyword);

        let mut stm_only = SearchQuery::new("o1", "clippy");
        stm_only.tier_filter = Some(MemoryTier::Stm);
        assert!(store.search(&stm_only, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_access_and_refine() {
        let store = store();
        store.insert(&record("m1", "o1", "x", None)).await.unwrap();

        let touched = store.record_access("o1", "m1").await.unwrap();
        assert_eq!(touched.access_count, 4);

        assert!(store.refine_confidence_once("o1", "m1", "k1", 0.65).await.unwrap());
        let refined = store.get("o1", "m1", false).await.unwrap();
        assert!((refined.confidence_score - 0.65).abs() < 1e-6);
        assert!(store.refine_confidence_once("o1", "m1", "k2", 1.5).await.is_err());
        assert_eq!(store.usage("o1").await.unwrap(), 256);
    }

    #[tokio::test]
    async fn test_refine_once_per_source() {
        let store = store();
        store.insert(&record("m1", "o1", "x", None)).await.unwrap();

        assert!(store.refine_confidence_once("o1", "m1", "k1", 0.6).await.unwrap());
        assert!(!store.refine_confidence_once("o1", "m1", "k1", 0.2).await.unwrap());
        assert!((store.get("o1", "m1", false).await.unwrap().confidence_score - 0.6).abs() < 1e-6);

        // A different source refines again
        assert!(store.refine_confidence_once("o1", "m1", "k2", 0.7).await.unwrap());
        assert!(store.refine_confidence_once("o2", "m1", "k3", 0.7).await.unwrap_err().is_forbidden());
    }
}
