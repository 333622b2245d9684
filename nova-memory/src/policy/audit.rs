//! Tamper-evident audit log.
//!
//! Entries form one hash chain per lineage. Each entry stores the hash of its
//! predecessor (`genesis` for the first) and a keyed signature over
//! `(content_hash, prev_hash, created_at)`. Only content hashes are logged,
//! never raw content.
//!
//! Appends for a lineage read the chain head and insert the next entry while
//! holding the connection lock, so entries land in strict order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::utils::{RetryPolicy, from_millis, hash_parts, keyed_hash, now_utc, to_millis};
use crate::{MemoryError, MemoryResult};

/// `prev_hash` of the first entry in a lineage
pub const GENESIS_HASH: &str = "genesis";

const COLUMNS: &str =
    "id, lineage, seq, actor_id, event_kind, content_hash, prev_hash, signature, entry_hash, created_at";

/// One appended audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub lineage: String,
    pub seq: u64,
    pub actor_id: Option<String>,
    pub event_kind: String,
    pub content_hash: String,
    pub prev_hash: String,
    pub signature: String,
    pub entry_hash: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    fn compute_signature(key: &str, content_hash: &str, prev_hash: &str, created_at: i64) -> String {
        keyed_hash(key, &[content_hash, prev_hash, &created_at.to_string()])
    }

    fn compute_hash(&self) -> String {
        hash_parts(&[
            &self.id,
            &self.lineage,
            &self.seq.to_string(),
            self.actor_id.as_deref().unwrap_or(""),
            &self.event_kind,
            &self.content_hash,
            &self.prev_hash,
            &self.signature,
            &to_millis(self.created_at).to_string(),
        ])
    }
}

/// Where and why a chain stopped verifying
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokenLink {
    pub seq: u64,
    pub entry_id: Option<String>,
    pub reason: String,
}

/// Result of walking a lineage from genesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub lineage: String,
    pub entries: usize,
    pub verified: usize,
    pub first_broken: Option<BrokenLink>,
}

impl ChainVerification {
    pub fn is_intact(&self) -> bool {
        self.first_broken.is_none()
    }
}

/// Append-only audit log shared by every lineage
#[derive(Clone)]
pub struct AuditLog {
    db: Arc<Mutex<Connection>>,
    signing_key: String,
    retry: RetryPolicy,
}

impl AuditLog {
    pub fn new(db: Arc<Mutex<Connection>>, signing_key: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            db,
            signing_key: signing_key.into(),
            retry,
        }
    }

    /// Append an entry to the end of `lineage`
    pub async fn append(
        &self,
        lineage: &str,
        actor_id: Option<&str>,
        event_kind: &str,
        content_hash: &str,
    ) -> MemoryResult<AuditEntry> {
        let db = &self.db;
        let key = self.signing_key.as_str();

        let entry = self
            .retry
            .run("audit.append", move || async move {
                let conn = db.lock().await;
                let head: Option<(i64, String)> = conn
                    .query_row(
                        "SELECT seq, entry_hash FROM audit_entries WHERE lineage = ?1 ORDER BY seq DESC LIMIT 1",
                        params![lineage],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let (seq, prev_hash) = match head {
                    Some((seq, hash)) => (seq.max(0) as u64 + 1, hash),
                    None => (1, GENESIS_HASH.to_string()),
                };

                let created_at = to_millis(now_utc());
                let mut entry = AuditEntry {
                    id: Uuid::new_v4().to_string(),
                    lineage: lineage.to_string(),
                    seq,
                    actor_id: actor_id.map(str::to_string),
                    event_kind: event_kind.to_string(),
                    content_hash: content_hash.to_string(),
                    signature: AuditEntry::compute_signature(key, content_hash, &prev_hash, created_at),
                    prev_hash,
                    entry_hash: String::new(),
                    created_at: from_millis(created_at),
                };
                entry.entry_hash = entry.compute_hash();

                conn.execute(
                    &format!("INSERT INTO audit_entries ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                    params![
                        &entry.id,
                        &entry.lineage,
                        entry.seq as i64,
                        &entry.actor_id,
                        &entry.event_kind,
                        &entry.content_hash,
                        &entry.prev_hash,
                        &entry.signature,
                        &entry.entry_hash,
                        created_at,
                    ],
                )?;
                Ok::<_, MemoryError>(entry)
            })
            .await?;

        tracing::debug!(lineage, seq = entry.seq, event = event_kind, "audit entry appended");
        Ok(entry)
    }

    /// Entries of a lineage in chain order, optionally only the newest `limit`
    pub async fn list(&self, lineage: &str, limit: Option<usize>) -> MemoryResult<Vec<AuditEntry>> {
        let db = &self.db;
        let mut entries = self
            .retry
            .run("audit.list", move || async move {
                let conn = db.lock().await;
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM audit_entries WHERE lineage = ?1 ORDER BY seq DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(
                    params![lineage, limit.map(|l| l as i64).unwrap_or(-1)],
                    row_to_entry,
                )?;
                Ok::<_, MemoryError>(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        entries.reverse();
        Ok(entries)
    }

    /// Distinct lineages with at least one entry
    pub async fn lineages(&self) -> MemoryResult<Vec<String>> {
        let db = &self.db;
        self.retry
            .run("audit.lineages", move || async move {
                let conn = db.lock().await;
                let mut stmt = conn.prepare("SELECT DISTINCT lineage FROM audit_entries ORDER BY lineage")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok::<_, MemoryError>(rows.collect::<Result<Vec<String>, _>>()?)
            })
            .await
    }

    /// Walk a lineage from genesis, stopping at the first entry that fails
    pub async fn verify(&self, lineage: &str) -> MemoryResult<ChainVerification> {
        let entries = self.list(lineage, None).await?;
        let mut verification = ChainVerification {
            lineage: lineage.to_string(),
            entries: entries.len(),
            verified: 0,
            first_broken: None,
        };

        let mut expected_prev = GENESIS_HASH.to_string();
        for (index, entry) in entries.iter().enumerate() {
            let expected_seq = index as u64 + 1;
            let reason = if entry.seq != expected_seq {
                Some(format!("expected seq {}, found {}", expected_seq, entry.seq))
            } else if entry.prev_hash != expected_prev {
                Some("prev_hash does not match the preceding entry".to_string())
            } else if entry.signature
                != AuditEntry::compute_signature(
                    &self.signing_key,
                    &entry.content_hash,
                    &entry.prev_hash,
                    to_millis(entry.created_at),
                )
            {
                Some("signature mismatch".to_string())
            } else if entry.entry_hash != entry.compute_hash() {
                Some("entry hash mismatch".to_string())
            } else {
                None
            };

            if let Some(reason) = reason {
                tracing::warn!(lineage, seq = entry.seq, %reason, "audit chain broken");
                verification.first_broken = Some(BrokenLink {
                    seq: expected_seq,
                    entry_id: Some(entry.id.clone()),
                    reason,
                });
                return Ok(verification);
            }

            verification.verified += 1;
            expected_prev = entry.entry_hash.clone();
        }

        Ok(verification)
    }
}

fn row_to_entry(row: &Row) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        lineage: row.get(1)?,
        seq: row.get::<_, i64>(2)?.max(0) as u64,
        actor_id: row.get(3)?,
        event_kind: row.get(4)?,
        content_hash: row.get(5)?,
        prev_hash: row.get(6)?,
        signature: row.get(7)?,
        entry_hash: row.get(8)?,
        created_at: from_millis(row.get(9)?),
    })
}
