//! Signed, versioned policy records.
//!
//! A published version is never updated; publishing again creates the next
//! version, which supersedes the previous one as the active policy.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::rules::PRINCIPLES;
use crate::utils::{RetryPolicy, content_hash, from_millis, now_utc, to_millis};
use crate::{MemoryError, MemoryResult};

/// A weighted constitutional principle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principle {
    pub name: String,
    pub weight: f32,
}

impl Principle {
    pub fn new(name: impl Into<String>, weight: f32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// The eight default principles at weight 1.0
pub fn default_principles() -> Vec<Principle> {
    PRINCIPLES.iter().map(|name| Principle::new(*name, 1.0)).collect()
}

/// Immutable policy version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub id: String,
    pub version: u32,
    pub principles: Vec<Principle>,
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

impl PolicyRecord {
    fn sign(version: u32, principles: &[Principle], created_at: DateTime<Utc>) -> MemoryResult<String> {
        // serde_json objects serialize with sorted keys
        let canonical = serde_json::json!({
            "version": version,
            "principles": principles,
            "created_at": to_millis(created_at),
        });
        Ok(content_hash(&serde_json::to_string(&canonical)?))
    }

    /// Recompute the signature and compare
    pub fn verify_signature(&self) -> MemoryResult<bool> {
        Ok(Self::sign(self.version, &self.principles, self.created_at)? == self.signature)
    }

    /// Weight of a principle, 1.0 if the policy does not list it
    pub fn weight_of(&self, name: &str) -> f32 {
        self.principles
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.weight)
            .unwrap_or(1.0)
    }
}

/// Append-only store of policy versions
#[derive(Clone)]
pub struct PolicyRegistry {
    db: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl PolicyRegistry {
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

    /// Publish a new version superseding the current one
    pub async fn publish(&self, principles: Vec<Principle>) -> MemoryResult<PolicyRecord> {
        if principles.is_empty() {
            return Err(MemoryError::policy("a policy needs at least one principle"));
        }
        if let Some(bad) = principles.iter().find(|p| !(0.0..=10.0).contains(&p.weight) || p.name.is_empty()) {
            return Err(MemoryError::policy(format!("invalid principle: {:?}", bad)));
        }

        let principles_json = serde_json::to_string(&principles)?;
        let record = self
            .with_conn("policy.publish", |conn| {
                let latest: Option<u32> = conn.query_row("SELECT MAX(version) FROM policies", [], |row| row.get(0))?;
                let version = latest.unwrap_or(0) + 1;
                // Millisecond precision so the stored row verifies identically
                let created_at = from_millis(to_millis(now_utc()));
                let record = PolicyRecord {
                    id: Uuid::new_v4().to_string(),
                    version,
                    signature: PolicyRecord::sign(version, &principles, created_at)?,
                    principles: principles.clone(),
                    created_at,
                };

                conn.execute(
                    "INSERT INTO policies (id, version, principles_json, signature, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        &record.id,
                        record.version,
                        &principles_json,
                        &record.signature,
                        to_millis(record.created_at),
                    ],
                )?;
                Ok(record)
            })
            .await?;

        tracing::info!(version = record.version, principles = record.principles.len(), "policy published");
        Ok(record)
    }

    /// Latest version, if any has been published
    pub async fn active(&self) -> MemoryResult<Option<PolicyRecord>> {
        self.with_conn("policy.active", |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, version, principles_json, signature, created_at FROM policies ORDER BY version DESC LIMIT 1",
                    [],
                    row_to_policy,
                )
                .optional()?)
        })
        .await
    }

    /// Active version, publishing the default principles on first use
    pub async fn ensure_default(&self) -> MemoryResult<PolicyRecord> {
        match self.active().await? {
            Some(record) => Ok(record),
            None => self.publish(default_principles()).await,
        }
    }

    pub async fn get(&self, version: u32) -> MemoryResult<PolicyRecord> {
        self.with_conn("policy.get", |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, version, principles_json, signature, created_at FROM policies WHERE version = ?1",
                    params![version],
                    row_to_policy,
                )
                .optional()?)
        })
        .await?
        .ok_or_else(|| MemoryError::not_found("PolicyRecord", version.to_string()))
    }

    /// Every version, oldest first
    pub async fn list(&self) -> MemoryResult<Vec<PolicyRecord>> {
        self.with_conn("policy.list", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, version, principles_json, signature, created_at FROM policies ORDER BY version",
            )?;
            let rows = stmt.query_map([], row_to_policy)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

fn row_to_policy(row: &Row) -> rusqlite::Result<PolicyRecord> {
    let principles_json: String = row.get(2)?;
    Ok(PolicyRecord {
        id: row.get(0)?,
        version: row.get(1)?,
        principles: serde_json::from_str(&principles_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        signature: row.get(3)?,
        created_at: from_millis(row.get(4)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::migrations;

    fn registry() -> (PolicyRegistry, Arc<Mutex<Connection>>) {
        let conn = Connection::open_in_memory().unwrap();
        migrations::run_migrations(&conn).unwrap();
        let db = Arc::new(Mutex::new(conn));
        (PolicyRegistry::new(db.clone(), RetryPolicy::default()), db)
    }

    #[tokio::test]
    async fn test_publish_creates_new_versions() {
        let (registry, _) = registry();
        assert!(registry.active().await.unwrap().is_none());

        let v1 = registry.ensure_default().await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v1.principles.len(), 8);
        assert!(v1.verify_signature().unwrap());

        let v2 = registry
            .publish(vec![Principle::new("truth", 2.0), Principle::new("respect", 1.0)])
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(registry.active().await.unwrap().unwrap().version, 2);

        // The old version is untouched
        assert_eq!(registry.get(1).await.unwrap(), v1);
        assert_eq!(registry.list().await.unwrap().len(), 2);
        assert_eq!(v2.weight_of("truth"), 2.0);
        assert_eq!(v2.weight_of("wisdom"), 1.0);
    }

    #[tokio::test]
    async fn test_tampered_policy_fails_verification() {
        let (registry, db) = registry();
        registry.ensure_default().await.unwrap();

        db.lock()
            .await
            .execute(
                "UPDATE policies SET principles_json = '[{\"name\":\"truth\",\"weight\":0.0}]' WHERE version = 1",
                [],
            )
            .unwrap();

        let tampered = registry.get(1).await.unwrap();
        assert!(!tampered.verify_signature().unwrap());
    }

    #[tokio::test]
    async fn test_publish_rejects_empty_policy() {
        let (registry, _) = registry();
        assert!(registry.publish(Vec::new()).await.is_err());
        assert!(registry.get(7).await.unwrap_err().is_not_found());
    }
}
