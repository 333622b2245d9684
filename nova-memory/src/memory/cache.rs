//! Tiered cache for short-term and intermediate-term memory.
//!
//! STM entries live for a fixed TTL and are capped per session (FIFO).
//! ITM entries use a sliding TTL refreshed on every access and are capped per
//! owner, evicting the least-accessed record first.
//!
//! Access counting happens under the read lock with an atomic increment, so
//! concurrent `touch` calls never lose updates. An opened cache writes every
//! change through to SQLite and reads misses through from it, so the tiers
//! outlive the process that created them.
//!
//! An STM record past its TTL is hidden from reads but stays put until
//! `expire_sweep`, which gives promotion a chance to move it into ITM first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tokio::sync::{Mutex, RwLock};

use super::cache_store::CacheStore;
use super::types::{MemoryRecord, MemoryTier};
use crate::config::CacheConfig;
use crate::utils::{RetryPolicy, from_millis, now_utc, to_millis};
use crate::{MemoryError, MemoryResult};

struct CachedEntry {
    record: MemoryRecord,
    access_count: AtomicU32,
    expires_at_ms: AtomicI64,
    /// Insertion order, stable across tier moves
    seq: u64,
}

impl CachedEntry {
    fn new(record: MemoryRecord, expires_at: DateTime<Utc>, seq: u64) -> Self {
        Self {
            access_count: AtomicU32::new(record.access_count),
            expires_at_ms: AtomicI64::new(to_millis(expires_at)),
            record,
            seq,
        }
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at_ms.load(Ordering::Acquire) <= to_millis(now)
    }

    fn snapshot(&self) -> MemoryRecord {
        let mut record = self.record.clone();
        record.access_count = self.access_count.load(Ordering::Acquire);
        record.expires_at = Some(from_millis(self.expires_at_ms.load(Ordering::Acquire)));
        record
    }
}

#[derive(Default)]
struct CacheState {
    records: HashMap<String, Arc<CachedEntry>>,
    /// session key -> STM ids in arrival order
    stm_sessions: HashMap<String, VecDeque<String>>,
    /// owner -> ITM ids
    itm_owners: HashMap<String, HashSet<String>>,
}

impl CacheState {
    fn unlink(&mut self, id: &str) -> Option<Arc<CachedEntry>> {
        let entry = self.records.remove(id)?;
        match entry.record.tier {
            MemoryTier::Stm => {
                let key = session_key(&entry.record);
                if let Some(queue) = self.stm_sessions.get_mut(&key) {
                    queue.retain(|queued| queued != id);
                    if queue.is_empty() {
                        self.stm_sessions.remove(&key);
                    }
                }
            }
            MemoryTier::Itm => {
                if let Some(ids) = self.itm_owners.get_mut(&entry.record.owner_id) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.itm_owners.remove(&entry.record.owner_id);
                    }
                }
            }
            MemoryTier::Ltm => {}
        }
        Some(entry)
    }

    fn link(&mut self, entry: Arc<CachedEntry>) {
        let id = entry.record.id.clone();
        match entry.record.tier {
            MemoryTier::Stm => {
                self.stm_sessions
                    .entry(session_key(&entry.record))
                    .or_default()
                    .push_back(id.clone());
            }
            MemoryTier::Itm => {
                self.itm_owners
                    .entry(entry.record.owner_id.clone())
                    .or_default()
                    .insert(id.clone());
            }
            MemoryTier::Ltm => {}
        }
        self.records.insert(id, entry);
    }

    /// Drop the oldest STM records of a session beyond `cap`
    fn enforce_stm_cap(&mut self, key: &str, cap: usize) -> Vec<MemoryRecord> {
        let mut evicted = Vec::new();
        loop {
            let oldest = match self.stm_sessions.get(key) {
                Some(queue) if queue.len() > cap => queue.front().cloned(),
                _ => None,
            };
            let Some(id) = oldest else { break };
            if let Some(entry) = self.unlink(&id) {
                evicted.push(entry.snapshot());
            }
        }
        evicted
    }

    /// Drop least-accessed ITM records of an owner beyond `cap`, never `keep`
    fn enforce_itm_cap(&mut self, owner_id: &str, cap: usize, keep: &str) -> Vec<MemoryRecord> {
        let mut evicted = Vec::new();
        loop {
            let victim = match self.itm_owners.get(owner_id) {
                Some(ids) if ids.len() > cap => ids
                    .iter()
                    .filter(|id| id.as_str() != keep)
                    .filter_map(|id| self.records.get(id))
                    .min_by(|a, b| {
                        a.access_count
                            .load(Ordering::Acquire)
                            .cmp(&b.access_count.load(Ordering::Acquire))
                            .then_with(|| a.record.created_at.cmp(&b.record.created_at))
                            .then_with(|| a.seq.cmp(&b.seq))
                    })
                    .map(|entry| entry.record.id.clone()),
                _ => None,
            };
            let Some(id) = victim else { break };
            if let Some(entry) = self.unlink(&id) {
                evicted.push(entry.snapshot());
            }
        }
        evicted
    }
}

/// STM records are grouped by session, falling back to the owner
fn session_key(record: &MemoryRecord) -> String {
    match &record.session_id {
        Some(session) => format!("{}/{}", record.owner_id, session),
        None => record.owner_id.clone(),
    }
}

fn ids_of(records: &[MemoryRecord]) -> Vec<String> {
    records.iter().map(|record| record.id.clone()).collect()
}

/// Tiered cache holding STM and ITM records
pub struct TieredCache {
    state: RwLock<CacheState>,
    config: CacheConfig,
    store: Option<CacheStore>,
    /// Next insertion sequence number
    next_seq: AtomicU64,
}

impl TieredCache {
    /// Process-local cache with nothing behind it
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            config,
            store: None,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Cache backed by the `cached_memories` table, loaded with whatever
    /// earlier processes left there
    pub async fn open(config: CacheConfig, db: Arc<Mutex<Connection>>, retry: RetryPolicy) -> MemoryResult<Self> {
        let store = CacheStore::new(db, retry);
        let rows = store.load_all().await?;

        let mut state = CacheState::default();
        let mut next_seq = 1;
        for (record, seq) in rows {
            next_seq = next_seq.max(seq + 1);
            let expires_at = record.expires_at.unwrap_or(record.created_at);
            state.link(Arc::new(CachedEntry::new(record, expires_at, seq)));
        }

        // Caps again, in case an eviction never reached disk
        let mut evicted = Vec::new();
        let sessions: Vec<String> = state.stm_sessions.keys().cloned().collect();
        for key in sessions {
            evicted.extend(state.enforce_stm_cap(&key, config.stm_max_per_session));
        }
        let owners: Vec<String> = state.itm_owners.keys().cloned().collect();
        for owner_id in owners {
            evicted.extend(state.enforce_itm_cap(&owner_id, config.itm_max_per_owner, ""));
        }
        store.delete(&ids_of(&evicted)).await?;

        tracing::info!(records = state.records.len(), evicted = evicted.len(), "tiered cache loaded");
        Ok(Self {
            state: RwLock::new(state),
            config,
            store: Some(store),
            next_seq: AtomicU64::new(next_seq),
        })
    }

    fn ttl_for(&self, tier: MemoryTier) -> Duration {
        match tier {
            MemoryTier::Stm => Duration::seconds(self.config.stm_ttl_secs as i64),
            MemoryTier::Itm | MemoryTier::Ltm => Duration::seconds(self.config.itm_ttl_secs as i64),
        }
    }

    async fn persist(&self, record: &MemoryRecord, seq: u64) -> MemoryResult<()> {
        match &self.store {
            Some(store) => store.upsert(record, seq).await,
            None => Ok(()),
        }
    }

    async fn forget(&self, ids: &[String]) -> MemoryResult<()> {
        match &self.store {
            Some(store) => store.delete(ids).await,
            None => Ok(()),
        }
    }

    /// Pull a row written by another process into memory
    async fn load_through(&self, id: &str) -> MemoryResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if self.state.read().await.records.contains_key(id) {
            return Ok(());
        }
        let Some((record, seq)) = store.load(id).await? else {
            return Ok(());
        };

        let mut state = self.state.write().await;
        if !state.records.contains_key(id) {
            let expires_at = record.expires_at.unwrap_or(record.created_at);
            state.link(Arc::new(CachedEntry::new(record, expires_at, seq)));
            self.next_seq.fetch_max(seq + 1, Ordering::Relaxed);
            tracing::debug!(id, "cached memory loaded from disk");
        }
        Ok(())
    }

    /// Insert a new STM or ITM record, returning whatever the tier cap evicted
    pub async fn put(&self, record: MemoryRecord) -> MemoryResult<Vec<MemoryRecord>> {
        self.put_at(record, now_utc()).await
    }

    pub(crate) async fn put_at(
        &self,
        mut record: MemoryRecord,
        now: DateTime<Utc>,
    ) -> MemoryResult<Vec<MemoryRecord>> {
        if !record.tier.is_cached() {
            return Err(MemoryError::invalid_operation(format!(
                "{} records are not cached",
                record.tier
            )));
        }

        let expires_at = match record.tier {
            MemoryTier::Stm => record.created_at + self.ttl_for(MemoryTier::Stm),
            _ => now + self.ttl_for(record.tier),
        };
        record.expires_at = Some(expires_at);

        let id = record.id.clone();
        let tier = record.tier;
        let key = session_key(&record);
        let owner_id = record.owner_id.clone();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(CachedEntry::new(record, expires_at, seq));

        let mut state = self.state.write().await;
        // Written first: a failed write leaves the cache untouched
        self.persist(&entry.snapshot(), seq).await?;
        state.unlink(&id);
        state.link(entry);

        let evicted = match tier {
            MemoryTier::Stm => state.enforce_stm_cap(&key, self.config.stm_max_per_session),
            _ => state.enforce_itm_cap(&owner_id, self.config.itm_max_per_owner, &id),
        };
        if !evicted.is_empty() {
            tracing::debug!(tier = %tier, count = evicted.len(), "evicted cached memories over capacity");
            self.forget(&ids_of(&evicted)).await?;
        }
        Ok(evicted)
    }

    /// Read a live record without counting an access
    pub async fn get(&self, id: &str) -> MemoryResult<MemoryRecord> {
        self.get_at(id, now_utc()).await
    }

    pub(crate) async fn get_at(&self, id: &str, now: DateTime<Utc>) -> MemoryResult<MemoryRecord> {
        self.load_through(id).await?;
        let live = {
            let state = self.state.read().await;
            match state.records.get(id) {
                None => return Err(MemoryError::not_found("MemoryRecord", id)),
                Some(entry) => (!entry.is_expired_at(now)).then(|| entry.snapshot()),
            }
        };

        match live {
            Some(record) => Ok(record),
            None => {
                self.remove_if_expired(id, now).await;
                Err(MemoryError::not_found("MemoryRecord", id))
            }
        }
    }

    /// Read a record promotion may still act on: live, or STM past its TTL
    /// and not yet swept
    pub(crate) async fn get_for_promotion(&self, id: &str) -> MemoryResult<MemoryRecord> {
        self.get_for_promotion_at(id, now_utc()).await
    }

    pub(crate) async fn get_for_promotion_at(&self, id: &str, now: DateTime<Utc>) -> MemoryResult<MemoryRecord> {
        self.load_through(id).await?;
        let state = self.state.read().await;
        match state.records.get(id) {
            Some(entry) if entry.record.tier == MemoryTier::Stm || !entry.is_expired_at(now) => Ok(entry.snapshot()),
            _ => Err(MemoryError::not_found("MemoryRecord", id)),
        }
    }

    /// Count an access; ITM records also get their sliding TTL refreshed
    pub async fn touch(&self, id: &str) -> MemoryResult<MemoryRecord> {
        self.touch_at(id, now_utc()).await
    }

    pub(crate) async fn touch_at(&self, id: &str, now: DateTime<Utc>) -> MemoryResult<MemoryRecord> {
        self.load_through(id).await?;
        let touched = {
            let state = self.state.read().await;
            match state.records.get(id) {
                None => return Err(MemoryError::not_found("MemoryRecord", id)),
                Some(entry) if !entry.is_expired_at(now) => {
                    entry.access_count.fetch_add(1, Ordering::AcqRel);
                    if entry.record.tier == MemoryTier::Itm {
                        entry.expires_at_ms.store(
                            to_millis(now + self.ttl_for(MemoryTier::Itm)),
                            Ordering::Release,
                        );
                    }
                    Some(entry.snapshot())
                }
                Some(_) => None,
            }
        };

        let Some(record) = touched else {
            self.remove_if_expired(id, now).await;
            return Err(MemoryError::not_found("MemoryRecord", id));
        };
        if let Some(store) = &self.store {
            let expires_at = record.expires_at.unwrap_or(now);
            store.record_access(id, record.access_count, expires_at, now).await?;
        }
        Ok(record)
    }

    /// Lazily drop an expired ITM record; expired STM waits for the sweep
    async fn remove_if_expired(&self, id: &str, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        let expired_itm = state
            .records
            .get(id)
            .is_some_and(|entry| entry.record.tier == MemoryTier::Itm && entry.is_expired_at(now));
        if !expired_itm {
            return;
        }
        state.unlink(id);
        tracing::debug!(id, "expired cached memory removed on read");
        if let Err(e) = self.forget(&[id.to_string()]).await {
            tracing::warn!(id, "expired row left on disk until the next sweep: {}", e);
        }
    }

    /// Live records of an owner in insertion order
    pub async fn list(&self, owner_id: &str, tier: Option<MemoryTier>) -> Vec<MemoryRecord> {
        self.list_at(owner_id, tier, now_utc()).await
    }

    pub(crate) async fn list_at(
        &self,
        owner_id: &str,
        tier: Option<MemoryTier>,
        now: DateTime<Utc>,
    ) -> Vec<MemoryRecord> {
        let state = self.state.read().await;
        let mut entries: Vec<&Arc<CachedEntry>> = state
            .records
            .values()
            .filter(|entry| entry.record.owner_id == owner_id)
            .filter(|entry| tier.is_none_or(|t| entry.record.tier == t))
            .filter(|entry| !entry.is_expired_at(now))
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.snapshot()).collect()
    }

    /// STM records past their TTL that the sweep has not dropped yet
    pub async fn aged_stm(&self) -> Vec<MemoryRecord> {
        self.aged_stm_at(now_utc()).await
    }

    pub(crate) async fn aged_stm_at(&self, now: DateTime<Utc>) -> Vec<MemoryRecord> {
        let state = self.state.read().await;
        let mut entries: Vec<&Arc<CachedEntry>> = state
            .records
            .values()
            .filter(|entry| entry.record.tier == MemoryTier::Stm && entry.is_expired_at(now))
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.snapshot()).collect()
    }

    /// Replace a record's content in place, keeping its counters and position
    pub async fn update(&self, record: MemoryRecord) -> MemoryResult<MemoryRecord> {
        self.load_through(&record.id).await?;
        let mut state = self.state.write().await;
        let existing = state
            .records
            .get(&record.id)
            .cloned()
            .ok_or_else(|| MemoryError::not_found("MemoryRecord", &record.id))?;

        if existing.record.tier != record.tier {
            return Err(MemoryError::invalid_operation(
                "tier changes go through promotion",
            ));
        }

        let entry = Arc::new(CachedEntry {
            access_count: AtomicU32::new(existing.access_count.load(Ordering::Acquire)),
            expires_at_ms: AtomicI64::new(existing.expires_at_ms.load(Ordering::Acquire)),
            seq: existing.seq,
            record,
        });
        let snapshot = entry.snapshot();
        self.persist(&snapshot, entry.seq).await?;
        state.records.insert(snapshot.id.clone(), entry);
        Ok(snapshot)
    }

    /// Move an STM record into ITM, keeping its access count. STM past its
    /// TTL still moves: staying a full cycle is itself a reason to promote.
    pub async fn move_to_itm(&self, id: &str) -> MemoryResult<(MemoryRecord, Vec<MemoryRecord>)> {
        self.load_through(id).await?;
        let now = now_utc();
        let mut state = self.state.write().await;
        let entry = match state.records.get(id) {
            Some(entry) if entry.record.tier == MemoryTier::Stm => Arc::clone(entry),
            Some(entry) if entry.record.tier == MemoryTier::Itm && !entry.is_expired_at(now) => {
                return Ok((entry.snapshot(), Vec::new()));
            }
            _ => return Err(MemoryError::not_found("MemoryRecord", id)),
        };

        let mut record = entry.record.clone();
        record.tier = MemoryTier::Itm;
        let moved = Arc::new(CachedEntry {
            access_count: AtomicU32::new(entry.access_count.load(Ordering::Acquire)),
            expires_at_ms: AtomicI64::new(to_millis(now + self.ttl_for(MemoryTier::Itm))),
            seq: entry.seq,
            record,
        });
        let snapshot = moved.snapshot();
        self.persist(&snapshot, moved.seq).await?;

        state.unlink(id);
        let owner_id = snapshot.owner_id.clone();
        state.link(moved);
        let evicted = state.enforce_itm_cap(&owner_id, self.config.itm_max_per_owner, id);
        self.forget(&ids_of(&evicted)).await?;
        Ok((snapshot, evicted))
    }

    /// Remove a record regardless of expiry
    pub async fn remove(&self, id: &str) -> MemoryResult<Option<MemoryRecord>> {
        self.load_through(id).await?;
        let mut state = self.state.write().await;
        let removed = state.unlink(id).map(|entry| entry.snapshot());
        if removed.is_some() {
            self.forget(&[id.to_string()]).await?;
        }
        Ok(removed)
    }

    /// Remove every expired record, returning how many were dropped
    pub async fn expire_sweep(&self) -> MemoryResult<usize> {
        self.expire_sweep_at(now_utc()).await
    }

    pub(crate) async fn expire_sweep_at(&self, now: DateTime<Utc>) -> MemoryResult<usize> {
        let mut state = self.state.write().await;
        let expired: Vec<String> = state
            .records
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.record.id.clone())
            .collect();
        for id in &expired {
            state.unlink(id);
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired cached memories swept");
        }
        self.forget(&expired).await?;
        Ok(expired.len())
    }

    /// Bytes held in the cache for an owner
    pub async fn owner_usage(&self, owner_id: &str) -> u64 {
        let state = self.state.read().await;
        state
            .records
            .values()
            .filter(|entry| entry.record.owner_id == owner_id)
            .map(|entry| entry.record.size_bytes)
            .sum()
    }

    /// Live record count for an owner in one tier
    pub async fn count(&self, owner_id: &str, tier: MemoryTier) -> usize {
        self.list(owner_id, Some(tier)).await.len()
    }
}
