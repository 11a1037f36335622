//! In-memory [`LedgerStore`] implementation for tests and dry runs.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.
//! Nothing survives the process.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::models::{CrawlRecord, CrawlState, RunRecord, RunStatus, StateCounts};

use super::{LedgerStore, LockInfo};

/// In-memory ledger store.
pub struct InMemoryLedgerStore {
    records: RwLock<HashMap<(String, String), CrawlRecord>>,
    locks: RwLock<HashMap<String, LockInfo>>,
    runs: RwLock<Vec<RunRecord>>,
    quota: RwLock<HashMap<(String, NaiveDate), u64>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            runs: RwLock::new(Vec::new()),
            quota: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.read().unwrap().len()
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get_record(&self, source: &str, key: &str) -> Result<Option<CrawlRecord>> {
        let records = self.records.read().unwrap();
        Ok(records
            .get(&(source.to_string(), key.to_string()))
            .cloned())
    }

    async fn put_record(&self, record: &CrawlRecord) -> Result<()> {
        let mut records = self.records.write().unwrap();
        records.insert(
            (record.source.clone(), record.key.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn find_by_checksum(
        &self,
        source: &str,
        checksum: &str,
    ) -> Result<Option<CrawlRecord>> {
        let records = self.records.read().unwrap();
        Ok(records
            .values()
            .filter(|r| r.source == source && r.checksum() == Some(checksum))
            .max_by_key(|r| {
                (
                    r.state.is_settled(),
                    r.processed_at.or(r.fetched_at).unwrap_or(r.discovered_at),
                )
            })
            .cloned())
    }

    async fn keys_in_states(
        &self,
        source: &str,
        states: &[CrawlState],
        limit: Option<usize>,
    ) -> Result<HashSet<String>> {
        let records = self.records.read().unwrap();
        let iter = records
            .values()
            .filter(|r| r.source == source && states.contains(&r.state))
            .map(|r| r.key.clone());
        Ok(match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    async fn recent_text_hashes(&self, limit: usize) -> Result<Vec<String>> {
        let records = self.records.read().unwrap();
        let mut processed: Vec<&CrawlRecord> = records
            .values()
            .filter(|r| {
                r.state == CrawlState::Processed && r.text_hash.is_some() && r.output_id.is_some()
            })
            .collect();
        processed.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        Ok(processed
            .into_iter()
            .take(limit)
            .filter_map(|r| r.text_hash.clone())
            .collect())
    }

    async fn count_by_state(&self, source: &str) -> Result<StateCounts> {
        let records = self.records.read().unwrap();
        let mut counts = StateCounts::default();
        for r in records
            .values()
            .filter(|r| r.source == source && !r.is_upstream_marker())
        {
            counts.add(r.state, 1);
        }
        Ok(counts)
    }

    async fn delete_source(&self, source: &str) -> Result<u64> {
        let mut records = self.records.write().unwrap();
        let before = records.len();
        records.retain(|(s, _), _| s != source);
        Ok((before - records.len()) as u64)
    }

    async fn try_lock(
        &self,
        source: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let mut locks = self.locks.write().unwrap();
        if let Some(existing) = locks.get(source) {
            if existing.holder != holder && existing.heartbeat_at >= stale_before {
                return Ok(false);
            }
        }
        locks.insert(
            source.to_string(),
            LockInfo {
                source: source.to_string(),
                holder: holder.to_string(),
                acquired_at: now,
                heartbeat_at: now,
            },
        );
        Ok(true)
    }

    async fn refresh_lock(&self, source: &str, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut locks = self.locks.write().unwrap();
        match locks.get_mut(source) {
            Some(lock) if lock.holder == holder => {
                lock.heartbeat_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unlock(&self, source: &str, holder: &str) -> Result<()> {
        let mut locks = self.locks.write().unwrap();
        if locks.get(source).map(|l| l.holder == holder).unwrap_or(false) {
            locks.remove(source);
        }
        Ok(())
    }

    async fn lock_info(&self, source: &str) -> Result<Option<LockInfo>> {
        Ok(self.locks.read().unwrap().get(source).cloned())
    }

    async fn insert_run(&self, run: &RunRecord) -> Result<()> {
        self.runs.write().unwrap().push(run.clone());
        Ok(())
    }

    async fn last_successful_run(&self, source: &str) -> Result<Option<DateTime<Utc>>> {
        let runs = self.runs.read().unwrap();
        Ok(runs
            .iter()
            .filter(|r| r.source == source && r.status == RunStatus::Success)
            .map(|r| r.finished_at)
            .max())
    }

    async fn quota_used(&self, source: &str, day: NaiveDate) -> Result<u64> {
        let quota = self.quota.read().unwrap();
        Ok(quota.get(&(source.to_string(), day)).copied().unwrap_or(0))
    }

    async fn add_quota(&self, source: &str, day: NaiveDate, n: u64) -> Result<u64> {
        let mut quota = self.quota.write().unwrap();
        let entry = quota.entry((source.to_string(), day)).or_insert(0);
        *entry += n;
        Ok(*entry)
    }
}
