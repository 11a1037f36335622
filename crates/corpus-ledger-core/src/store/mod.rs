//! Storage abstraction for the crawl ledger.
//!
//! The [`LedgerStore`] trait is the leaf dependency of the control plane:
//! a durable table of [`CrawlRecord`]s keyed by `(source, key)`, advisory
//! source locks, run history, and per-day quota counters. It performs no
//! state-machine validation; that belongs to
//! [`LedgerService`](crate::ledger::LedgerService), which is the only
//! intended writer.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! Every mutating method must be atomic: a failed call leaves no partial
//! effect behind, so callers may retry it.

pub mod memory;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::models::{CrawlRecord, CrawlState, RunRecord, StateCounts};

/// Current holder of a source lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub source: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// Abstract durable backend for the crawl ledger.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_record`](LedgerStore::get_record) | Read one record by `(source, key)` |
/// | [`put_record`](LedgerStore::put_record) | Insert or fully replace one record |
/// | [`find_by_checksum`](LedgerStore::find_by_checksum) | Lookup by content checksum |
/// | [`keys_in_states`](LedgerStore::keys_in_states) | Bulk key read for in-memory filtering |
/// | [`try_lock`](LedgerStore::try_lock) | Acquire or reclaim a source lock |
/// | [`insert_run`](LedgerStore::insert_run) | Append a run outcome |
/// | [`add_quota`](LedgerStore::add_quota) | Increment a daily quota counter |
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_record(&self, source: &str, key: &str) -> Result<Option<CrawlRecord>>;

    async fn put_record(&self, record: &CrawlRecord) -> Result<()>;

    /// A record of `source` with this content checksum, preferring
    /// settled records, then the most recently touched.
    async fn find_by_checksum(&self, source: &str, checksum: &str)
        -> Result<Option<CrawlRecord>>;

    /// Keys of `source` whose state is one of `states`, at most `limit`.
    async fn keys_in_states(
        &self,
        source: &str,
        states: &[CrawlState],
        limit: Option<usize>,
    ) -> Result<HashSet<String>>;

    /// Text hashes of the most recently written records across all sources.
    /// Records settled without output (filtered, nothing extractable) are
    /// not included.
    async fn recent_text_hashes(&self, limit: usize) -> Result<Vec<String>>;

    /// Per-state counts of a source's item records; upstream marker rows
    /// are excluded.
    async fn count_by_state(&self, source: &str) -> Result<StateCounts>;

    /// Physically delete every record of `source`. Returns the row count.
    async fn delete_source(&self, source: &str) -> Result<u64>;

    /// Acquire the lock for `source` on behalf of `holder`.
    ///
    /// Succeeds when no lock exists, when `holder` already owns it, or when
    /// the existing lock's heartbeat is older than `stale_before`.
    async fn try_lock(
        &self,
        source: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool>;

    /// Refresh the heartbeat. Returns `false` if `holder` no longer owns it.
    async fn refresh_lock(&self, source: &str, holder: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Release the lock if `holder` owns it.
    async fn unlock(&self, source: &str, holder: &str) -> Result<()>;

    async fn lock_info(&self, source: &str) -> Result<Option<LockInfo>>;

    async fn insert_run(&self, run: &RunRecord) -> Result<()>;

    async fn last_successful_run(&self, source: &str) -> Result<Option<DateTime<Utc>>>;

    async fn quota_used(&self, source: &str, day: NaiveDate) -> Result<u64>;

    /// Add `n` to the counter and return the new total.
    async fn add_quota(&self, source: &str, day: NaiveDate, n: u64) -> Result<u64>;
}
