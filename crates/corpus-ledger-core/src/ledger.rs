//! Crawl ledger service: the single source of truth for "has this resource
//! been handled, and how".
//!
//! [`LedgerService`] wraps a [`LedgerStore`] with the
//! `discovered → fetched → processed` state machine, conditional-HTTP
//! validators, daily quota counters and advisory source locks. All ledger
//! mutation goes through this type so the invariants (unique key per
//! source, monotonic state) are enforced in one place.
//!
//! # Degraded mode
//!
//! Reads that gate work (`should_fetch`, `get_processed_keys`,
//! `get_conditional_headers`, `quota_used`) never fail. When the store is
//! unreachable they log a warning and answer as if nothing had been
//! processed yet: redundant work is preferred over silently skipped work.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::models::{ConditionalHeaders, CrawlRecord, CrawlState, RunRecord, StateCounts};
use crate::store::{LedgerStore, LockInfo};

/// Errors returned by mutating ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid transition for {source_name}/{key}: {from} -> {to}")]
    InvalidTransition {
        source_name: String,
        key: String,
        from: CrawlState,
        to: CrawlState,
    },
    #[error("no ledger record for {source_name}/{key}")]
    UnknownRecord { source_name: String, key: String },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Settled states: a record here is never refetched unless forced.
const SETTLED: [CrawlState; 2] = [CrawlState::Processed, CrawlState::Duplicate];

/// Crawl-state ledger with state-machine enforcement.
///
/// Construct once per process and share through an `Arc`.
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    holder_id: String,
    lock_ttl: Duration,
}

impl LedgerService {
    /// Create a service over `store`.
    ///
    /// `holder_id` identifies this process in the lock table; `lock_ttl` is
    /// how long a lock survives without a heartbeat before another holder
    /// may reclaim it.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        holder_id: impl Into<String>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            holder_id: holder_id.into(),
            lock_ttl,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ── Discovery-stage dedup ──────────────────────────────────────────

    /// Whether `key` must be fetched.
    ///
    /// Returns `false` only when a record exists in `processed` or
    /// `duplicate` and `force` is not set. Must be consulted before any
    /// network or API call for the resource.
    pub async fn should_fetch(&self, source: &str, key: &str, force: bool) -> bool {
        if force {
            return true;
        }
        match self.store.get_record(source, key).await {
            Ok(Some(record)) => !record.state.is_settled(),
            Ok(None) => true,
            Err(e) => {
                warn!(source, key, error = %e, "ledger unavailable, treating resource as unprocessed");
                true
            }
        }
    }

    /// Keys of `source` that are already processed or duplicate.
    ///
    /// Bulk variant of [`should_fetch`](Self::should_fetch) for filtering a
    /// freshly parsed batch in memory.
    pub async fn get_processed_keys(&self, source: &str, limit: Option<usize>) -> HashSet<String> {
        match self.store.keys_in_states(source, &SETTLED, limit).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(source, error = %e, "ledger unavailable, processing every discovered key");
                HashSet::new()
            }
        }
    }

    /// Validators from the last successful fetch of `key`.
    pub async fn get_conditional_headers(&self, source: &str, key: &str) -> ConditionalHeaders {
        match self.store.get_record(source, key).await {
            Ok(Some(record)) => record.conditional_headers(),
            Ok(None) => ConditionalHeaders::default(),
            Err(e) => {
                warn!(source, key, error = %e, "ledger unavailable, issuing unconditional fetch");
                ConditionalHeaders::default()
            }
        }
    }

    /// Lookup by content checksum, for sources without stable keys.
    pub async fn check_file_checksum(
        &self,
        checksum: &str,
        source: &str,
    ) -> LedgerResult<Option<CrawlRecord>> {
        Ok(self.store.find_by_checksum(source, checksum).await?)
    }

    pub async fn get_record(&self, source: &str, key: &str) -> LedgerResult<Option<CrawlRecord>> {
        Ok(self.store.get_record(source, key).await?)
    }

    // ── State transitions ──────────────────────────────────────────────

    /// Register `key` as discovered.
    ///
    /// Creates the record if absent. A `failed` record re-enters
    /// `discovered` (retry, bumping `retry_count`); a `processed` or
    /// `duplicate` record does so only when `force` is set. Records in
    /// `discovered` or `fetched` are left where they are. `metadata`
    /// entries are merged into the stored map.
    pub async fn record_discovery(
        &self,
        source: &str,
        key: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
        force: bool,
    ) -> LedgerResult<CrawlRecord> {
        let now = self.clock.now();
        let existing = self.store.get_record(source, key).await?;

        let mut record = match existing {
            None => {
                let mut record = CrawlRecord::discovered(source, key, now);
                record.metadata = metadata;
                self.store.put_record(&record).await?;
                return Ok(record);
            }
            Some(record) => record,
        };

        let before = record.clone();
        match record.state {
            CrawlState::Failed => {
                let retries = record.retry_count + 1;
                reset_to_discovered(&mut record, now, false);
                record.retry_count = retries;
            }
            CrawlState::Processed | CrawlState::Duplicate if force => {
                reset_to_discovered(&mut record, now, true);
            }
            _ => {}
        }
        for (k, v) in metadata {
            record.metadata.insert(k, v);
        }

        if record != before {
            self.store.put_record(&record).await?;
        }
        Ok(record)
    }

    /// `discovered → fetched`, storing the HTTP validators.
    ///
    /// Idempotent: a repeat call with the same arguments on an already
    /// fetched record writes nothing. A call with new validators on a
    /// fetched record refreshes them.
    pub async fn mark_fetched(
        &self,
        source: &str,
        key: &str,
        http_status: Option<u16>,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> LedgerResult<()> {
        let record = self.require(source, key).await?;
        if record.state == CrawlState::Fetched
            && record.http_status == http_status
            && record.etag.as_deref() == etag
            && record.last_modified.as_deref() == last_modified
        {
            return Ok(());
        }

        self.transition(record, CrawlState::Fetched, |r, now| {
            r.fetched_at = Some(now);
            r.http_status = http_status;
            r.etag = etag.map(str::to_string);
            r.last_modified = last_modified.map(str::to_string);
            r.error_message = None;
        })
        .await
    }

    /// `fetched → processed`.
    ///
    /// `output_id` is `None` when the record was handled but produced no
    /// output (e.g. rejected by a quality filter). The MinHash signature,
    /// when given, is stored alongside for later near-duplicate audits.
    pub async fn mark_processed(
        &self,
        source: &str,
        key: &str,
        text_hash: &str,
        output_id: Option<&str>,
        signature: Option<&[u32]>,
    ) -> LedgerResult<()> {
        let record = self.require(source, key).await?;
        if record.state == CrawlState::Processed {
            return Ok(());
        }
        self.transition(record, CrawlState::Processed, |r, now| {
            r.processed_at = Some(now);
            r.text_hash = Some(text_hash.to_string());
            r.output_id = output_id.map(str::to_string);
            r.minhash_signature = signature.map(<[u32]>::to_vec);
        })
        .await
    }

    /// `fetched|processed → duplicate`. The fetch cost was paid, but the
    /// record is excluded from output.
    pub async fn mark_duplicate(&self, source: &str, key: &str, text_hash: &str) -> LedgerResult<()> {
        let record = self.require(source, key).await?;
        if record.state == CrawlState::Duplicate {
            return Ok(());
        }
        self.transition(record, CrawlState::Duplicate, |r, now| {
            r.processed_at = Some(now);
            r.text_hash = Some(text_hash.to_string());
            r.output_id = None;
        })
        .await
    }

    /// `discovered|fetched → failed`. The record is retried on a later run.
    pub async fn mark_failed(&self, source: &str, key: &str, error_message: &str) -> LedgerResult<()> {
        let record = self.require(source, key).await?;
        self.transition(record, CrawlState::Failed, |r, _now| {
            r.error_message = Some(error_message.to_string());
        })
        .await
    }

    /// Administrative reset of one record back to `discovered`.
    ///
    /// Returns `false` if no such record exists.
    pub async fn force_reprocess(&self, source: &str, key: &str) -> LedgerResult<bool> {
        let Some(mut record) = self.store.get_record(source, key).await? else {
            return Ok(false);
        };
        reset_to_discovered(&mut record, self.clock.now(), true);
        self.store.put_record(&record).await?;
        Ok(true)
    }

    /// Administrative delete of every record of `source`.
    pub async fn reset_source(&self, source: &str) -> LedgerResult<u64> {
        let removed = self.store.delete_source(source).await?;
        debug!(source, removed, "ledger rows deleted");
        Ok(removed)
    }

    // ── Locks ──────────────────────────────────────────────────────────

    /// Try to take the advisory lock for `source`.
    ///
    /// Returns `false` when another holder has a live lock. A lock whose
    /// heartbeat is older than the TTL is considered stale and reclaimed.
    pub async fn acquire_source_lock(&self, source: &str) -> LedgerResult<bool> {
        let now = self.clock.now();
        let stale_before = now - self.lock_ttl;
        Ok(self
            .store
            .try_lock(source, &self.holder_id, now, stale_before)
            .await?)
    }

    pub async fn heartbeat_source_lock(&self, source: &str) -> LedgerResult<bool> {
        Ok(self
            .store
            .refresh_lock(source, &self.holder_id, self.clock.now())
            .await?)
    }

    pub async fn release_source_lock(&self, source: &str) -> LedgerResult<()> {
        Ok(self.store.unlock(source, &self.holder_id).await?)
    }

    pub async fn lock_info(&self, source: &str) -> LedgerResult<Option<LockInfo>> {
        Ok(self.store.lock_info(source).await?)
    }

    // ── Runs, quota, observability ─────────────────────────────────────

    pub async fn record_run(&self, run: &RunRecord) -> LedgerResult<()> {
        Ok(self.store.insert_run(run).await?)
    }

    pub async fn get_last_successful_run(&self, source: &str) -> LedgerResult<Option<DateTime<Utc>>> {
        Ok(self.store.last_successful_run(source).await?)
    }

    pub async fn get_statistics(&self, source: &str) -> LedgerResult<StateCounts> {
        Ok(self.store.count_by_state(source).await?)
    }

    /// Items already charged against `source`'s quota on `day`.
    pub async fn quota_used(&self, source: &str, day: NaiveDate) -> u64 {
        match self.store.quota_used(source, day).await {
            Ok(n) => n,
            Err(e) => {
                warn!(source, error = %e, "ledger unavailable, assuming no quota used today");
                0
            }
        }
    }

    pub async fn add_quota_usage(&self, source: &str, day: NaiveDate, n: u64) -> LedgerResult<u64> {
        Ok(self.store.add_quota(source, day, n).await?)
    }

    /// Hashes of the most recently processed records, for cache warm-up.
    pub async fn recent_text_hashes(&self, limit: usize) -> Vec<String> {
        match self.store.recent_text_hashes(limit).await {
            Ok(hashes) => hashes,
            Err(e) => {
                warn!(error = %e, "ledger unavailable, starting with a cold dedup cache");
                Vec::new()
            }
        }
    }

    // ── Internals ──────────────────────────────────────────────────────

    async fn require(&self, source: &str, key: &str) -> LedgerResult<CrawlRecord> {
        self.store
            .get_record(source, key)
            .await?
            .ok_or_else(|| LedgerError::UnknownRecord {
                source_name: source.to_string(),
                key: key.to_string(),
            })
    }

    async fn transition<F>(&self, mut record: CrawlRecord, to: CrawlState, apply: F) -> LedgerResult<()>
    where
        F: FnOnce(&mut CrawlRecord, DateTime<Utc>),
    {
        if !record.state.can_transition_to(to) {
            return Err(LedgerError::InvalidTransition {
                source_name: record.source,
                key: record.key,
                from: record.state,
                to,
            });
        }
        record.state = to;
        apply(&mut record, self.clock.now());
        self.store.put_record(&record).await?;
        Ok(())
    }
}

fn reset_to_discovered(record: &mut CrawlRecord, now: DateTime<Utc>, clear_validators: bool) {
    record.state = CrawlState::Discovered;
    record.discovered_at = now;
    record.fetched_at = None;
    record.processed_at = None;
    record.text_hash = None;
    record.minhash_signature = None;
    record.output_id = None;
    record.error_message = None;
    if clear_validators {
        record.http_status = None;
        record.etag = None;
        record.last_modified = None;
        record.retry_count = 0;
    }
}
