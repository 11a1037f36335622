//! SQLite-backed [`LedgerStore`] implementation.
//!
//! Every mutating method is a single SQL statement, so a failed attempt
//! leaves nothing behind and can be retried. Transient failures (busy or
//! locked database, pool timeout, I/O) are retried with exponential
//! backoff up to the configured bound; anything else surfaces at once.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use corpus_ledger_core::models::{CrawlRecord, CrawlState, RunRecord, RunStatus, StateCounts};
use corpus_ledger_core::store::{LedgerStore, LockInfo};

const UPSERT_RECORD: &str = r#"
    INSERT INTO crawl_records (source, key, state, discovered_at, fetched_at, processed_at,
                               http_status, etag, last_modified, text_hash, minhash_signature,
                               output_id, error_message, retry_count, checksum, metadata_json)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(source, key) DO UPDATE SET
        state = excluded.state,
        discovered_at = excluded.discovered_at,
        fetched_at = excluded.fetched_at,
        processed_at = excluded.processed_at,
        http_status = excluded.http_status,
        etag = excluded.etag,
        last_modified = excluded.last_modified,
        text_hash = excluded.text_hash,
        minhash_signature = excluded.minhash_signature,
        output_id = excluded.output_id,
        error_message = excluded.error_message,
        retry_count = excluded.retry_count,
        checksum = excluded.checksum,
        metadata_json = excluded.metadata_json
"#;

/// SQLite implementation of the [`LedgerStore`] trait.
pub struct SqliteLedgerStore {
    pool: SqlitePool,
    write_retries: u32,
    backoff: Duration,
}

impl SqliteLedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_retries: 3,
            backoff: Duration::from_millis(50),
        }
    }

    /// Retry transient write failures `retries` extra times, starting at
    /// `backoff_ms` and doubling.
    pub fn with_retry(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.write_retries = retries;
        self.backoff = Duration::from_millis(backoff_ms);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn retry_write<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut retries = 0u32;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if retries < self.write_retries && is_transient(&e) => {
                    retries += 1;
                    let delay = self.backoff * (1u32 << (retries - 1).min(6));
                    warn!(op, retries, error = %e, "Transient ledger write failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("ledger write '{}' failed", op)));
                }
            }
        }
    }
}

/// Busy/locked database, exhausted pool or I/O: worth another attempt.
fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let code_busy = matches!(db.code().as_deref(), Some("5") | Some("6") | Some("517"));
            let message = db.message().to_lowercase();
            code_busy || message.contains("database is locked") || message.contains("busy")
        }
        _ => false,
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Little-endian `u32` packing for MinHash signatures.
pub fn signature_to_blob(sig: &[u32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(sig.len() * 4);
    for v in sig {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

pub fn blob_to_signature(blob: &[u8]) -> Vec<u32> {
    blob.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn row_to_record(row: &SqliteRow) -> Result<CrawlRecord> {
    let state: String = row.get("state");
    let metadata_json: String = row.get("metadata_json");
    let metadata = match serde_json::from_str::<serde_json::Value>(&metadata_json)
        .with_context(|| format!("corrupt metadata_json: {}", metadata_json))?
    {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    let signature: Option<Vec<u8>> = row.get("minhash_signature");

    Ok(CrawlRecord {
        key: row.get("key"),
        source: row.get("source"),
        state: state.parse()?,
        discovered_at: from_millis(row.get("discovered_at")),
        fetched_at: row.get::<Option<i64>, _>("fetched_at").map(from_millis),
        processed_at: row.get::<Option<i64>, _>("processed_at").map(from_millis),
        http_status: row.get::<Option<i64>, _>("http_status").map(|s| s as u16),
        etag: row.get("etag"),
        last_modified: row.get("last_modified"),
        text_hash: row.get("text_hash"),
        minhash_signature: signature.map(|b| blob_to_signature(&b)),
        output_id: row.get("output_id"),
        error_message: row.get("error_message"),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        metadata,
    })
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn get_record(&self, source: &str, key: &str) -> Result<Option<CrawlRecord>> {
        let row = sqlx::query("SELECT * FROM crawl_records WHERE source = ? AND key = ?")
            .bind(source)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn put_record(&self, record: &CrawlRecord) -> Result<()> {
        let metadata_json = serde_json::to_string(&record.metadata)?;
        let signature = record.minhash_signature.as_deref().map(signature_to_blob);
        let metadata_json = metadata_json.as_str();
        let signature = signature.as_deref();
        let pool = &self.pool;

        self.retry_write("put_record", move || async move {
            sqlx::query(UPSERT_RECORD)
                .bind(&record.source)
                .bind(&record.key)
                .bind(record.state.as_str())
                .bind(record.discovered_at.timestamp_millis())
                .bind(record.fetched_at.map(|t| t.timestamp_millis()))
                .bind(record.processed_at.map(|t| t.timestamp_millis()))
                .bind(record.http_status.map(|s| s as i64))
                .bind(&record.etag)
                .bind(&record.last_modified)
                .bind(&record.text_hash)
                .bind(signature)
                .bind(&record.output_id)
                .bind(&record.error_message)
                .bind(record.retry_count as i64)
                .bind(record.checksum())
                .bind(metadata_json)
                .execute(pool)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn find_by_checksum(
        &self,
        source: &str,
        checksum: &str,
    ) -> Result<Option<CrawlRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM crawl_records
            WHERE source = ? AND checksum = ?
            ORDER BY state IN ('processed', 'duplicate') DESC,
                     COALESCE(processed_at, fetched_at, discovered_at) DESC
            LIMIT 1
            "#,
        )
        .bind(source)
        .bind(checksum)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn keys_in_states(
        &self,
        source: &str,
        states: &[CrawlState],
        limit: Option<usize>,
    ) -> Result<HashSet<String>> {
        if states.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!(
            "SELECT key FROM crawl_records WHERE source = ? AND state IN ({}) LIMIT ?",
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(source);
        for state in states {
            query = query.bind(state.as_str());
        }
        // LIMIT -1 means no limit in SQLite.
        let rows = query
            .bind(limit.map(|n| n as i64).unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("key")).collect())
    }

    async fn recent_text_hashes(&self, limit: usize) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT text_hash FROM crawl_records
            WHERE state = 'processed' AND text_hash IS NOT NULL AND output_id IS NOT NULL
            ORDER BY processed_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("text_hash")).collect())
    }

    async fn count_by_state(&self, source: &str) -> Result<StateCounts> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS n FROM crawl_records
            WHERE source = ? AND json_extract(metadata_json, '$.upstream') IS NULL
            GROUP BY state
            "#,
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StateCounts::default();
        for row in &rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            counts.add(state.parse()?, n as u64);
        }
        Ok(counts)
    }

    async fn delete_source(&self, source: &str) -> Result<u64> {
        let pool = &self.pool;
        self.retry_write("delete_source", move || async move {
            sqlx::query("DELETE FROM crawl_records WHERE source = ?")
                .bind(source)
                .execute(pool)
                .await
                .map(|r| r.rows_affected())
        })
        .await
    }

    async fn try_lock(
        &self,
        source: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let pool = &self.pool;
        let now_ms = now.timestamp_millis();
        let stale_ms = stale_before.timestamp_millis();
        // The conditional upsert claims a free, own or stale lock in one
        // statement; a live foreign lock leaves the row untouched.
        let affected = self
            .retry_write("try_lock", move || async move {
                sqlx::query(
                    r#"
                    INSERT INTO source_locks (source, holder, acquired_at, heartbeat_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(source) DO UPDATE SET
                        holder = excluded.holder,
                        acquired_at = excluded.acquired_at,
                        heartbeat_at = excluded.heartbeat_at
                    WHERE source_locks.holder = excluded.holder
                       OR source_locks.heartbeat_at < ?
                    "#,
                )
                .bind(source)
                .bind(holder)
                .bind(now_ms)
                .bind(now_ms)
                .bind(stale_ms)
                .execute(pool)
                .await
                .map(|r| r.rows_affected())
            })
            .await?;
        Ok(affected > 0)
    }

    async fn refresh_lock(&self, source: &str, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let pool = &self.pool;
        let now_ms = now.timestamp_millis();
        let affected = self
            .retry_write("refresh_lock", move || async move {
                sqlx::query(
                    "UPDATE source_locks SET heartbeat_at = ? WHERE source = ? AND holder = ?",
                )
                .bind(now_ms)
                .bind(source)
                .bind(holder)
                .execute(pool)
                .await
                .map(|r| r.rows_affected())
            })
            .await?;
        Ok(affected > 0)
    }

    async fn unlock(&self, source: &str, holder: &str) -> Result<()> {
        let pool = &self.pool;
        self.retry_write("unlock", move || async move {
            sqlx::query("DELETE FROM source_locks WHERE source = ? AND holder = ?")
                .bind(source)
                .bind(holder)
                .execute(pool)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn lock_info(&self, source: &str) -> Result<Option<LockInfo>> {
        let row = sqlx::query("SELECT * FROM source_locks WHERE source = ?")
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| LockInfo {
            source: r.get("source"),
            holder: r.get("holder"),
            acquired_at: from_millis(r.get("acquired_at")),
            heartbeat_at: from_millis(r.get("heartbeat_at")),
        }))
    }

    async fn insert_run(&self, run: &RunRecord) -> Result<()> {
        let metrics_json = serde_json::to_string(&run.metrics)?;
        let metrics_json = metrics_json.as_str();
        let pool = &self.pool;
        self.retry_write("insert_run", move || async move {
            sqlx::query(
                r#"
                INSERT INTO source_runs (run_id, source, started_at, finished_at, status, reason, metrics_json)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(run_id) DO UPDATE SET
                    finished_at = excluded.finished_at,
                    status = excluded.status,
                    reason = excluded.reason,
                    metrics_json = excluded.metrics_json
                "#,
            )
            .bind(&run.run_id)
            .bind(&run.source)
            .bind(run.started_at.timestamp_millis())
            .bind(run.finished_at.timestamp_millis())
            .bind(run.status.as_str())
            .bind(&run.reason)
            .bind(metrics_json)
            .execute(pool)
            .await
            .map(|_| ())
        })
        .await
    }

    async fn last_successful_run(&self, source: &str) -> Result<Option<DateTime<Utc>>> {
        let ts: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(finished_at) FROM source_runs WHERE source = ? AND status = ?",
        )
        .bind(source)
        .bind(RunStatus::Success.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(ts.map(from_millis))
    }

    async fn quota_used(&self, source: &str, day: NaiveDate) -> Result<u64> {
        let used: Option<i64> =
            sqlx::query_scalar("SELECT used FROM quota_usage WHERE source = ? AND day = ?")
                .bind(source)
                .bind(day.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(used.unwrap_or(0) as u64)
    }

    async fn add_quota(&self, source: &str, day: NaiveDate, n: u64) -> Result<u64> {
        let pool = &self.pool;
        let day = day.to_string();
        let day = day.as_str();
        let total: i64 = self
            .retry_write("add_quota", move || async move {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO quota_usage (source, day, used) VALUES (?, ?, ?)
                    ON CONFLICT(source, day) DO UPDATE SET used = used + excluded.used
                    RETURNING used
                    "#,
                )
                .bind(source)
                .bind(day)
                .bind(n as i64)
                .fetch_one(pool)
                .await
            })
            .await?;
        Ok(total as u64)
    }
}
