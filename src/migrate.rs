//! Ledger schema.
//!
//! All statements are `IF NOT EXISTS`, so applying the schema is idempotent
//! and runs on every open. Timestamps are stored as Unix milliseconds.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// `corpus init`: create the database file and schema.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // One row per tracked resource. `checksum` mirrors metadata["checksum"]
    // so content lookups can use an index.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS crawl_records (
            source TEXT NOT NULL,
            key TEXT NOT NULL,
            state TEXT NOT NULL,
            discovered_at INTEGER NOT NULL,
            fetched_at INTEGER,
            processed_at INTEGER,
            http_status INTEGER,
            etag TEXT,
            last_modified TEXT,
            text_hash TEXT,
            minhash_signature BLOB,
            output_id TEXT,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            checksum TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (source, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_locks (
            source TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            heartbeat_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_runs (
            run_id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            reason TEXT,
            metrics_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS quota_usage (
            source TEXT NOT NULL,
            day TEXT NOT NULL,
            used INTEGER NOT NULL,
            PRIMARY KEY (source, day)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_source_state ON crawl_records(source, state)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_source_checksum ON crawl_records(source, checksum)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_processed_at ON crawl_records(processed_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_runs_source_status ON source_runs(source, status, finished_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
