//! SQLite connection management.
//!
//! Provides a connection pool to the ledger database with WAL mode
//! enabled, so the orchestrator's concurrent source pipelines can read
//! while one of them writes. The database file and its parent
//! directories are created automatically if they don't exist.
//!
//! A busy timeout makes SQLite wait for a competing writer instead of
//! failing immediately; whatever still fails with `SQLITE_BUSY` is retried
//! by [`SqliteLedgerStore`](crate::sqlite_store::SqliteLedgerStore).

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use corpus_ledger_core::clock::SystemClock;
use corpus_ledger_core::ledger::LedgerService;

use crate::config::Config;
use crate::migrate;
use crate::sqlite_store::SqliteLedgerStore;

/// Create a connection pool to the configured SQLite database.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open ledger database: {}", db_path.display()))?;

    Ok(pool)
}

/// Open the ledger (schema applied) and wrap it in a [`LedgerService`].
///
/// The lock holder id is unique per process.
pub async fn open_ledger(config: &Config) -> Result<Arc<LedgerService>> {
    let pool = connect(config).await?;
    migrate::apply_schema(&pool).await?;

    let store = SqliteLedgerStore::new(pool)
        .with_retry(config.db.write_retries, config.db.retry_backoff_ms);
    let holder_id = format!("pid{}-{}", std::process::id(), uuid::Uuid::new_v4());
    let ttl = chrono::Duration::seconds(config.orchestration.lock_ttl_seconds as i64);

    Ok(Arc::new(LedgerService::new(
        Arc::new(store),
        Arc::new(SystemClock),
        holder_id,
        ttl,
    )))
}
