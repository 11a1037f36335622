//! Ledger status overview.
//!
//! `corpus status` prints, per source, the record counts by crawl state,
//! the last successful run, the current lock holder, the checkpoint resume
//! point and today's quota usage. Used to confirm that scheduled runs are
//! progressing without opening the database by hand.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use corpus_ledger_core::models::CrawlState;

use crate::checkpoint::CheckpointManager;
use crate::config::Config;
use crate::db;

/// Run the status command for one source or all configured ones.
pub async fn run_status(config: &Config, only: Option<&str>) -> Result<()> {
    let names: Vec<&String> = match only {
        Some(name) => match config.sources.get_key_value(name) {
            Some((key, _)) => vec![key],
            None => bail!("Unknown source: '{}'", name),
        },
        None => config.sources.keys().collect(),
    };

    let ledger = db::open_ledger(config).await?;
    let checkpoints = CheckpointManager::new(config.staging.root.clone());
    let policy = config.policy();
    let now = ledger.now();
    let today = now.date_naive();

    println!("Corpus Ledger Status");
    println!("====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!(
        "  Phase:       {}",
        if policy.in_initial_phase(now) {
            "initial collection"
        } else {
            "steady state"
        }
    );
    println!();

    println!(
        "  {:<20} {:>9} {:>9} {:>7} {:>7}   {:<14} {:<10} {:<12} {}",
        "SOURCE", "PROCESSED", "DUPLICATE", "FAILED", "PENDING", "LAST SUCCESS", "LOCK", "CHECKPOINT", "QUOTA"
    );
    println!("  {}", "-".repeat(104));

    for name in names {
        let counts = ledger.get_statistics(name).await?;
        let pending = counts.get(CrawlState::Discovered) + counts.get(CrawlState::Fetched);
        let last = ledger.get_last_successful_run(name).await?;
        let lock = ledger.lock_info(name).await?;
        let checkpoint = checkpoints.load(name).await;
        let marker = checkpoints.completion(name).await;

        let lock_display = match lock {
            Some(info) if info.holder == ledger.holder_id() => "self".to_string(),
            Some(info) => format!("held {}", format_relative(info.heartbeat_at, now)),
            None => "free".to_string(),
        };
        let checkpoint_display = match (checkpoint, marker) {
            (Some(cp), _) => format!("@{}", cp.last_offset),
            (None, Some(m)) => format!("done @{}", m.final_offset),
            (None, None) => "-".to_string(),
        };
        let limit = policy.quota_for(name);
        let used = ledger.quota_used(name, today).await;
        let quota_display = if limit == 0 {
            format!("{} / unlimited", used)
        } else {
            format!("{} / {}", used, limit)
        };

        println!(
            "  {:<20} {:>9} {:>9} {:>7} {:>7}   {:<14} {:<10} {:<12} {}",
            name,
            counts.processed,
            counts.duplicate,
            counts.failed,
            pending,
            last.map(|ts| format_relative(ts, now))
                .unwrap_or_else(|| "never".to_string()),
            lock_display,
            checkpoint_display,
            quota_display
        );
    }

    println!();
    Ok(())
}

/// Format a timestamp relative to `now` (e.g. "3 hours ago").
fn format_relative(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - ts).num_seconds();

    if delta < 0 {
        return format_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_iso(ts)
    }
}

fn format_iso(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_format_relative() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(format_relative(now - Duration::seconds(5), now), "just now");
        assert_eq!(format_relative(now - Duration::minutes(1), now), "1 min ago");
        assert_eq!(format_relative(now - Duration::hours(3), now), "3 hours ago");
        assert_eq!(format_relative(now - Duration::days(2), now), "2 days ago");
        assert_eq!(format_relative(now - Duration::days(40), now), "2026-01-29 12:00");
        assert_eq!(format_relative(now + Duration::hours(1), now), "2026-03-10 13:00");
    }
}
