//! Outcome of an orchestration run.

use chrono::{DateTime, Utc};
use serde::Serialize;

use corpus_ledger_core::models::RunStatus;

/// Per-source counters, persisted as the run's `metrics_json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceMetrics {
    pub candidates: u64,
    pub skipped_known: u64,
    pub fetched: u64,
    pub not_modified: u64,
    pub processed: u64,
    pub exact_duplicates: u64,
    pub near_duplicates: u64,
    pub filtered: u64,
    pub failed: u64,
    /// Items whose ledger record moved under this run; left as found.
    pub conflicts: u64,
    pub quota_hit: bool,
    pub quota_limit: u64,
    pub quota_used: u64,
    /// Discovered items left unfetched when the quota stopped the run.
    pub items_remaining: u64,
    pub upstream_unchanged: bool,
    pub interrupted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_from_offset: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source: String,
    pub status: RunStatus,
    pub reason: Option<String>,
    /// `None` for skipped sources; skips are not persisted as runs.
    pub run_id: Option<String>,
    pub metrics: SourceMetrics,
}

impl SourceOutcome {
    pub fn skipped(source: &str, reason: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            status: RunStatus::Skipped,
            reason: Some(reason.into()),
            run_id: None,
            metrics: SourceMetrics::default(),
        }
    }

    pub fn failed(source: &str, reason: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            status: RunStatus::Failed,
            reason: Some(reason.into()),
            run_id: None,
            metrics: SourceMetrics::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceOutcome>,
}

impl RunReport {
    pub fn outcome(&self, source: &str) -> Option<&SourceOutcome> {
        self.sources.iter().find(|o| o.source == source)
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.sources.iter().filter(|o| o.status == status).count()
    }

    /// `1` if any source failed, `0` otherwise. Skips are not failures.
    pub fn exit_code(&self) -> i32 {
        if self.count(RunStatus::Failed) > 0 {
            1
        } else {
            0
        }
    }

    pub fn print_human(&self) {
        println!(
            "{:<20} {:<8} {:>8} {:>8} {:>6} {:>6} {:>6}   REASON",
            "SOURCE", "STATUS", "FETCHED", "WRITTEN", "DUPS", "FAILED", "LEFT"
        );
        println!("{}", "-".repeat(90));
        for o in &self.sources {
            let m = &o.metrics;
            println!(
                "{:<20} {:<8} {:>8} {:>8} {:>6} {:>6} {:>6}   {}",
                o.source,
                o.status.as_str(),
                m.fetched,
                m.processed,
                m.exact_duplicates + m.near_duplicates + m.not_modified,
                m.failed,
                m.items_remaining,
                o.reason.as_deref().unwrap_or("")
            );
        }
        println!();
        println!(
            "{} succeeded, {} skipped, {} failed in {:.1}s",
            self.count(RunStatus::Success),
            self.count(RunStatus::Skipped),
            self.count(RunStatus::Failed),
            (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
        );
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(statuses: &[RunStatus]) -> RunReport {
        let now = Utc::now();
        RunReport {
            started_at: now,
            finished_at: now,
            sources: statuses
                .iter()
                .enumerate()
                .map(|(i, status)| SourceOutcome {
                    source: format!("s{}", i),
                    status: *status,
                    reason: None,
                    run_id: None,
                    metrics: SourceMetrics::default(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_exit_code_ignores_skips() {
        assert_eq!(report(&[RunStatus::Success, RunStatus::Skipped]).exit_code(), 0);
        assert_eq!(report(&[RunStatus::Success, RunStatus::Failed]).exit_code(), 1);
    }

    #[test]
    fn test_json_shape() {
        let json = report(&[RunStatus::Skipped]).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["sources"][0]["status"], "skipped");
        assert_eq!(value["sources"][0]["metrics"]["quota_hit"], false);
    }
}
