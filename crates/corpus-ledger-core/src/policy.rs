//! Per-source run decisions: initial collection window, cadence, force.
//!
//! The decision is a pure function of configuration, the current time and
//! the ledger's last successful run, so it is tested without a store.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Why a source runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunReason {
    Forced,
    InitialCollectionPhase,
    FirstRun,
    CadenceElapsed,
}

impl RunReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunReason::Forced => "forced",
            RunReason::InitialCollectionPhase => "initial_collection_phase",
            RunReason::FirstRun => "first_run",
            RunReason::CadenceElapsed => "cadence_elapsed",
        }
    }
}

/// Why a source is skipped. Skips are not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Cadence not yet elapsed; `remaining` is the wait until it is.
    RefreshNotDue { remaining: Duration },
    /// Another holder owns the source lock.
    ConcurrentRunActive,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::RefreshNotDue { .. } => "refresh_not_due",
            SkipReason::ConcurrentRunActive => "concurrent_run_active",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDecision {
    Run(RunReason),
    Skip(SkipReason),
}

impl RunDecision {
    pub fn should_run(&self) -> bool {
        matches!(self, RunDecision::Run(_))
    }

    pub fn reason(&self) -> &'static str {
        match self {
            RunDecision::Run(r) => r.as_str(),
            RunDecision::Skip(s) => s.as_str(),
        }
    }
}

impl fmt::Display for RunDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunDecision::Skip(SkipReason::RefreshNotDue { remaining }) => {
                write!(f, "refresh_not_due ({}h remaining)", remaining.num_hours())
            }
            other => f.write_str(other.reason()),
        }
    }
}

/// Orchestration settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct OrchestrationPolicy {
    pub project_start: NaiveDate,
    pub initial_collection_days: u32,
    pub default_cadence_days: u32,
    /// Per-source cadence overrides.
    pub cadence_days: HashMap<String, u32>,
    /// Per-source daily quotas; absent or 0 means unlimited.
    pub daily_quota: HashMap<String, u64>,
}

impl OrchestrationPolicy {
    pub fn cadence_for(&self, source: &str) -> u32 {
        self.cadence_days
            .get(source)
            .copied()
            .unwrap_or(self.default_cadence_days)
    }

    pub fn quota_for(&self, source: &str) -> u64 {
        self.daily_quota.get(source).copied().unwrap_or(0)
    }

    /// Whether `now` falls within `initial_collection_days` of the project
    /// start (start day inclusive).
    pub fn in_initial_phase(&self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        let end = self.project_start + Duration::days(self.initial_collection_days as i64);
        today >= self.project_start && today < end
    }

    /// Decide whether `source` runs now.
    ///
    /// `force` bypasses every rule. During the initial collection window
    /// every source runs. Afterwards a source runs once at least
    /// `cadence_days` have passed since its last successful run, or when it
    /// has never succeeded.
    pub fn should_run_source(
        &self,
        source: &str,
        now: DateTime<Utc>,
        last_successful_run: Option<DateTime<Utc>>,
        force: bool,
    ) -> RunDecision {
        if force {
            return RunDecision::Run(RunReason::Forced);
        }
        if self.in_initial_phase(now) {
            return RunDecision::Run(RunReason::InitialCollectionPhase);
        }
        let Some(last) = last_successful_run else {
            return RunDecision::Run(RunReason::FirstRun);
        };
        let cadence = Duration::days(self.cadence_for(source) as i64);
        let elapsed = now - last;
        if elapsed >= cadence {
            RunDecision::Run(RunReason::CadenceElapsed)
        } else {
            RunDecision::Skip(SkipReason::RefreshNotDue {
                remaining: cadence - elapsed,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> OrchestrationPolicy {
        let mut cadence_days = HashMap::new();
        cadence_days.insert("news".to_string(), 7);
        OrchestrationPolicy {
            project_start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            initial_collection_days: 7,
            default_cadence_days: 1,
            cadence_days,
            daily_quota: HashMap::new(),
        }
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_cadence_gating() {
        let p = policy();
        let now = at(2026, 3, 1);

        let d = p.should_run_source("news", now, Some(now - Duration::days(3)), false);
        assert!(!d.should_run());
        assert_eq!(d.reason(), "refresh_not_due");
        assert_eq!(
            d,
            RunDecision::Skip(SkipReason::RefreshNotDue {
                remaining: Duration::days(4)
            })
        );

        let d = p.should_run_source("news", now, Some(now - Duration::days(8)), false);
        assert_eq!(d, RunDecision::Run(RunReason::CadenceElapsed));
    }

    #[test]
    fn test_exactly_cadence_runs() {
        let p = policy();
        let now = at(2026, 3, 1);
        let d = p.should_run_source("news", now, Some(now - Duration::days(7)), false);
        assert_eq!(d.reason(), "cadence_elapsed");
    }

    #[test]
    fn test_initial_collection_phase_overrides_cadence() {
        let p = policy();
        let now = at(2026, 1, 5);
        let d = p.should_run_source("news", now, Some(now - Duration::hours(1)), false);
        assert_eq!(d, RunDecision::Run(RunReason::InitialCollectionPhase));

        // Day 8 is past a 7-day window.
        let now = at(2026, 1, 8);
        let d = p.should_run_source("news", now, Some(now - Duration::hours(1)), false);
        assert!(!d.should_run());
    }

    #[test]
    fn test_force_bypasses_everything() {
        let p = policy();
        let now = at(2026, 3, 1);
        let d = p.should_run_source("news", now, Some(now), true);
        assert_eq!(d, RunDecision::Run(RunReason::Forced));
    }

    #[test]
    fn test_never_run_source_runs() {
        let p = policy();
        let d = p.should_run_source("news", at(2026, 3, 1), None, false);
        assert_eq!(d.reason(), "first_run");
    }

    #[test]
    fn test_default_cadence_and_quota() {
        let p = policy();
        assert_eq!(p.cadence_for("unknown"), 1);
        assert_eq!(p.cadence_for("news"), 7);
        assert_eq!(p.quota_for("news"), 0);
    }
}
