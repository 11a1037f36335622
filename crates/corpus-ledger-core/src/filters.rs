//! Typed record filters applied after a source's process step.
//!
//! Filters are concrete structs with their parameters as fields, collected
//! into an ordered [`FilterRegistry`] at startup. A filter that cannot
//! decide (missing timestamp, unparseable field) keeps the record.

use chrono::{DateTime, Utc};

use crate::models::CleanRecord;

pub trait RecordFilter: Send + Sync {
    /// Stable name reported when this filter rejects a record.
    fn name(&self) -> &'static str;

    /// `true` to keep the record.
    fn keep(&self, record: &CleanRecord) -> bool;
}

/// Rejects records whose trimmed text has fewer than `min_chars` characters.
#[derive(Debug, Clone)]
pub struct MinLengthFilter {
    pub min_chars: usize,
}

impl RecordFilter for MinLengthFilter {
    fn name(&self) -> &'static str {
        "min_length"
    }

    fn keep(&self, record: &CleanRecord) -> bool {
        record.text.trim().chars().count() >= self.min_chars
    }
}

/// Incremental filter: rejects records timestamped before `since`.
/// Records without a timestamp are kept.
#[derive(Debug, Clone)]
pub struct SinceFilter {
    pub since: DateTime<Utc>,
}

impl RecordFilter for SinceFilter {
    fn name(&self) -> &'static str {
        "since"
    }

    fn keep(&self, record: &CleanRecord) -> bool {
        match record.timestamp {
            Some(ts) => ts >= self.since,
            None => true,
        }
    }
}

/// Ordered list of filters; the first rejection wins.
#[derive(Default)]
pub struct FilterRegistry {
    filters: Vec<Box<dyn RecordFilter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, filter: Box<dyn RecordFilter>) {
        self.filters.push(filter);
    }

    /// Name of the first filter rejecting `record`, or `None` if all keep it.
    pub fn rejected_by(&self, record: &CleanRecord) -> Option<&'static str> {
        self.filters
            .iter()
            .find(|f| !f.keep(record))
            .map(|f| f.name())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn registry() -> FilterRegistry {
        let mut registry = FilterRegistry::new();
        registry.register(Box::new(MinLengthFilter { min_chars: 10 }));
        registry.register(Box::new(SinceFilter {
            since: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }));
        registry
    }

    #[test]
    fn test_order_and_first_rejection() {
        let registry = registry();
        assert_eq!(registry.names(), vec!["min_length", "since"]);

        let mut short_and_old = CleanRecord::new("k", "tiny");
        short_and_old.timestamp = Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(registry.rejected_by(&short_and_old), Some("min_length"));

        let mut old = CleanRecord::new("k", "long enough text here");
        old.timestamp = Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(registry.rejected_by(&old), Some("since"));
    }

    #[test]
    fn test_missing_timestamp_is_kept() {
        let registry = registry();
        let record = CleanRecord::new("k", "long enough text here");
        assert_eq!(registry.rejected_by(&record), None);
    }

    #[test]
    fn test_empty_registry_keeps_everything() {
        let registry = FilterRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.rejected_by(&CleanRecord::new("k", "")), None);
    }
}
