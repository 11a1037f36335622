use tracing::info;

/// Tracks items consumed against a source's daily quota.
///
/// Seeded with what earlier invocations already used on the same UTC day so
/// separate processes share the budget. A limit of 0 means unlimited.
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    limit: u64,
    used: u64,
}

impl QuotaTracker {
    pub fn new(limit: u64, already_used: u64) -> Self {
        Self {
            limit,
            used: already_used,
        }
    }

    /// Whether quota tracking is active (limit > 0).
    pub fn is_active(&self) -> bool {
        self.limit > 0
    }

    /// `used >= limit` with an active limit.
    pub fn is_exhausted(&self) -> bool {
        self.is_active() && self.used >= self.limit
    }

    /// Consume one item. Returns `false`, consuming nothing, once exhausted.
    pub fn try_consume(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Items left today (`u64::MAX` if unlimited).
    pub fn remaining(&self) -> u64 {
        if !self.is_active() {
            return u64::MAX;
        }
        self.limit.saturating_sub(self.used)
    }

    pub fn log_status(&self, source: &str) {
        if self.is_active() {
            info!(
                source,
                used = self.used,
                remaining = self.remaining(),
                limit = self.limit,
                "Quota status"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_quota_never_exhausts() {
        let mut quota = QuotaTracker::new(0, 0);
        for _ in 0..10_000 {
            assert!(quota.try_consume());
        }
        assert!(!quota.is_exhausted());
        assert_eq!(quota.remaining(), u64::MAX);
    }

    #[test]
    fn quota_hard_stops_at_limit() {
        let mut quota = QuotaTracker::new(3, 0);
        assert!(quota.try_consume());
        assert!(quota.try_consume());
        assert!(quota.try_consume());
        assert!(quota.is_exhausted());
        assert!(!quota.try_consume());
        assert_eq!(quota.used(), 3);
        assert_eq!(quota.remaining(), 0);
    }

    #[test]
    fn quota_seeded_from_earlier_usage() {
        let mut quota = QuotaTracker::new(5, 4);
        assert_eq!(quota.remaining(), 1);
        assert!(quota.try_consume());
        assert!(!quota.try_consume());

        let over = QuotaTracker::new(5, 9);
        assert!(over.is_exhausted());
        assert_eq!(over.remaining(), 0);
    }
}
