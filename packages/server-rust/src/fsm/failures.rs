//! Tracker for entities presumed failed.
//!
//! Ids enter on an explicit failure report (typically a restore that did
//! not deliver the file) and leave on an explicit success report. Absence
//! means "no known failure", not "confirmed success".

use dashmap::DashSet;

use crate::error::{GatewayError, Result};

#[derive(Default)]
pub struct FailureTracker {
    failed: DashSet<i64>,
}

impl FailureTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, id: i64) {
        if self.failed.remove(&id).is_some() {
            tracing::debug!(id, "marking OK");
        }
    }

    pub fn record_failure(&self, id: i64) {
        if self.failed.insert(id) {
            tracing::debug!(id, "marking as failure");
        }
    }

    #[must_use]
    pub fn is_failed(&self, id: i64) -> bool {
        self.failed.contains(&id)
    }

    /// Fail fast if the id is in the failed set.
    ///
    /// # Errors
    ///
    /// Returns an internal fault naming the entity; callers surface it
    /// instead of retrying indefinitely.
    pub fn check(&self, id: i64) -> Result<()> {
        if self.failed.contains(&id) {
            return Err(GatewayError::Internal(anyhow::anyhow!(
                "restore of {id} failed previously"
            )));
        }
        Ok(())
    }

    /// Sorted snapshot of the failed ids for the status report.
    #[must_use]
    pub fn snapshot(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.failed.iter().map(|e| *e).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_round_trip() {
        let tracker = FailureTracker::new();
        assert!(tracker.check(5).is_ok());

        tracker.record_failure(5);
        assert!(tracker.check(5).is_err());
        assert!(tracker.is_failed(5));

        tracker.record_success(5);
        assert!(tracker.check(5).is_ok());
        assert!(!tracker.is_failed(5));
    }

    #[test]
    fn success_on_unknown_id_is_silent() {
        let tracker = FailureTracker::new();
        tracker.record_success(99);
        assert!(tracker.check(99).is_ok());
    }

    #[test]
    fn snapshot_is_sorted() {
        let tracker = FailureTracker::new();
        for id in [9, 1, 5] {
            tracker.record_failure(id);
        }
        assert_eq!(tracker.snapshot(), vec![1, 5, 9]);
    }
}
