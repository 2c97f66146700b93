//! Before/after snapshot comparison around externally risky operations.

use anyhow::Result;
use tracing::info;

/// Raised when a risky operation collapses the record count past the
/// tolerance. Fatal for the synchronization pipeline: the operation may
/// already have discarded working-tree state, so it is never auto-retried.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("[GR900] integrity violation during {label}: record count collapsed from {before} to {after}")]
pub struct IntegrityViolation {
    pub label: String,
    pub before: u64,
    pub after: u64,
}

/// Wraps a risky operation with total-count snapshots.
///
/// The tolerance absorbs benign churn (some legitimate operations
/// transiently reduce counts); it is a heuristic against catastrophic
/// loss, not exact-equality enforcement, and every evaluation is logged so
/// the threshold can be tuned from history.
#[derive(Debug, Clone, Copy)]
pub struct IntegrityGuard {
    tolerance: f64,
}

impl IntegrityGuard {
    #[must_use]
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    /// Snapshot `read_total` before and after `op`; fail with
    /// [`IntegrityViolation`] when the count drops below
    /// `before * tolerance`. An error from `op` itself propagates
    /// unchanged without the after-check.
    pub fn guard<T>(
        &self,
        label: &str,
        read_total: impl Fn() -> Result<u64>,
        op: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let before = read_total()?;
        let out = op()?;
        let after = read_total()?;

        let floor = (before as f64) * self.tolerance;
        let violated = before > 0 && (after as f64) < floor;
        info!(
            label,
            before,
            after,
            tolerance = self.tolerance,
            violated,
            "integrity guard evaluation"
        );
        if violated {
            return Err(IntegrityViolation {
                label: label.to_string(),
                before,
                after,
            }
            .into());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn run_guard(before: u64, after: u64) -> Result<()> {
        let count = Cell::new(before);
        let guard = IntegrityGuard::new(0.95);
        guard.guard(
            "test",
            || Ok(count.get()),
            || {
                count.set(after);
                Ok(())
            },
        )
    }

    #[test]
    fn six_percent_drop_trips_the_guard() {
        let err = run_guard(1000, 940).unwrap_err();
        let violation = err
            .downcast_ref::<IntegrityViolation>()
            .expect("IntegrityViolation");
        assert_eq!(violation.before, 1000);
        assert_eq!(violation.after, 940);
    }

    #[test]
    fn four_percent_drop_is_tolerated() {
        run_guard(1000, 960).expect("within tolerance");
    }

    #[test]
    fn growth_and_empty_baselines_pass() {
        run_guard(1000, 1500).expect("growth is fine");
        run_guard(0, 0).expect("empty store is fine");
        run_guard(0, 10).expect("first fill is fine");
    }

    #[test]
    fn operation_errors_propagate_without_after_check() {
        let guard = IntegrityGuard::new(0.95);
        let err = guard
            .guard("test", || Ok(10), || -> Result<()> { anyhow::bail!("boom") })
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
