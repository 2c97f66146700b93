use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// High-water mark consulted before a bulk export is accepted.
///
/// `max_record_count` only ever moves up; the audit fields are overwritten
/// each time it advances.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetState {
    pub max_record_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub updated_by: String,
}

impl RatchetState {
    #[must_use]
    pub fn new(updated_by: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            max_record_count: 0,
            updated_at: now,
            updated_by: updated_by.into(),
        }
    }

    /// Raise the high-water mark if `count` exceeds it. Returns whether the
    /// mark moved; audit fields are only touched on an actual advance.
    pub fn advance(&mut self, count: u64, updated_by: &str, now: OffsetDateTime) -> bool {
        if count <= self.max_record_count {
            return false;
        }
        self.max_record_count = count;
        self.updated_at = now;
        self.updated_by = updated_by.to_string();
        true
    }
}

/// Mirror repository health, refreshed every synchronization cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceState {
    /// Unix seconds of the last weekly cleanup; 0 means never, which makes
    /// the routine due on the first cycle.
    #[serde(default)]
    pub last_weekly_cleanup_at: u64,
    /// Unix seconds of the last monthly audit; 0 means never.
    #[serde(default)]
    pub last_monthly_cleanup_at: u64,
    /// Most recent working-tree measurement in bytes.
    #[serde(default)]
    pub repo_size_bytes: u64,
    /// Most recent version-control metadata measurement in bytes.
    #[serde(default)]
    pub history_size_bytes: u64,
}
