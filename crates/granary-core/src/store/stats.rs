//! Atomic statistics over the whole record set.

use super::*;
use crate::retry::RetryPolicy;
use granary_domain::Statistics;

impl ContentStore {
    /// All four counters from one SQL statement: a single snapshot read
    /// under WAL. Combining separate queries could interleave with writers
    /// and produce counts that do not sum.
    pub fn statistics(&self) -> Result<Statistics> {
        self.ensure_layout()?;
        let conn = self.connection()?;
        let stats = conn.query_row(
            "SELECT COUNT(*), \
                    COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN status IN ('pending', 'processing') THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) \
             FROM records",
            [],
            |row| {
                Ok(Statistics {
                    total: row.get::<_, i64>(0)? as u64,
                    completed: row.get::<_, i64>(1)? as u64,
                    pending: row.get::<_, i64>(2)? as u64,
                    failed: row.get::<_, i64>(3)? as u64,
                })
            },
        )?;
        Ok(stats)
    }

    /// Statistics with bounded retry for index contention. Exhausting the
    /// policy yields `[GR830] Unavailable`, which callers render as a
    /// degraded response rather than a crash.
    pub fn statistics_with_retry(&self, policy: &RetryPolicy) -> Result<Statistics> {
        policy
            .run("statistics", is_contention, || self.statistics())
            .map_err(|err| {
                if is_contention(&err) {
                    StoreError::Unavailable {
                        attempts: policy.max_attempts,
                        last_error: err.to_string(),
                    }
                    .into()
                } else {
                    err
                }
            })
    }
}

fn is_contention(err: &anyhow::Error) -> bool {
    err.downcast_ref::<rusqlite::Error>().is_some_and(|err| {
        matches!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        )
    })
}
