//! Store verification and repair.
//!
//! `verify` proves the index is structurally sound; `doctor` additionally
//! reconciles the index with the blob tree. A blob with no index row means
//! an index commit was lost to some external destructive operation; it is
//! re-registered as `pending` so the surrounding pipeline processes it
//! again rather than losing it.

use super::*;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DoctorSummary {
    pub records_scanned: usize,
    pub blobs_scanned: usize,
    /// Index rows dropped because their blob is gone.
    pub rows_pruned: usize,
    /// Blobs whose bytes no longer match their hash; removed.
    pub corrupt_blobs: usize,
    /// Blobs with no index row, re-registered as pending.
    pub recovered: usize,
    /// Leftover partial writes swept from tmp/.
    pub partials_removed: usize,
}

impl ContentStore {
    /// Structural index validation: SQLite integrity check, expected
    /// tables, and meta versions. Format mismatches are surfaced, never
    /// auto-repaired.
    pub fn verify_index(&self) -> Result<()> {
        self.ensure_layout()?;
        let conn = self.connection()?;
        let mut stmt = conn.prepare("PRAGMA integrity_check")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let result: String = row.get(0)?;
            if !result.eq_ignore_ascii_case("ok") {
                return Err(StoreError::IndexCorrupt(result).into());
            }
        }
        drop(rows);
        drop(stmt);

        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('meta', 'records')",
        )?;
        let found = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<std::collections::HashSet<_>>>()?;
        for table in ["meta", "records"] {
            if !found.contains(table) {
                return Err(StoreError::IndexCorrupt(format!("missing table: {table}")).into());
            }
        }
        drop(stmt);

        self.enforce_meta_version(&conn, META_KEY_STORE_FORMAT_VERSION, STORE_FORMAT_VERSION)?;
        self.enforce_meta_version(&conn, META_KEY_SCHEMA_VERSION, SCHEMA_VERSION)?;
        Ok(())
    }

    /// Reconcile the index with the blob tree.
    pub fn doctor(&self) -> Result<DoctorSummary> {
        self.verify_index()?;
        let conn = self.connection()?;
        let mut summary = DoctorSummary::default();

        let records = self.list_records()?;
        summary.records_scanned = records.len();
        for record in records {
            let path = self.blob_path(&record.hash);
            if !path.exists() {
                conn.execute("DELETE FROM records WHERE hash = ?1", params![record.hash])?;
                summary.rows_pruned += 1;
                debug!(hash = %record.hash, "pruned index row with missing blob");
            }
        }

        let blobs_root = self.root.join(BLOBS_DIR);
        for entry in walkdir::WalkDir::new(&blobs_root).min_depth(2).max_depth(2) {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(hash) = entry.file_name().to_str().map(ToOwned::to_owned) else {
                continue;
            };
            summary.blobs_scanned += 1;

            if self.verify_existing(&hash, entry.path()).is_err() {
                crate::fsutil::make_writable_recursive(entry.path());
                let _ = fs::remove_file(entry.path());
                conn.execute("DELETE FROM records WHERE hash = ?1", params![hash])?;
                summary.corrupt_blobs += 1;
                debug!(%hash, "removed corrupt blob");
                continue;
            }

            if self.record_with_conn(&conn, &hash)?.is_none() {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                let (_, fresh) = self.insert_record(&hash, "recovered", size, &blob_rel(&hash))?;
                if fresh {
                    summary.recovered += 1;
                    debug!(%hash, "re-registered orphaned blob as pending");
                }
            }
        }

        summary.partials_removed = self.sweep_partials()?;
        Ok(summary)
    }

    pub(crate) fn sweep_partials(&self) -> Result<usize> {
        let tmp_root = self.root.join(TMP_DIR);
        if !tmp_root.exists() {
            return Ok(0);
        }
        let mut removed = 0usize;
        for entry in
            fs::read_dir(&tmp_root).with_context(|| format!("failed to read {}", tmp_root.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_file() && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
