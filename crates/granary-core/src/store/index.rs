//! SQLite connection, schema, and record operations.

use super::*;

impl ContentStore {
    pub(crate) fn connection(&self) -> Result<Connection> {
        let conn = self.connection_raw()?;
        conn.busy_timeout(std::time::Duration::from_secs(10))
            .context("failed to set busy timeout for the record index")?;
        Ok(conn)
    }

    pub(super) fn connection_raw(&self) -> Result<Connection> {
        let path = self.index_path();
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open record index at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL for the record index")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys for the record index")?;
        Ok(conn)
    }

    pub(crate) fn with_immediate_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start record index transaction")?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub(super) fn init_schema(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS records (
                hash TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                source_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                completed_at INTEGER,
                size_bytes INTEGER NOT NULL,
                blob_ref TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS records_status ON records(status);
            "#,
        )
        .context("failed to initialize record index schema")?;
        Ok(())
    }

    pub(super) fn ensure_meta(&self, conn: &mut Connection) -> Result<()> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start index meta transaction")?;
        tx.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params![
                META_KEY_STORE_FORMAT_VERSION,
                STORE_FORMAT_VERSION.to_string()
            ],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params![META_KEY_SCHEMA_VERSION, SCHEMA_VERSION.to_string()],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params![META_KEY_CREATED_BY, crate::GRANARY_VERSION],
        )?;
        tx.execute(
            "INSERT INTO meta(key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![META_KEY_LAST_USED, crate::GRANARY_VERSION],
        )?;
        tx.commit()?;

        self.enforce_meta_version(conn, META_KEY_STORE_FORMAT_VERSION, STORE_FORMAT_VERSION)?;
        self.enforce_meta_version(conn, META_KEY_SCHEMA_VERSION, SCHEMA_VERSION)?;
        Ok(())
    }

    pub(super) fn meta_value(&self, conn: &Connection, key: &str) -> Result<Option<String>> {
        conn.query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub(super) fn enforce_meta_version(
        &self,
        conn: &Connection,
        key: &str,
        expected: u32,
    ) -> Result<()> {
        let value = self
            .meta_value(conn, key)?
            .ok_or_else(|| StoreError::IndexCorrupt(format!("meta key '{key}' missing")))?;
        let parsed = value
            .parse::<u32>()
            .map_err(|_| StoreError::IncompatibleFormat {
                key: key.to_string(),
                expected: expected.to_string(),
                found: value.clone(),
            })?;
        if parsed != expected {
            return Err(StoreError::IncompatibleFormat {
                key: key.to_string(),
                expected: expected.to_string(),
                found: value,
            }
            .into());
        }
        Ok(())
    }

    /// Insert a pending record unless the hash already exists. Returns the
    /// row either way plus whether this call created it; a concurrent
    /// identical-hash insert loses the conflict silently and reads the
    /// winner's row.
    pub(super) fn insert_record(
        &self,
        hash: &str,
        source_id: &str,
        size_bytes: u64,
        blob_ref: &str,
    ) -> Result<(ContentRecord, bool)> {
        let now = timestamp_secs() as i64;
        self.with_immediate_tx(|tx| {
            let inserted = tx.execute(
                "INSERT INTO records(hash, status, source_id, created_at, completed_at, size_bytes, blob_ref) \
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6) \
                 ON CONFLICT(hash) DO NOTHING",
                params![
                    hash,
                    ContentStatus::Pending.as_str(),
                    source_id,
                    now,
                    size_bytes as i64,
                    blob_ref
                ],
            )?;
            let record = self
                .record_with_conn(tx, hash)?
                .ok_or_else(|| StoreError::MissingRecord {
                    hash: hash.to_string(),
                })?;
            Ok((record, inserted == 1))
        })
    }

    pub(super) fn record_with_conn(
        &self,
        conn: &Connection,
        hash: &str,
    ) -> Result<Option<ContentRecord>> {
        let mut stmt = conn.prepare(
            "SELECT hash, status, source_id, created_at, completed_at, size_bytes, blob_ref \
             FROM records WHERE hash = ?1",
        )?;
        let mut rows = stmt.query(params![hash])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    /// Validate and apply a status transition in one write transaction.
    /// Out-of-order calls are rejected with no state change.
    pub(super) fn update_status(&self, hash: &str, to: ContentStatus) -> Result<ContentRecord> {
        self.ensure_layout()?;
        self.with_immediate_tx(|tx| {
            let record = self
                .record_with_conn(tx, hash)?
                .ok_or_else(|| StoreError::MissingRecord {
                    hash: hash.to_string(),
                })?;
            if !record.status.can_transition(to) {
                return Err(StoreError::InvalidTransition {
                    hash: hash.to_string(),
                    from: record.status,
                    to,
                }
                .into());
            }
            let completed_at = to.is_terminal().then(|| timestamp_secs() as i64);
            tx.execute(
                "UPDATE records SET status = ?1, completed_at = COALESCE(?2, completed_at) \
                 WHERE hash = ?3",
                params![to.as_str(), completed_at, hash],
            )?;
            self.record_with_conn(tx, hash)?
                .ok_or_else(|| {
                    StoreError::MissingRecord {
                        hash: hash.to_string(),
                    }
                    .into()
                })
        })
    }

    /// Fold the WAL back into the main database file so the index on disk
    /// is a self-contained snapshot (used before committing the store
    /// subtree into the mirror).
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_layout()?;
        let conn = self.connection()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .context("failed to checkpoint the record index")?;
        Ok(())
    }

    /// All records in hash order, for export.
    pub fn list_records(&self) -> Result<Vec<ContentRecord>> {
        self.ensure_layout()?;
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT hash, status, source_id, created_at, completed_at, size_bytes, blob_ref \
             FROM records ORDER BY hash ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<ContentRecord> {
    let status_str: String = row.get(1)?;
    let status = ContentStatus::try_from(status_str.as_str())
        .map_err(|err| StoreError::IndexCorrupt(err.to_string()))?;
    Ok(ContentRecord {
        hash: row.get(0)?,
        status,
        source_id: row.get(2)?,
        created_at: row.get::<_, i64>(3)? as u64,
        completed_at: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        size_bytes: row.get::<_, i64>(5)? as u64,
        blob_ref: row.get(6)?,
    })
}
