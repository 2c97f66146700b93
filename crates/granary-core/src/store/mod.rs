//! The content store: a blob tree plus a SQLite record index.
//!
//! Producers call [`ContentStore::put`] concurrently; deduplication rides
//! on the index's hash uniqueness, and a conflicting insert is the normal
//! dedup path, never an error. The blob is always durable on disk before
//! its index row is committed, so a crash between the two leaves an
//! orphaned blob (recoverable by `doctor`), never a dangling row.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use fs4::FileExt;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::fsutil::fsync_dir;
use crate::outcome::codes;
use granary_domain::{ContentRecord, ContentStatus};

mod doctor;
mod index;
mod stats;

pub use doctor::DoctorSummary;

const BLOBS_DIR: &str = "blobs";
const LOCKS_DIR: &str = "locks";
const TMP_DIR: &str = "tmp";
const INDEX_FILENAME: &str = "index.sqlite";

const STORE_FORMAT_VERSION: u32 = 1;
const SCHEMA_VERSION: u32 = 1;
const META_KEY_STORE_FORMAT_VERSION: &str = "store_format_version";
const META_KEY_SCHEMA_VERSION: &str = "schema_version";
const META_KEY_CREATED_BY: &str = "created_by_version";
const META_KEY_LAST_USED: &str = "last_used_version";

/// Errors surfaced by the content store.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("[GR800] no record for hash {hash}")]
    MissingRecord { hash: String },
    #[error("[GR800] blob for hash {hash} is missing")]
    MissingBlob { hash: String },
    #[error("[GR801] blob digest mismatch (expected {expected}, found {actual})")]
    DigestMismatch { expected: String, actual: String },
    #[error("[GR802] '{hash}' is not a hex sha-256 hash")]
    InvalidHash { hash: String },
    #[error("[GR810] store write failed: {0}")]
    WriteFailure(String),
    #[error("[GR811] store index is corrupt: {0}")]
    IndexCorrupt(String),
    #[error("[GR812] store format/schema incompatible for {key}: expected {expected}, found {found}")]
    IncompatibleFormat {
        key: String,
        expected: String,
        found: String,
    },
    #[error("[GR820] invalid status transition for {hash}: {from:?} -> {to:?}")]
    InvalidTransition {
        hash: String,
        from: ContentStatus,
        to: ContentStatus,
    },
    #[error("[GR830] statistics unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },
}

impl StoreError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingRecord { .. } | Self::MissingBlob { .. } => codes::MISSING,
            Self::DigestMismatch { .. } => codes::DIGEST_MISMATCH,
            Self::InvalidHash { .. } => codes::INVALID_HASH,
            Self::WriteFailure(_) => codes::STORE_WRITE_FAILURE,
            Self::IndexCorrupt(_) => codes::INDEX_CORRUPT,
            Self::IncompatibleFormat { .. } => codes::FORMAT_INCOMPATIBLE,
            Self::InvalidTransition { .. } => codes::INVALID_TRANSITION,
            Self::Unavailable { .. } => codes::STORE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Default)]
struct StoreHealth {
    layout_ready: AtomicBool,
}

/// Durable, concurrently-accessible index mapping a content hash to its
/// record and blob.
#[derive(Clone)]
pub struct ContentStore {
    root: PathBuf,
    health: Arc<StoreHealth>,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("root", &self.root)
            .field(
                "layout_ready",
                &self.health.layout_ready.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl ContentStore {
    /// Open (and bootstrap if needed) a store rooted at `root`.
    pub fn new(root: PathBuf) -> Result<Self> {
        let store = Self {
            root,
            health: Arc::default(),
        };
        store.ensure_layout()?;
        Ok(store)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hex sha-256 of a blob; the store's primary key.
    #[must_use]
    pub fn compute_hash(blob: &[u8]) -> String {
        hex::encode(Sha256::digest(blob))
    }

    /// Idempotent write: if `hash` is already indexed, the existing record
    /// is returned unchanged (no blob rewrite, no status reset). Otherwise
    /// the blob is persisted first and a `pending` record committed after.
    pub fn put(&self, hash: &str, source_id: &str, blob: &[u8]) -> Result<ContentRecord> {
        validate_hash(hash)?;
        let actual = Self::compute_hash(blob);
        if actual != hash {
            return Err(StoreError::DigestMismatch {
                expected: hash.to_string(),
                actual,
            }
            .into());
        }

        self.ensure_layout()?;
        let _lock = self.acquire_lock(hash)?;

        let blob_path = self.blob_path(hash);
        if blob_path.exists() {
            self.verify_existing(hash, &blob_path)?;
        } else {
            self.write_new_blob(hash, blob, &blob_path)
                .map_err(store_write_error)?;
        }

        let (record, fresh) = self
            .insert_record(hash, source_id, blob.len() as u64, &blob_rel(hash))
            .map_err(store_write_error)?;
        if fresh {
            debug!(%hash, source_id, size = blob.len(), "record stored");
        } else {
            debug!(%hash, source_id, "dedup hit; returning existing record");
        }
        Ok(record)
    }

    /// Convenience for producers that have not hashed their payload yet.
    pub fn put_content(&self, source_id: &str, blob: &[u8]) -> Result<ContentRecord> {
        let hash = Self::compute_hash(blob);
        self.put(&hash, source_id, blob)
    }

    /// Look up a record by hash.
    pub fn get(&self, hash: &str) -> Result<Option<ContentRecord>> {
        self.ensure_layout()?;
        let conn = self.connection()?;
        self.record_with_conn(&conn, hash)
    }

    /// Read and digest-verify the blob for `hash`.
    pub fn read_blob(&self, hash: &str) -> Result<Vec<u8>> {
        self.ensure_layout()?;
        let path = self.blob_path(hash);
        if !path.exists() {
            return Err(StoreError::MissingBlob {
                hash: hash.to_string(),
            }
            .into());
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("failed to read blob at {}", path.display()))?;
        let actual = Self::compute_hash(&bytes);
        if actual != hash {
            return Err(StoreError::DigestMismatch {
                expected: hash.to_string(),
                actual,
            }
            .into());
        }
        Ok(bytes)
    }

    pub fn mark_processing(&self, hash: &str) -> Result<ContentRecord> {
        self.update_status(hash, ContentStatus::Processing)
    }

    pub fn mark_completed(&self, hash: &str) -> Result<ContentRecord> {
        self.update_status(hash, ContentStatus::Completed)
    }

    pub fn mark_failed(&self, hash: &str) -> Result<ContentRecord> {
        self.update_status(hash, ContentStatus::Failed)
    }

    pub(crate) fn ensure_layout(&self) -> Result<()> {
        if self.health.layout_ready.load(Ordering::SeqCst) && self.index_path().exists() {
            return Ok(());
        }
        for dir in [BLOBS_DIR, LOCKS_DIR, TMP_DIR] {
            let path = self.root.join(dir);
            fs::create_dir_all(&path)
                .with_context(|| format!("failed to create store directory {}", path.display()))?;
        }
        // Lock files, partials, and WAL sidecars never belong in the
        // mirror's history.
        let gitignore = self.root.join(".gitignore");
        if !gitignore.exists() {
            fs::write(&gitignore, "locks/\ntmp/\nindex.sqlite-wal\nindex.sqlite-shm\n")
                .with_context(|| format!("failed to write {}", gitignore.display()))?;
        }
        let mut conn = self.connection_raw()?;
        self.init_schema(&conn)?;
        self.ensure_meta(&mut conn)?;
        self.health.layout_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn write_new_blob(&self, hash: &str, blob: &[u8], dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create blob directory {}", parent.display()))?;
        }

        let tmp = self.tmp_path(hash);
        if tmp.exists() {
            let _ = fs::remove_file(&tmp);
        }
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("failed to create temp blob {}", tmp.display()))?;
            use std::io::Write;
            file.write_all(blob)
                .with_context(|| format!("failed to write temp blob {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to flush temp blob {}", tmp.display()))?;
        }
        if let Some(parent) = tmp.parent() {
            fsync_dir(parent).ok();
        }

        fs::rename(&tmp, dest).with_context(|| {
            format!(
                "failed to move blob into place ({} -> {})",
                tmp.display(),
                dest.display()
            )
        })?;
        if let Some(parent) = dest.parent() {
            fsync_dir(parent).ok();
        }
        remove_write_permissions(dest)?;
        self.verify_existing(hash, dest)
    }

    pub(crate) fn verify_existing(&self, hash: &str, path: &Path) -> Result<()> {
        use std::io::Read;
        let mut file = File::open(path)
            .with_context(|| format!("failed to open existing blob {}", path.display()))?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 32 * 1024];
        loop {
            let read = file
                .read(&mut buf)
                .with_context(|| format!("failed to read existing blob {}", path.display()))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        let actual = hex::encode(hasher.finalize());
        if actual != hash {
            return Err(StoreError::DigestMismatch {
                expected: hash.to_string(),
                actual,
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn acquire_lock(&self, hash: &str) -> Result<File> {
        let path = self.lock_path(hash);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to open lock {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(file)
    }

    pub(crate) fn blob_path(&self, hash: &str) -> PathBuf {
        let shard = hash.get(0..2).unwrap_or("xx");
        self.root.join(BLOBS_DIR).join(shard).join(hash)
    }

    fn lock_path(&self, hash: &str) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{hash}.lock"))
    }

    fn tmp_path(&self, hash: &str) -> PathBuf {
        self.root.join(TMP_DIR).join(format!("{hash}.partial"))
    }

    pub(crate) fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILENAME)
    }
}

pub(crate) fn blob_rel(hash: &str) -> String {
    let shard = hash.get(0..2).unwrap_or("xx");
    format!("{BLOBS_DIR}/{shard}/{hash}")
}

fn validate_hash(hash: &str) -> Result<()> {
    let ok = hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidHash {
            hash: hash.to_string(),
        }
        .into())
    }
}

fn store_write_error(err: anyhow::Error) -> anyhow::Error {
    if err.is::<StoreError>() {
        err
    } else {
        StoreError::WriteFailure(err.to_string()).into()
    }
}

fn remove_write_permissions(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    let mut perms = metadata.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = perms.mode();
        let new_mode = mode & !0o222;
        if mode != new_mode {
            perms.set_mode(new_mode);
            fs::set_permissions(path, perms)?;
        }
    }
    #[cfg(not(unix))]
    {
        if !perms.readonly() {
            perms.set_readonly(true);
            fs::set_permissions(path, perms)?;
        }
    }
    Ok(())
}

pub(crate) fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
