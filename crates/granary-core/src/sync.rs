//! The protected synchronizer: folds store changes into the mirror
//! repository without ever exposing the store subtree to a destructive
//! operation.
//!
//! Protocol per cycle (single-flight):
//! 1. Commit the store subtree if dirty, so store data reaches history
//!    before anything that could discard working-tree state runs.
//! 2. Isolate remaining non-store changes behind a pathspec-excluded
//!    stash; skipped entirely when nothing else changed.
//! 3. Steps 1 and 2 run under the integrity guard.
//! 4. Push under the bounded retry policy.
//! 5. Hand off to the size manager; its failures never block the cycle.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::thread;

use anyhow::{Context, Result};
use fs4::FileExt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::git::{GitError, GitPort};
use crate::guard::{IntegrityGuard, IntegrityViolation};
use crate::maintenance::{MaintenanceReport, SizeManager};
use crate::outcome::codes;
use crate::retry::RetryPolicy;
use crate::store::ContentStore;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("[GR301] committing the store subtree failed after {attempts} attempts: {last_error}")]
    CommitFailed { attempts: u32, last_error: String },
    #[error("[GR302] pushing to the mirror remote failed after {attempts} attempts: {last_error}")]
    PushFailed { attempts: u32, last_error: String },
}

impl SyncError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::CommitFailed { .. } => codes::COMMIT_FAILED,
            Self::PushFailed { .. } => codes::PUSH_FAILED,
        }
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another cycle is in flight; this tick is dropped, not queued.
    Skipped,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub store_committed: bool,
    pub stashed: bool,
    pub pushed: bool,
    pub maintenance: Option<MaintenanceReport>,
}

pub struct Synchronizer {
    settings: Settings,
    git: Box<dyn GitPort>,
    store: ContentStore,
    guard: IntegrityGuard,
    retry: RetryPolicy,
}

impl Synchronizer {
    #[must_use]
    pub fn new(settings: Settings, git: Box<dyn GitPort>, store: ContentStore) -> Self {
        let guard = IntegrityGuard::new(settings.guard_tolerance);
        let retry = RetryPolicy::mirror(settings.retry_delay);
        Self {
            settings,
            git,
            store,
            guard,
            retry,
        }
    }

    /// One protected synchronization cycle.
    pub fn run_cycle(&self) -> Result<CycleOutcome> {
        let Some(_lock) = self.try_acquire_cycle_lock()? else {
            info!("previous sync cycle still in flight; skipping this tick");
            return Ok(CycleOutcome::Skipped);
        };

        let (store_committed, stashed) = self.guard.guard(
            "protected mirror sync",
            || self.read_total(),
            || {
                let committed = self.commit_store_subtree()?;
                let stashed = self.isolate_other_changes()?;
                Ok((committed, stashed))
            },
        )?;

        self.push_with_retry()?;

        let maintenance = match SizeManager::new(&self.settings).run(self.git.as_ref()) {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(%err, "mirror maintenance failed; deferring to next cycle");
                None
            }
        };

        info!(
            store_committed,
            stashed, "sync cycle complete"
        );
        Ok(CycleOutcome::Completed(CycleReport {
            store_committed,
            stashed,
            pushed: true,
            maintenance,
        }))
    }

    /// Run cycles forever at the configured interval. Only an integrity
    /// violation stops the loop; everything else is retried after the
    /// error delay.
    pub fn run_daemon(&self) -> Result<()> {
        loop {
            match self.run_cycle() {
                Ok(_) => thread::sleep(self.settings.sync_interval),
                Err(err) => {
                    if err.downcast_ref::<IntegrityViolation>().is_some() {
                        error!(%err, "integrity violation; halting the sync pipeline for operator review");
                        return Err(err);
                    }
                    warn!(%err, "sync cycle failed; retrying after delay");
                    thread::sleep(self.settings.retry_delay);
                }
            }
        }
    }

    fn read_total(&self) -> Result<u64> {
        Ok(self
            .store
            .statistics_with_retry(&RetryPolicy::statistics())?
            .total)
    }

    /// Step 1: the store subtree is committed before anything else touches
    /// the working tree.
    fn commit_store_subtree(&self) -> Result<bool> {
        // Fold the WAL into index.sqlite so the committed index is a
        // self-contained snapshot.
        self.store.checkpoint()?;

        let subtree = &self.settings.store_subtree;
        self.git.stage(subtree)?;
        if !self.git.staged_changes()? {
            debug!(%subtree, "store subtree is clean; nothing to commit");
            return Ok(false);
        }

        let stamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("failed to format commit timestamp")?;
        let message = format!("granary: sync store {stamp}");
        self.retry
            .run("mirror commit", is_git_transient, || {
                self.git.commit(&message)
            })
            .map_err(|err| SyncError::CommitFailed {
                attempts: self.retry.max_attempts,
                last_error: err.to_string(),
            })?;
        info!(%subtree, "store subtree committed");
        Ok(true)
    }

    /// Step 2: everything *except* the store subtree goes into a scoped
    /// stash. Skipping when nothing else changed is correct behavior.
    fn isolate_other_changes(&self) -> Result<bool> {
        let subtree = &self.settings.store_subtree;
        let entries = self.git.status_porcelain()?;
        let others: Vec<&String> = entries
            .iter()
            .filter(|path| !is_under(path, subtree))
            .collect();
        if others.is_empty() {
            debug!("no non-store changes; skipping isolation");
            return Ok(false);
        }

        debug!(count = others.len(), "isolating non-store changes");
        self.git
            .stash_push_excluding(subtree, "granary: non-store changes")?;
        Ok(true)
    }

    fn push_with_retry(&self) -> Result<()> {
        self.retry
            .run("mirror push", is_git_transient, || self.git.push())
            .map_err(|err| {
                SyncError::PushFailed {
                    attempts: self.retry.max_attempts,
                    last_error: err.to_string(),
                }
                .into()
            })
    }

    fn try_acquire_cycle_lock(&self) -> Result<Option<fs::File>> {
        let path = self.settings.sync_lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to open sync lock {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn is_under(path: &str, subtree: &str) -> bool {
    path == subtree || path.starts_with(&format!("{subtree}/"))
}

fn is_git_transient(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<GitError>(),
        Some(GitError::CommandFailed { .. } | GitError::Invocation { .. })
    )
}

#[cfg(test)]
mod tests;
