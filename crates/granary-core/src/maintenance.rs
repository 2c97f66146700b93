//! Mirror repository size management.
//!
//! Measurements run every cycle; cleanup is tiered. Size-triggered deep
//! cleanup reacts to the metadata crossing the critical threshold, while
//! the weekly and monthly routines run on calendar age. The monthly
//! routine's last resort is a fresh shallow re-clone that lifts the store
//! subtree out of the destructive window entirely.

use std::fs;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::fsutil::{copy_dir_recursive, dir_size_bytes, remove_dir_all_writable, write_atomic};
use crate::git::GitPort;
use crate::store::timestamp_secs;
use granary_domain::MaintenanceState;

const WEEKLY_SECS: u64 = 7 * 24 * 60 * 60;
const MONTHLY_SECS: u64 = 30 * 24 * 60 * 60;
const REPACK_WINDOW: u32 = 10;
const REPACK_DEPTH: u32 = 50;

/// Cleanup failed; logged by the caller and retried next cycle. Never
/// blocks the commit/push path.
#[derive(Debug, thiserror::Error)]
#[error("[GR401] maintenance failed during {step}: {source}")]
pub struct MaintenanceFailure {
    pub step: String,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepoCondition {
    Healthy,
    Warning,
    Critical,
    /// Was critical this cycle; deep cleanup brought it back down.
    PostCleanupHealthy,
}

impl RepoCondition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::PostCleanupHealthy => "post-cleanup-healthy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub condition: RepoCondition,
    pub repo_size_bytes: u64,
    pub history_size_bytes: u64,
    pub weekly_ran: bool,
    pub monthly_ran: bool,
    pub recloned: bool,
}

pub struct SizeManager<'a> {
    settings: &'a Settings,
}

impl<'a> SizeManager<'a> {
    #[must_use]
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    pub fn run(&self, git: &dyn GitPort) -> Result<MaintenanceReport> {
        let mut state = self.load_state();
        let workdir = git.workdir();

        state.repo_size_bytes = dir_size_bytes(workdir);
        state.history_size_bytes = dir_size_bytes(&workdir.join(".git"));
        self.save_state(&state)
            .map_err(|err| step_failure("persist measurements", err))?;

        let mut condition = self.classify(state.history_size_bytes);
        match condition {
            RepoCondition::Healthy | RepoCondition::PostCleanupHealthy => {}
            RepoCondition::Warning => {
                warn!(
                    history_size_bytes = state.history_size_bytes,
                    warn_bytes = self.settings.repo_warn_bytes,
                    "mirror metadata size above warning threshold"
                );
            }
            RepoCondition::Critical => {
                warn!(
                    history_size_bytes = state.history_size_bytes,
                    crit_bytes = self.settings.repo_crit_bytes,
                    "mirror metadata size critical; running deep cleanup"
                );
                self.deep_cleanup(git)
                    .map_err(|err| step_failure("deep cleanup", err))?;
                state.history_size_bytes = dir_size_bytes(&workdir.join(".git"));
                if state.history_size_bytes < self.settings.repo_warn_bytes {
                    condition = RepoCondition::PostCleanupHealthy;
                }
            }
        }

        let now = timestamp_secs();
        let mut weekly_ran = false;
        if now.saturating_sub(state.last_weekly_cleanup_at) >= WEEKLY_SECS {
            self.weekly_cleanup(git)
                .map_err(|err| step_failure("weekly cleanup", err))?;
            state.last_weekly_cleanup_at = now;
            weekly_ran = true;
            self.save_state(&state)
                .map_err(|err| step_failure("persist weekly cursor", err))?;
        }

        let mut monthly_ran = false;
        let mut recloned = false;
        if now.saturating_sub(state.last_monthly_cleanup_at) >= MONTHLY_SECS {
            if !weekly_ran {
                self.weekly_cleanup(git)
                    .map_err(|err| step_failure("monthly cleanup", err))?;
            }
            state.history_size_bytes = dir_size_bytes(&workdir.join(".git"));
            if state.history_size_bytes > self.settings.repo_hard_cap_bytes {
                info!(
                    history_size_bytes = state.history_size_bytes,
                    hard_cap_bytes = self.settings.repo_hard_cap_bytes,
                    "metadata still above hard cap after cleanup; fresh shallow re-clone"
                );
                self.fresh_reclone(git)
                    .map_err(|err| step_failure("fresh re-clone", err))?;
                recloned = true;
            }
            state.last_monthly_cleanup_at = now;
            monthly_ran = true;
            self.save_state(&state)
                .map_err(|err| step_failure("persist monthly cursor", err))?;
        }

        // Keep the remote side shallow regardless of which routines ran.
        if let Err(err) = git.fetch_shallow() {
            warn!(%err, "shallow fetch failed; retrying next cycle");
        }

        state.repo_size_bytes = dir_size_bytes(workdir);
        state.history_size_bytes = dir_size_bytes(&workdir.join(".git"));
        self.save_state(&state)
            .map_err(|err| step_failure("persist measurements", err))?;

        debug!(
            condition = condition.as_str(),
            repo_size_bytes = state.repo_size_bytes,
            history_size_bytes = state.history_size_bytes,
            weekly_ran,
            monthly_ran,
            recloned,
            "maintenance pass complete"
        );
        Ok(MaintenanceReport {
            condition,
            repo_size_bytes: state.repo_size_bytes,
            history_size_bytes: state.history_size_bytes,
            weekly_ran,
            monthly_ran,
            recloned,
        })
    }

    fn classify(&self, history_size_bytes: u64) -> RepoCondition {
        if history_size_bytes >= self.settings.repo_crit_bytes {
            RepoCondition::Critical
        } else if history_size_bytes >= self.settings.repo_warn_bytes {
            RepoCondition::Warning
        } else {
            RepoCondition::Healthy
        }
    }

    fn deep_cleanup(&self, git: &dyn GitPort) -> Result<()> {
        git.gc_aggressive()?;
        git.repack(REPACK_WINDOW, REPACK_DEPTH)?;
        Ok(())
    }

    fn weekly_cleanup(&self, git: &dyn GitPort) -> Result<()> {
        git.remote_prune()?;
        git.expire_reflog()?;
        git.gc_aggressive()?;
        git.repack(REPACK_WINDOW, REPACK_DEPTH)?;
        Ok(())
    }

    /// Last resort: trade all local history for bounded size. The store
    /// subtree is copied out before the working copy is destroyed and
    /// restored on top of the fresh shallow clone, so live data is never
    /// inside the destructive window.
    fn fresh_reclone(&self, git: &dyn GitPort) -> Result<()> {
        let workdir = git.workdir().to_path_buf();
        let subtree = &self.settings.store_subtree;
        let parent = workdir
            .parent()
            .ok_or_else(|| anyhow!("mirror working copy has no parent directory"))?;

        let temp = tempfile::Builder::new()
            .prefix("granary-reclone-")
            .tempdir_in(parent)
            .context("failed to create staging directory for re-clone")?;
        let preserved = temp.path().join(subtree);
        let store_src = workdir.join(subtree);
        if store_src.exists() {
            copy_dir_recursive(&store_src, &preserved)?;
        }

        remove_dir_all_writable(&workdir)?;
        git.clone_shallow(&workdir)?;

        if preserved.exists() {
            let dest = workdir.join(subtree);
            // The clone may carry an older committed copy of the store;
            // the preserved live tree wins wholesale.
            remove_dir_all_writable(&dest)?;
            copy_dir_recursive(&preserved, &dest)?;
        }

        git.stage(subtree)?;
        if git.staged_changes()? {
            git.commit("granary: restore store after fresh re-clone")?;
        }
        info!("fresh shallow re-clone complete; store subtree restored");
        Ok(())
    }

    fn load_state(&self) -> MaintenanceState {
        let path = self.settings.maintenance_path();
        match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => state,
                Err(err) => {
                    warn!(path = %path.display(), %err, "unreadable maintenance state; starting fresh");
                    MaintenanceState::default()
                }
            },
            Err(_) => MaintenanceState::default(),
        }
    }

    fn save_state(&self, state: &MaintenanceState) -> Result<()> {
        let bytes =
            serde_json::to_vec_pretty(state).context("failed to encode maintenance state")?;
        write_atomic(&self.settings.maintenance_path(), &bytes)
    }
}

fn step_failure(step: &str, source: anyhow::Error) -> anyhow::Error {
    MaintenanceFailure {
        step: step.to_string(),
        source,
    }
    .into()
}
