//! The narrow version-control port.
//!
//! The synchronizer and size manager depend only on [`GitPort`], which
//! exposes exactly the audited operations this system drives, nothing
//! more. [`GitCli`] implements the port over the real binary; tests use a
//! scripted double to simulate loss scenarios without a repository.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Result;
use tracing::debug;
use url::Url;

use crate::outcome::codes;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("[GR310] git binary not found: {0}")]
    BinaryMissing(String),
    #[error("[GR310] failed to invoke git {command}: {error}")]
    Invocation { command: String, error: String },
    #[error("[GR310] git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("[GR310] invalid mirror remote '{remote}': {reason}")]
    InvalidRemote { remote: String, reason: String },
    #[error("[GR310] no mirror remote configured (set GRANARY_REMOTE)")]
    RemoteMissing,
}

impl GitError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        codes::GIT_COMMAND
    }
}

/// Version-control operations the mirror pipeline is allowed to perform.
pub trait GitPort {
    fn workdir(&self) -> &Path;

    /// Stage everything under `pathspec` (tracked and untracked).
    fn stage(&self, pathspec: &str) -> Result<()>;

    /// Whether the index holds staged changes.
    fn staged_changes(&self) -> Result<bool>;

    fn commit(&self, message: &str) -> Result<()>;

    /// Worktree-relative paths with uncommitted changes.
    fn status_porcelain(&self) -> Result<Vec<String>>;

    /// Stash everything *except* the named subtree, via pathspec
    /// exclusion, so the operation cannot touch protected paths.
    fn stash_push_excluding(&self, exclude: &str, label: &str) -> Result<()>;

    fn push(&self) -> Result<()>;

    fn remote_prune(&self) -> Result<()>;

    /// Aggressive gc with immediate pruning of unreachable objects.
    fn gc_aggressive(&self) -> Result<()>;

    fn repack(&self, window: u32, depth: u32) -> Result<()>;

    fn expire_reflog(&self) -> Result<()>;

    /// Keep the remote fetch truncated to depth 1.
    fn fetch_shallow(&self) -> Result<()>;

    /// Shallow-clone the configured remote into `dest`.
    fn clone_shallow(&self, dest: &Path) -> Result<()>;
}

/// [`GitPort`] over the real `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: PathBuf,
    workdir: PathBuf,
    remote: Option<String>,
}

impl GitCli {
    pub fn new(workdir: PathBuf, remote: Option<String>) -> Result<Self> {
        let binary = which::which("git").map_err(|err| GitError::BinaryMissing(err.to_string()))?;
        if let Some(remote) = remote.as_deref() {
            validate_remote(remote)?;
        }
        Ok(Self {
            binary,
            workdir,
            remote,
        })
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("-C")
            .arg(&self.workdir)
            .args(args)
            .output()
            .map_err(|err| GitError::Invocation {
                command: args.join(" "),
                error: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run a command whose exit status 1 carries meaning (`diff --quiet`).
    fn run_check(&self, args: &[&str]) -> Result<bool> {
        let output = Command::new(&self.binary)
            .arg("-C")
            .arg(&self.workdir)
            .args(args)
            .output()
            .map_err(|err| GitError::Invocation {
                command: args.join(" "),
                error: err.to_string(),
            })?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into()),
        }
    }
}

impl GitPort for GitCli {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn stage(&self, pathspec: &str) -> Result<()> {
        self.run(&["add", "--", pathspec])?;
        Ok(())
    }

    fn staged_changes(&self) -> Result<bool> {
        self.run_check(&["diff", "--cached", "--quiet"])
    }

    fn commit(&self, message: &str) -> Result<()> {
        self.run(&["commit", "--quiet", "-m", message])?;
        Ok(())
    }

    fn status_porcelain(&self) -> Result<Vec<String>> {
        let stdout = self.run(&["status", "--porcelain"])?;
        Ok(stdout
            .lines()
            .filter(|line| line.len() > 3)
            .map(|line| {
                let path = &line[3..];
                // Renames are reported as "old -> new"; the new path is
                // what matters for isolation decisions.
                match path.rsplit_once(" -> ") {
                    Some((_, new)) => new.to_string(),
                    None => path.to_string(),
                }
            })
            .collect())
    }

    fn stash_push_excluding(&self, exclude: &str, label: &str) -> Result<()> {
        let exclusion = format!(":(exclude){exclude}");
        self.run(&[
            "stash",
            "push",
            "--include-untracked",
            "-m",
            label,
            "--",
            ".",
            &exclusion,
        ])?;
        Ok(())
    }

    fn push(&self) -> Result<()> {
        self.run(&["push", "--quiet", "origin", "HEAD"])?;
        Ok(())
    }

    fn remote_prune(&self) -> Result<()> {
        self.run(&["remote", "prune", "origin"])?;
        Ok(())
    }

    fn gc_aggressive(&self) -> Result<()> {
        self.run(&["gc", "--aggressive", "--prune=now", "--quiet"])?;
        Ok(())
    }

    fn repack(&self, window: u32, depth: u32) -> Result<()> {
        let window = format!("--window={window}");
        let depth = format!("--depth={depth}");
        self.run(&["repack", "-a", "-d", "--quiet", &window, &depth])?;
        Ok(())
    }

    fn expire_reflog(&self) -> Result<()> {
        self.run(&["reflog", "expire", "--expire=now", "--all"])?;
        Ok(())
    }

    fn fetch_shallow(&self) -> Result<()> {
        self.run(&["fetch", "--quiet", "--depth", "1", "origin"])?;
        Ok(())
    }

    fn clone_shallow(&self, dest: &Path) -> Result<()> {
        let remote = self.remote.as_deref().ok_or(GitError::RemoteMissing)?;
        debug!(remote, dest = %dest.display(), "shallow-cloning mirror");
        let output = Command::new(&self.binary)
            .arg("clone")
            .arg("--quiet")
            .arg("--depth")
            .arg("1")
            .arg(remote)
            .arg(dest)
            .output()
            .map_err(|err| GitError::Invocation {
                command: "clone".to_string(),
                error: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: "clone".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(())
    }
}

fn validate_remote(remote: &str) -> Result<()> {
    // URL-shaped remotes get parsed; scp-like and local-path remotes are
    // accepted as-is (git understands them natively).
    if remote.contains("://") {
        Url::parse(remote).map_err(|err| GitError::InvalidRemote {
            remote: remote.to_string(),
            reason: err.to_string(),
        })?;
    }
    Ok(())
}
