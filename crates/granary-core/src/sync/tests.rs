//! Synchronizer unit tests against the scripted git double, plus a
//! real-git end-to-end cycle (skipped when git is unavailable).

use super::*;
use crate::config::EnvSnapshot;
use crate::git::test_support::RecordingGit;
use crate::git::GitCli;
use std::process::Command;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

struct Fixture {
    _temp: TempDir,
    settings: Settings,
    store: ContentStore,
    git: Arc<RecordingGit>,
}

impl Fixture {
    fn new() -> Result<Self> {
        let temp = tempdir()?;
        let home = temp.path().join("granary");
        let home_str = home.to_string_lossy().to_string();
        let settings = Settings::from_snapshot(&EnvSnapshot::testing(&[
            ("GRANARY_HOME", home_str.as_str()),
            ("GRANARY_RETRY_DELAY_SECS", "0"),
        ]))?;
        fs::create_dir_all(settings.mirror_path.join(".git"))?;
        let store = ContentStore::new(settings.store_path.clone())?;
        let git = Arc::new(RecordingGit::new(settings.mirror_path.clone()));
        Ok(Self {
            _temp: temp,
            settings,
            store,
            git,
        })
    }

    fn synchronizer(&self) -> Synchronizer {
        Synchronizer::new(
            self.settings.clone(),
            Box::new(SharedGit(Arc::clone(&self.git))),
            self.store.clone(),
        )
    }

    fn seed_records(&self, count: usize) -> Result<()> {
        for i in 0..count {
            self.store
                .put_content("producer", format!("payload-{i}").as_bytes())?;
        }
        Ok(())
    }
}

/// Arc wrapper so the test keeps a handle on the recording double after
/// handing it to the synchronizer.
struct SharedGit(Arc<RecordingGit>);

impl GitPort for SharedGit {
    fn workdir(&self) -> &std::path::Path {
        self.0.workdir()
    }
    fn stage(&self, pathspec: &str) -> Result<()> {
        self.0.stage(pathspec)
    }
    fn staged_changes(&self) -> Result<bool> {
        self.0.staged_changes()
    }
    fn commit(&self, message: &str) -> Result<()> {
        self.0.commit(message)
    }
    fn status_porcelain(&self) -> Result<Vec<String>> {
        self.0.status_porcelain()
    }
    fn stash_push_excluding(&self, exclude: &str, label: &str) -> Result<()> {
        self.0.stash_push_excluding(exclude, label)
    }
    fn push(&self) -> Result<()> {
        self.0.push()
    }
    fn remote_prune(&self) -> Result<()> {
        self.0.remote_prune()
    }
    fn gc_aggressive(&self) -> Result<()> {
        self.0.gc_aggressive()
    }
    fn repack(&self, window: u32, depth: u32) -> Result<()> {
        self.0.repack(window, depth)
    }
    fn expire_reflog(&self) -> Result<()> {
        self.0.expire_reflog()
    }
    fn fetch_shallow(&self) -> Result<()> {
        self.0.fetch_shallow()
    }
    fn clone_shallow(&self, dest: &std::path::Path) -> Result<()> {
        self.0.clone_shallow(dest)
    }
}

#[test]
fn store_commit_precedes_isolation_and_push() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.seed_records(3)?;
    fixture.git.dirty_store.store(true, Ordering::SeqCst);
    *fixture.git.status.lock().expect("status") = vec![
        "store/index.sqlite".to_string(),
        "config.toml".to_string(),
    ];

    let outcome = fixture.synchronizer().run_cycle()?;
    let CycleOutcome::Completed(report) = outcome else {
        panic!("expected a completed cycle");
    };
    assert!(report.store_committed);
    assert!(report.stashed);
    assert!(report.pushed);

    let ops = fixture.git.recorded();
    let position = |needle: &str| {
        ops.iter()
            .position(|op| op.starts_with(needle))
            .unwrap_or_else(|| panic!("missing op {needle}: {ops:?}"))
    };
    let add = position("add store");
    let commit = position("commit granary: sync store");
    let stash = position("stash push exclude=store");
    let push = position("push");
    assert!(add < commit, "store staged before commit: {ops:?}");
    assert!(commit < stash, "store committed before isolation: {ops:?}");
    assert!(stash < push, "isolation before push: {ops:?}");
    Ok(())
}

#[test]
fn isolation_is_skipped_when_only_store_paths_changed() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.seed_records(2)?;
    fixture.git.dirty_store.store(true, Ordering::SeqCst);
    *fixture.git.status.lock().expect("status") = vec![
        "store/blobs/ab/abcd".to_string(),
        "store/index.sqlite".to_string(),
    ];

    let CycleOutcome::Completed(report) = fixture.synchronizer().run_cycle()? else {
        panic!("expected a completed cycle");
    };
    assert!(report.store_committed);
    assert!(!report.stashed, "nothing outside the store to isolate");
    assert!(
        !fixture
            .git
            .recorded()
            .iter()
            .any(|op| op.starts_with("stash")),
        "no stash op expected"
    );
    Ok(())
}

#[test]
fn clean_tree_commits_nothing_but_still_pushes() -> Result<()> {
    let fixture = Fixture::new()?;
    let CycleOutcome::Completed(report) = fixture.synchronizer().run_cycle()? else {
        panic!("expected a completed cycle");
    };
    assert!(!report.store_committed);
    assert!(!report.stashed);
    assert!(report.pushed);
    Ok(())
}

#[test]
fn push_is_retried_until_it_succeeds() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.git.failing_pushes.store(2, Ordering::SeqCst);

    let CycleOutcome::Completed(report) = fixture.synchronizer().run_cycle()? else {
        panic!("expected a completed cycle");
    };
    assert!(report.pushed);
    let pushes = fixture
        .git
        .recorded()
        .iter()
        .filter(|op| op.starts_with("push"))
        .count();
    assert_eq!(pushes, 3, "two failures then one success");
    Ok(())
}

#[test]
fn push_exhaustion_abandons_the_cycle() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.git.failing_pushes.store(10, Ordering::SeqCst);

    let err = fixture.synchronizer().run_cycle().unwrap_err();
    let sync_err = err.downcast_ref::<SyncError>().expect("SyncError");
    assert!(matches!(sync_err, SyncError::PushFailed { attempts: 3, .. }));
    Ok(())
}

#[test]
fn destructive_isolation_trips_the_integrity_guard() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.seed_records(100)?;
    fixture.git.dirty_store.store(true, Ordering::SeqCst);
    *fixture.git.status.lock().expect("status") = vec!["config.toml".to_string()];

    // Script the stash to behave like an unscoped, destructive stash that
    // sweeps up half of the store.
    let store = fixture.store.clone();
    *fixture.git.on_stash.lock().expect("stash hook") = Some(Box::new(move || {
        let conn = store.connection().expect("connection");
        conn.execute(
            "DELETE FROM records WHERE rowid % 2 = 0",
            [],
        )
        .expect("simulated loss");
    }));

    let err = fixture.synchronizer().run_cycle().unwrap_err();
    let violation = err
        .downcast_ref::<IntegrityViolation>()
        .expect("IntegrityViolation");
    assert_eq!(violation.before, 100);
    assert!(violation.after <= 50);

    // The cycle stopped before the push.
    assert!(
        !fixture.git.recorded().iter().any(|op| op == "push"),
        "no push after a detected loss"
    );
    Ok(())
}

#[test]
fn concurrent_tick_is_skipped_not_queued() -> Result<()> {
    let fixture = Fixture::new()?;
    let lock_path = fixture.settings.sync_lock_path();
    fs::create_dir_all(lock_path.parent().expect("home"))?;
    let holder = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(&lock_path)?;
    holder.lock_exclusive()?;

    let outcome = fixture.synchronizer().run_cycle()?;
    assert!(matches!(outcome, CycleOutcome::Skipped));
    assert!(fixture.git.recorded().is_empty(), "no git ops while locked");
    Ok(())
}

// --- real-git end-to-end -------------------------------------------------

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn git(repo: &std::path::Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").arg("-C").arg(repo).args(args).output()?;
    if !output.status.success() {
        anyhow::bail!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn init_mirror(home: &std::path::Path) -> Result<(std::path::PathBuf, std::path::PathBuf)> {
    let remote = home.join("remote.git");
    fs::create_dir_all(&remote)?;
    git(&remote, &["init", "--bare", "--quiet", "-b", "main"])?;

    let mirror = home.join("mirror");
    fs::create_dir_all(&mirror)?;
    git(&mirror, &["init", "--quiet", "-b", "main"])?;
    git(&mirror, &["config", "user.email", "granary-test@example.invalid"])?;
    git(&mirror, &["config", "user.name", "granary test"])?;
    git(
        &mirror,
        &["remote", "add", "origin", remote.to_string_lossy().as_ref()],
    )?;
    fs::write(mirror.join("README.md"), "mirror\n")?;
    git(&mirror, &["add", "--", "README.md"])?;
    git(&mirror, &["commit", "--quiet", "-m", "init"])?;
    git(&mirror, &["push", "--quiet", "origin", "HEAD"])?;
    Ok((mirror, remote))
}

#[test]
fn real_git_cycle_protects_the_store_subtree() -> Result<()> {
    if !git_available() {
        eprintln!("skipping real_git_cycle_protects_the_store_subtree (git unavailable)");
        return Ok(());
    }

    let temp = tempdir()?;
    let home = temp.path().join("granary");
    fs::create_dir_all(&home)?;
    let (mirror, remote_repo) = init_mirror(&home)?;

    let home_str = home.to_string_lossy().to_string();
    let mirror_str = mirror.to_string_lossy().to_string();
    let settings = Settings::from_snapshot(&EnvSnapshot::testing(&[
        ("GRANARY_HOME", home_str.as_str()),
        ("GRANARY_MIRROR_PATH", mirror_str.as_str()),
        ("GRANARY_RETRY_DELAY_SECS", "0"),
    ]))?;

    // Fresh calendar cursors: the weekly reflog expiry would wipe the
    // stash this test inspects afterward.
    let now = crate::store::timestamp_secs();
    crate::fsutil::write_atomic(
        &settings.maintenance_path(),
        &serde_json::to_vec_pretty(&granary_domain::MaintenanceState {
            last_weekly_cleanup_at: now,
            last_monthly_cleanup_at: now,
            ..granary_domain::MaintenanceState::default()
        })?,
    )?;

    let store = ContentStore::new(settings.store_path.clone())?;
    let hashes: Vec<String> = (0..3)
        .map(|i| {
            store
                .put_content("producer", format!("content-{i}").as_bytes())
                .map(|r| r.hash)
        })
        .collect::<Result<_>>()?;

    // An unrelated dirty file alongside the store.
    fs::write(mirror.join("notes.txt"), "scratch\n")?;

    let git_port = GitCli::new(settings.mirror_path.clone(), None)?;
    let synchronizer = Synchronizer::new(settings.clone(), Box::new(git_port), store.clone());
    let CycleOutcome::Completed(report) = synchronizer.run_cycle()? else {
        panic!("expected a completed cycle");
    };
    assert!(report.store_committed);
    assert!(report.stashed);

    // Store data is in history and still on disk.
    let log = git(&mirror, &["log", "--oneline"])?;
    assert!(log.contains("granary: sync store"), "log: {log}");
    for hash in &hashes {
        let record = store.get(hash)?.expect("record survives the cycle");
        assert!(!store.read_blob(&record.hash)?.is_empty());
    }

    // The unrelated file went into the stash, not into the sync commit.
    let status = git(&mirror, &["status", "--porcelain"])?;
    assert!(
        !status.contains("notes.txt"),
        "notes.txt should be stashed: {status}"
    );
    let show = git(&mirror, &["show", "--stat", "--name-only", "HEAD"])?;
    assert!(!show.contains("notes.txt"), "sync commit is store-only: {show}");
    let stashes = git(&mirror, &["stash", "list"])?;
    assert!(stashes.contains("granary"), "stash recorded: {stashes}");

    // The remote received the store commit.
    let remote_log = git(&remote_repo, &["log", "--oneline", "main"])?;
    assert!(remote_log.contains("granary: sync store"), "{remote_log}");
    Ok(())
}
