//! Thin command layer: each entry point maps component results into an
//! [`ExecutionOutcome`] envelope for the CLI to render.

use serde_json::{json, Value};

use crate::config::Settings;
use crate::git::GitCli;
use crate::guard::IntegrityViolation;
use crate::maintenance::SizeManager;
use crate::outcome::{codes, ExecutionOutcome};
use crate::ratchet::{export_dump, RatchetRejected};
use crate::retry::RetryPolicy;
use crate::store::{ContentStore, StoreError};
use crate::sync::{CycleOutcome, SyncError, Synchronizer};
use granary_domain::{ContentRecord, ContentStatus};

pub struct IngestInput {
    pub label: String,
    pub bytes: Vec<u8>,
}

pub fn ingest(settings: &Settings, source_id: &str, inputs: Vec<IngestInput>) -> ExecutionOutcome {
    let store = match open_store(settings) {
        Ok(store) => store,
        Err(outcome) => return *outcome,
    };

    let mut stored = Vec::new();
    for input in inputs {
        match store.put_content(source_id, &input.bytes) {
            Ok(record) => stored.push(json!({
                "input": input.label,
                "hash": record.hash,
                "status": record.status.as_str(),
                "size_bytes": record.size_bytes,
            })),
            Err(err) => return store_failure("failed to ingest content", &err),
        }
    }
    let count = stored.len();
    ExecutionOutcome::success(
        format!("ingested {count} input(s)"),
        json!({ "records": stored }),
    )
}

pub fn record(settings: &Settings, hash: &str) -> ExecutionOutcome {
    let store = match open_store(settings) {
        Ok(store) => store,
        Err(outcome) => return *outcome,
    };
    match store.get(hash) {
        Ok(Some(record)) => {
            ExecutionOutcome::success(format!("record {hash}"), record_details(&record))
        }
        Ok(None) => ExecutionOutcome::user_error(
            format!("no record for hash {hash}"),
            json!({ "code": codes::MISSING, "hash": hash }),
        ),
        Err(err) => store_failure("failed to look up record", &err),
    }
}

pub fn mark(settings: &Settings, hash: &str, status: ContentStatus) -> ExecutionOutcome {
    let store = match open_store(settings) {
        Ok(store) => store,
        Err(outcome) => return *outcome,
    };
    let result = match status {
        ContentStatus::Processing => store.mark_processing(hash),
        ContentStatus::Completed => store.mark_completed(hash),
        ContentStatus::Failed => store.mark_failed(hash),
        ContentStatus::Pending => {
            return ExecutionOutcome::user_error(
                "records start out pending; there is no transition back to it",
                json!({ "code": codes::INVALID_TRANSITION, "hash": hash }),
            )
        }
    };
    match result {
        Ok(record) => ExecutionOutcome::success(
            format!("record {hash} is now {}", record.status.as_str()),
            record_details(&record),
        ),
        Err(err) => match err.downcast_ref::<StoreError>() {
            Some(store_err @ (StoreError::InvalidTransition { .. } | StoreError::MissingRecord { .. })) => {
                ExecutionOutcome::user_error(
                    store_err.to_string(),
                    json!({ "code": store_err.code(), "hash": hash }),
                )
            }
            _ => store_failure("failed to update record status", &err),
        },
    }
}

/// Statistics with the degraded-availability contract: contention maps to
/// a user-level "temporarily unavailable" outcome, never a crash.
pub fn stats(settings: &Settings) -> ExecutionOutcome {
    let store = match open_store(settings) {
        Ok(store) => store,
        Err(outcome) => return *outcome,
    };
    match store.statistics_with_retry(&RetryPolicy::statistics()) {
        Ok(stats) => ExecutionOutcome::success(
            format!(
                "{} records ({} completed, {} pending, {} failed)",
                stats.total, stats.completed, stats.pending, stats.failed
            ),
            json!({
                "total": stats.total,
                "completed": stats.completed,
                "pending": stats.pending,
                "failed": stats.failed,
            }),
        ),
        Err(err) => match err.downcast_ref::<StoreError>() {
            Some(unavailable @ StoreError::Unavailable { .. }) => ExecutionOutcome::user_error(
                "statistics temporarily unavailable",
                json!({
                    "code": unavailable.code(),
                    "degraded": true,
                    "error": unavailable.to_string(),
                }),
            ),
            _ => store_failure("failed to read statistics", &err),
        },
    }
}

pub fn sync_once(settings: &Settings) -> ExecutionOutcome {
    run_sync(settings, false)
}

pub fn sync_daemon(settings: &Settings) -> ExecutionOutcome {
    run_sync(settings, true)
}

fn run_sync(settings: &Settings, daemon: bool) -> ExecutionOutcome {
    if !settings.mirror_path.join(".git").exists() {
        return ExecutionOutcome::user_error(
            "mirror working copy is not a git repository",
            json!({
                "code": codes::GIT_COMMAND,
                "mirror": settings.mirror_path.display().to_string(),
                "hint": "Clone your distribution repository to the mirror path first.",
            }),
        );
    }
    let store = match open_store(settings) {
        Ok(store) => store,
        Err(outcome) => return *outcome,
    };
    let git = match GitCli::new(settings.mirror_path.clone(), settings.remote.clone()) {
        Ok(git) => git,
        Err(err) => {
            return ExecutionOutcome::failure(
                "failed to prepare the git port",
                json!({ "code": codes::GIT_COMMAND, "error": err.to_string() }),
            )
        }
    };

    let synchronizer = Synchronizer::new(settings.clone(), Box::new(git), store);
    let result = if daemon {
        match synchronizer.run_daemon() {
            Ok(()) => return ExecutionOutcome::success("sync daemon stopped", json!({})),
            Err(err) => Err(err),
        }
    } else {
        synchronizer.run_cycle()
    };
    match result {
        Ok(CycleOutcome::Skipped) => ExecutionOutcome::success(
            "sync skipped; another cycle is in flight",
            json!({ "skipped": true }),
        ),
        Ok(CycleOutcome::Completed(report)) => ExecutionOutcome::success(
            "sync cycle complete",
            json!({
                "store_committed": report.store_committed,
                "stashed": report.stashed,
                "pushed": report.pushed,
                "maintenance": report.maintenance.map(|m| json!({
                    "condition": m.condition.as_str(),
                    "repo_size_bytes": m.repo_size_bytes,
                    "history_size_bytes": m.history_size_bytes,
                    "weekly_ran": m.weekly_ran,
                    "monthly_ran": m.monthly_ran,
                    "recloned": m.recloned,
                })),
            }),
        ),
        Err(err) => {
            if let Some(violation) = err.downcast_ref::<IntegrityViolation>() {
                ExecutionOutcome::failure(
                    violation.to_string(),
                    json!({
                        "code": codes::INTEGRITY_VIOLATION,
                        "before": violation.before,
                        "after": violation.after,
                        "hint": "Operator intervention required; the sync pipeline is halted.",
                    }),
                )
            } else if let Some(sync_err) = err.downcast_ref::<SyncError>() {
                ExecutionOutcome::failure(
                    sync_err.to_string(),
                    json!({ "code": sync_err.code() }),
                )
            } else {
                ExecutionOutcome::failure(
                    "sync cycle failed",
                    json!({ "code": codes::GENERIC, "error": format!("{err:#}") }),
                )
            }
        }
    }
}

pub fn maintain(settings: &Settings) -> ExecutionOutcome {
    let git = match GitCli::new(settings.mirror_path.clone(), settings.remote.clone()) {
        Ok(git) => git,
        Err(err) => {
            return ExecutionOutcome::failure(
                "failed to prepare the git port",
                json!({ "code": codes::GIT_COMMAND, "error": err.to_string() }),
            )
        }
    };
    match SizeManager::new(settings).run(&git) {
        Ok(report) => ExecutionOutcome::success(
            format!("mirror is {}", report.condition.as_str()),
            json!({
                "condition": report.condition.as_str(),
                "repo_size_bytes": report.repo_size_bytes,
                "history_size_bytes": report.history_size_bytes,
                "weekly_ran": report.weekly_ran,
                "monthly_ran": report.monthly_ran,
                "recloned": report.recloned,
            }),
        ),
        Err(err) => ExecutionOutcome::failure(
            "maintenance failed; it will be retried next cycle",
            json!({ "code": codes::MAINTENANCE, "error": format!("{err:#}") }),
        ),
    }
}

pub fn dump(settings: &Settings, caller: &str) -> ExecutionOutcome {
    let store = match open_store(settings) {
        Ok(store) => store,
        Err(outcome) => return *outcome,
    };
    match export_dump(&store, settings, caller) {
        Ok(report) => ExecutionOutcome::success(
            format!("exported {} records", report.records),
            json!({
                "path": report.path.display().to_string(),
                "records": report.records,
                "max_record_count": report.max_record_count,
            }),
        ),
        Err(err) => match err.downcast_ref::<RatchetRejected>() {
            Some(rejected) => ExecutionOutcome::user_error(
                rejected.to_string(),
                json!({
                    "code": rejected.code(),
                    "current": rejected.current,
                    "hint": "Review the collapse, or set GRANARY_ALLOW_OVERRIDE=1 to export anyway.",
                }),
            ),
            None => ExecutionOutcome::failure(
                "dump export failed",
                json!({ "code": codes::GENERIC, "error": format!("{err:#}") }),
            ),
        },
    }
}

pub fn doctor(settings: &Settings) -> ExecutionOutcome {
    let store = match open_store(settings) {
        Ok(store) => store,
        Err(outcome) => return *outcome,
    };
    match store.doctor() {
        Ok(summary) => ExecutionOutcome::success(
            format!(
                "store verified: {} records, {} blobs",
                summary.records_scanned, summary.blobs_scanned
            ),
            json!({
                "records_scanned": summary.records_scanned,
                "blobs_scanned": summary.blobs_scanned,
                "rows_pruned": summary.rows_pruned,
                "corrupt_blobs": summary.corrupt_blobs,
                "recovered": summary.recovered,
                "partials_removed": summary.partials_removed,
            }),
        ),
        Err(err) => store_failure("store verification failed", &err),
    }
}

fn open_store(settings: &Settings) -> Result<ContentStore, Box<ExecutionOutcome>> {
    ContentStore::new(settings.store_path.clone()).map_err(|err| {
        Box::new(store_failure("failed to open the content store", &err))
    })
}

fn store_failure(message: &str, err: &anyhow::Error) -> ExecutionOutcome {
    let code = err
        .downcast_ref::<StoreError>()
        .map_or(codes::GENERIC, StoreError::code);
    ExecutionOutcome::failure(message, json!({ "code": code, "error": format!("{err:#}") }))
}

fn record_details(record: &ContentRecord) -> Value {
    json!({
        "hash": record.hash,
        "status": record.status.as_str(),
        "source_id": record.source_id,
        "created_at": record.created_at,
        "completed_at": record.completed_at,
        "size_bytes": record.size_bytes,
        "blob_ref": record.blob_ref,
    })
}
