//! The ratchet guard and the bulk export it gates.
//!
//! A dump is only accepted as authoritative when its record count holds up
//! against the historical maximum; the high-water mark itself only ever
//! moves upward, even when an operator overrides a rejection.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::Settings;
use crate::fsutil::write_atomic;
use crate::outcome::codes;
use crate::store::ContentStore;
use granary_domain::RatchetState;

const LATEST_POINTER: &str = "latest";

/// Export blocked by an anomalous count collapse. Recoverable by operator
/// review or an explicit override; not fatal to the process.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("[GR501] export of {current} records rejected: {reason}")]
pub struct RatchetRejected {
    pub current: u64,
    pub reason: String,
}

impl RatchetRejected {
    #[must_use]
    pub fn code(&self) -> &'static str {
        codes::RATCHET_REJECTED
    }
}

pub struct RatchetGuard<'a> {
    settings: &'a Settings,
}

impl<'a> RatchetGuard<'a> {
    #[must_use]
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    /// Check `current` against the persisted high-water mark. On allow,
    /// the mark is advanced (monotonically) and persisted; the override
    /// flag bypasses the checks but never the update semantics.
    pub fn check(&self, current: u64, caller: &str) -> Result<RatchetState> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.load_state(caller, now);

        let required = (state.max_record_count as f64 * self.settings.ratchet_percentage).ceil()
            as u64;
        let mut rejection = None;
        if current < required {
            rejection = Some(format!(
                "count collapsed below {required} ({} of historical max {})",
                self.settings.ratchet_percentage, state.max_record_count
            ));
        } else if current < self.settings.min_records {
            rejection = Some(format!(
                "count below the absolute floor of {} records",
                self.settings.min_records
            ));
        }

        if let Some(reason) = rejection {
            if self.settings.allow_override {
                warn!(current, %reason, "ratchet override in effect; accepting export");
            } else {
                return Err(RatchetRejected { current, reason }.into());
            }
        }

        let advanced = state.advance(current, caller, now);
        self.save_state(&state)?;
        info!(
            current,
            max_record_count = state.max_record_count,
            advanced,
            "ratchet check passed"
        );
        Ok(state)
    }

    fn load_state(&self, caller: &str, now: OffsetDateTime) -> RatchetState {
        let path = self.settings.ratchet_path();
        match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => state,
                Err(err) => {
                    warn!(path = %path.display(), %err, "unreadable ratchet state; starting fresh");
                    RatchetState::new(caller, now)
                }
            },
            Err(_) => RatchetState::new(caller, now),
        }
    }

    fn save_state(&self, state: &RatchetState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state).context("failed to encode ratchet state")?;
        write_atomic(&self.settings.ratchet_path(), &bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpReport {
    pub path: PathBuf,
    pub records: u64,
    pub max_record_count: u64,
}

/// Ratchet-gated bulk export: one JSONL line per record plus an atomically
/// rewritten `latest` pointer. A rejected dump writes nothing.
pub fn export_dump(store: &ContentStore, settings: &Settings, caller: &str) -> Result<DumpReport> {
    let records = store.list_records()?;
    let count = records.len() as u64;

    let state = RatchetGuard::new(settings).check(count, caller)?;

    let stamp = OffsetDateTime::now_utc()
        .format(format_description!(
            "[year][month][day]T[hour][minute][second]Z"
        ))
        .context("failed to format dump timestamp")?;
    let filename = format!("records-{stamp}.jsonl");
    let path = settings.dumps_dir().join(&filename);

    let mut body = Vec::new();
    for record in &records {
        serde_json::to_writer(&mut body, record).context("failed to encode record for dump")?;
        body.push(b'\n');
    }
    write_atomic(&path, &body)?;
    write_atomic(
        &settings.dumps_dir().join(LATEST_POINTER),
        format!("{filename}\n").as_bytes(),
    )?;

    info!(records = count, path = %path.display(), "dump exported");
    Ok(DumpReport {
        path,
        records: count,
        max_record_count: state.max_record_count,
    })
}
