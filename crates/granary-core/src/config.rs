//! Environment-driven configuration.
//!
//! All options come from `GRANARY_*` variables captured once into an
//! [`EnvSnapshot`], so tests can build a [`Settings`] without touching the
//! process environment. Invalid values fall back to their defaults with a
//! warning; configuration must never stop the daemon from starting.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

const GIB: u64 = 1024 * 1024 * 1024;

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 12 * 60 * 60;
const DEFAULT_RETRY_DELAY_SECS: u64 = 60;
const DEFAULT_REPO_WARN_BYTES: u64 = 5 * GIB;
const DEFAULT_REPO_CRIT_BYTES: u64 = 10 * GIB;
const DEFAULT_REPO_HARD_CAP_BYTES: u64 = 20 * GIB;
const DEFAULT_RATCHET_PERCENTAGE: f64 = 0.9;
const DEFAULT_MIN_RECORDS: u64 = 100;
const DEFAULT_GUARD_TOLERANCE: f64 = 0.95;
const DEFAULT_STORE_SUBTREE: &str = "store";

#[derive(Debug, Clone)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub(crate) fn flag_is_enabled(&self, key: &str) -> bool {
        match self.vars.get(key).map(String::as_str) {
            Some(value) => {
                let lowered = value.to_ascii_lowercase();
                matches!(lowered.as_str(), "1" | "true" | "yes" | "on")
            }
            None => false,
        }
    }

    #[must_use]
    pub fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Resolved configuration for one granary home.
#[derive(Debug, Clone)]
pub struct Settings {
    pub home: PathBuf,
    pub mirror_path: PathBuf,
    pub store_path: PathBuf,
    /// Mirror-relative name of the protected subtree.
    pub store_subtree: String,
    /// Remote URL of the distribution repository; required for push/clone.
    pub remote: Option<String>,
    pub sync_interval: Duration,
    pub retry_delay: Duration,
    pub repo_warn_bytes: u64,
    pub repo_crit_bytes: u64,
    pub repo_hard_cap_bytes: u64,
    pub ratchet_percentage: f64,
    pub min_records: u64,
    pub allow_override: bool,
    pub guard_tolerance: f64,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let home = match snapshot.var("GRANARY_HOME") {
            Some(path) => PathBuf::from(path),
            None => dirs_next::home_dir()
                .context("failed to resolve HOME for the granary root")?
                .join(".granary"),
        };
        let mirror_path = snapshot
            .var("GRANARY_MIRROR_PATH")
            .map_or_else(|| home.join("mirror"), PathBuf::from);
        let store_subtree = snapshot
            .var("GRANARY_STORE_SUBTREE")
            .unwrap_or(DEFAULT_STORE_SUBTREE)
            .to_string();
        let store_path = snapshot
            .var("GRANARY_STORE_PATH")
            .map_or_else(|| mirror_path.join(&store_subtree), PathBuf::from);

        Ok(Self {
            home,
            mirror_path,
            store_path,
            store_subtree,
            remote: snapshot.var("GRANARY_REMOTE").map(ToOwned::to_owned),
            sync_interval: Duration::from_secs(parse_u64(
                snapshot,
                "GRANARY_SYNC_INTERVAL_SECS",
                DEFAULT_SYNC_INTERVAL_SECS,
            )),
            retry_delay: Duration::from_secs(parse_u64(
                snapshot,
                "GRANARY_RETRY_DELAY_SECS",
                DEFAULT_RETRY_DELAY_SECS,
            )),
            repo_warn_bytes: parse_u64(snapshot, "GRANARY_REPO_WARN_BYTES", DEFAULT_REPO_WARN_BYTES),
            repo_crit_bytes: parse_u64(snapshot, "GRANARY_REPO_CRIT_BYTES", DEFAULT_REPO_CRIT_BYTES),
            repo_hard_cap_bytes: parse_u64(
                snapshot,
                "GRANARY_REPO_HARD_CAP_BYTES",
                DEFAULT_REPO_HARD_CAP_BYTES,
            ),
            ratchet_percentage: parse_fraction(
                snapshot,
                "GRANARY_RATCHET_PERCENTAGE",
                DEFAULT_RATCHET_PERCENTAGE,
            ),
            min_records: parse_u64(snapshot, "GRANARY_MIN_RECORDS", DEFAULT_MIN_RECORDS),
            allow_override: snapshot.flag_is_enabled("GRANARY_ALLOW_OVERRIDE"),
            guard_tolerance: parse_fraction(
                snapshot,
                "GRANARY_GUARD_TOLERANCE",
                DEFAULT_GUARD_TOLERANCE,
            ),
        })
    }

    #[must_use]
    pub fn dumps_dir(&self) -> PathBuf {
        self.home.join("dumps")
    }

    #[must_use]
    pub fn ratchet_path(&self) -> PathBuf {
        self.dumps_dir().join("ratchet.json")
    }

    #[must_use]
    pub fn maintenance_path(&self) -> PathBuf {
        self.home.join("maintenance.json")
    }

    #[must_use]
    pub fn sync_lock_path(&self) -> PathBuf {
        self.home.join("sync.lock")
    }
}

fn parse_u64(snapshot: &EnvSnapshot, key: &str, default: u64) -> u64 {
    match snapshot.var(key) {
        None => default,
        Some(raw) => match raw.parse::<u64>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = raw, default, "ignoring unparseable setting");
                default
            }
        },
    }
}

fn parse_fraction(snapshot: &EnvSnapshot, key: &str, default: f64) -> f64 {
    match snapshot.var(key) {
        None => default,
        Some(raw) => match raw.parse::<f64>() {
            Ok(value) if (0.0..=1.0).contains(&value) => value,
            _ => {
                warn!(key, value = raw, default, "ignoring out-of-range setting");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() -> Result<()> {
        let snapshot = EnvSnapshot::testing(&[("GRANARY_HOME", "/data/granary")]);
        let settings = Settings::from_snapshot(&snapshot)?;

        assert_eq!(settings.home, PathBuf::from("/data/granary"));
        assert_eq!(settings.mirror_path, PathBuf::from("/data/granary/mirror"));
        assert_eq!(
            settings.store_path,
            PathBuf::from("/data/granary/mirror/store")
        );
        assert_eq!(settings.store_subtree, "store");
        assert_eq!(settings.sync_interval, Duration::from_secs(43_200));
        assert_eq!(settings.retry_delay, Duration::from_secs(60));
        assert_eq!(settings.repo_warn_bytes, 5 * GIB);
        assert_eq!(settings.repo_crit_bytes, 10 * GIB);
        assert_eq!(settings.repo_hard_cap_bytes, 20 * GIB);
        assert!((settings.ratchet_percentage - 0.9).abs() < f64::EPSILON);
        assert_eq!(settings.min_records, 100);
        assert!(!settings.allow_override);
        assert!((settings.guard_tolerance - 0.95).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn overrides_are_honored() -> Result<()> {
        let snapshot = EnvSnapshot::testing(&[
            ("GRANARY_HOME", "/data/granary"),
            ("GRANARY_MIRROR_PATH", "/repos/mirror"),
            ("GRANARY_STORE_SUBTREE", "contents"),
            ("GRANARY_REMOTE", "https://example.invalid/mirror.git"),
            ("GRANARY_SYNC_INTERVAL_SECS", "60"),
            ("GRANARY_MIN_RECORDS", "5"),
            ("GRANARY_ALLOW_OVERRIDE", "true"),
            ("GRANARY_RATCHET_PERCENTAGE", "0.5"),
        ]);
        let settings = Settings::from_snapshot(&snapshot)?;

        assert_eq!(settings.mirror_path, PathBuf::from("/repos/mirror"));
        assert_eq!(settings.store_path, PathBuf::from("/repos/mirror/contents"));
        assert_eq!(
            settings.remote.as_deref(),
            Some("https://example.invalid/mirror.git")
        );
        assert_eq!(settings.sync_interval, Duration::from_secs(60));
        assert_eq!(settings.min_records, 5);
        assert!(settings.allow_override);
        assert!((settings.ratchet_percentage - 0.5).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() -> Result<()> {
        let snapshot = EnvSnapshot::testing(&[
            ("GRANARY_HOME", "/data/granary"),
            ("GRANARY_SYNC_INTERVAL_SECS", "soon"),
            ("GRANARY_RATCHET_PERCENTAGE", "1.5"),
        ]);
        let settings = Settings::from_snapshot(&snapshot)?;

        assert_eq!(settings.sync_interval, Duration::from_secs(43_200));
        assert!((settings.ratchet_percentage - 0.9).abs() < f64::EPSILON);
        Ok(())
    }
}
