#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]

pub mod commands;
pub mod config;
pub(crate) mod fsutil;
pub mod git;
pub mod guard;
pub mod maintenance;
pub mod outcome;
pub mod ratchet;
pub mod retry;
pub mod store;
pub mod sync;

pub use config::{EnvSnapshot, Settings};
pub use git::{GitCli, GitError, GitPort};
pub use guard::{IntegrityGuard, IntegrityViolation};
pub use maintenance::{MaintenanceFailure, MaintenanceReport, RepoCondition, SizeManager};
pub use outcome::{codes, CommandStatus, ExecutionOutcome};
pub use ratchet::{export_dump, DumpReport, RatchetGuard, RatchetRejected};
pub use retry::RetryPolicy;
pub use store::{ContentStore, DoctorSummary, StoreError};
pub use sync::{CycleOutcome, SyncError, Synchronizer};

pub(crate) const GRANARY_VERSION: &str = env!("CARGO_PKG_VERSION");
