#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod record;
pub mod state;

pub use record::{ContentRecord, ContentStatus, Statistics, UnknownStatus};
pub use state::{MaintenanceState, RatchetState};
