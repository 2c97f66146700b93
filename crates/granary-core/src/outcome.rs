//! Command result envelopes shared by the CLI and the command layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Diagnostic codes carried in error displays and outcome details.
pub mod codes {
    pub const MISSING: &str = "GR800";
    pub const DIGEST_MISMATCH: &str = "GR801";
    pub const INVALID_HASH: &str = "GR802";
    pub const STORE_WRITE_FAILURE: &str = "GR810";
    pub const INDEX_CORRUPT: &str = "GR811";
    pub const FORMAT_INCOMPATIBLE: &str = "GR812";
    pub const INVALID_TRANSITION: &str = "GR820";
    pub const STORE_UNAVAILABLE: &str = "GR830";
    pub const COMMIT_FAILED: &str = "GR301";
    pub const PUSH_FAILED: &str = "GR302";
    pub const GIT_COMMAND: &str = "GR310";
    pub const MAINTENANCE: &str = "GR401";
    pub const RATCHET_REJECTED: &str = "GR501";
    pub const INTEGRITY_VIOLATION: &str = "GR900";
    pub const GENERIC: &str = "GR000";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: CommandStatus,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl ExecutionOutcome {
    pub fn success(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Ok,
            message: message.into(),
            details,
        }
    }

    pub fn user_error(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::UserError,
            message: message.into(),
            details,
        }
    }

    pub fn failure(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Failure,
            message: message.into(),
            details,
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.status {
            CommandStatus::Ok => 0,
            CommandStatus::UserError => 1,
            CommandStatus::Failure => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommandStatus {
    Ok,
    UserError,
    Failure,
}
