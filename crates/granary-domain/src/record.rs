use serde::{Deserialize, Serialize};

/// Lifecycle states of a content record.
///
/// Transitions form a one-way lattice: `pending -> processing ->
/// {completed, failed}`. A record never moves backwards and a terminal
/// state is final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown content status '{0}'")]
pub struct UnknownStatus(pub String);

impl ContentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl TryFrom<&str> for ContentStatus {
    type Error = UnknownStatus;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One entry per distinct content hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    /// Hex sha-256 of the blob; primary key, immutable.
    pub hash: String,
    pub status: ContentStatus,
    /// Opaque identifier of the originating producer.
    pub source_id: String,
    /// Unix seconds.
    pub created_at: u64,
    /// Unix seconds; set exactly once on the terminal transition.
    pub completed_at: Option<u64>,
    pub size_bytes: u64,
    /// Store-relative path of the blob.
    pub blob_ref: String,
}

/// Point-in-time consistent counters over the whole record set.
///
/// Records in `processing` are counted under `pending`: processing is an
/// in-flight refinement of pending, and folding it in keeps
/// `total == completed + pending + failed` on every read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: u64,
    pub completed: u64,
    pub pending: u64,
    pub failed: u64,
}

impl Statistics {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.total == self.completed + self.pending + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ContentStatus::Pending,
            ContentStatus::Processing,
            ContentStatus::Completed,
            ContentStatus::Failed,
        ] {
            assert_eq!(ContentStatus::try_from(status.as_str()), Ok(status));
        }
        assert_eq!(
            ContentStatus::try_from("done"),
            Err(UnknownStatus("done".to_string()))
        );
    }

    #[test]
    fn transitions_are_monotonic() {
        use ContentStatus::{Completed, Failed, Pending, Processing};

        assert!(Pending.can_transition(Processing));
        assert!(Processing.can_transition(Completed));
        assert!(Processing.can_transition(Failed));

        // No skips, no reverts, no terminal exits.
        assert!(!Pending.can_transition(Completed));
        assert!(!Pending.can_transition(Failed));
        assert!(!Processing.can_transition(Pending));
        assert!(!Completed.can_transition(Processing));
        assert!(!Completed.can_transition(Failed));
        assert!(!Failed.can_transition(Pending));
    }

    #[test]
    fn statistics_identity() {
        let stats = Statistics {
            total: 10,
            completed: 4,
            pending: 5,
            failed: 1,
        };
        assert!(stats.is_consistent());
        let torn = Statistics {
            total: 10,
            completed: 4,
            pending: 5,
            failed: 0,
        };
        assert!(!torn.is_consistent());
    }
}
