//! Typed error hierarchy for the Ralph orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `LedgerError`: storage, lookups, and persisted-record corruption
//! - `LifecycleError`: execution state machine and start/batch operations
//! - `MergeError`: integration attempts that could not produce a `MergeReport`

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the ledger store.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("No execution found with id: {id}")]
    ExecutionNotFound { id: String },

    #[error("No execution found for branch: {branch}")]
    BranchNotFound { branch: String },

    #[error("No story found with id: {key}")]
    StoryNotFound { key: String },

    #[error("No merge queue entry found with id: {id}")]
    QueueEntryNotFound { id: i64 },

    #[error("Execution already exists for branch {branch}")]
    DuplicateBranch { branch: String },

    #[error("Branch {branch} already has a pending or merging queue entry")]
    AlreadyQueued { branch: String },

    #[error("Invalid date in {field}: {value}")]
    CorruptTimestamp { field: String, value: String },

    #[error("Corrupt ledger record in {field}: {message}")]
    CorruptRecord { field: String, message: String },

    #[error("Ledger I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to (de)serialize ledger: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Ledger task panicked: {0}")]
    TaskPanicked(String),
}

impl LedgerError {
    /// True for lookups that failed because the identity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ExecutionNotFound { .. }
                | Self::BranchNotFound { .. }
                | Self::StoryNotFound { .. }
                | Self::QueueEntryNotFound { .. }
        )
    }
}

/// Errors from the execution lifecycle controller.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Cannot {action} execution {branch} while it is {from}")]
    InvalidTransition {
        branch: String,
        from: String,
        action: &'static str,
    },

    #[error(
        "Execution {branch} was halted by the stagnation circuit breaker; reset stagnation or retry before sending updates"
    )]
    Halted { branch: String },

    #[error("Failed to parse PRD at {path}: {source}")]
    Document {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Collaborator failed: {0}")]
    Collaborator(#[source] anyhow::Error),
}

/// Errors from an integration attempt that never produced a report.
///
/// Every variant raised after the execution entered `merging` is raised only
/// after the execution has been moved to `failed`.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Cannot merge: {completed}/{total} stories complete. Use force to override.")]
    IncompleteStories { completed: usize, total: usize },

    #[error("Execution {branch} is already merging")]
    AlreadyMerging { branch: String },

    #[error("Cannot merge {branch} while {current} is merging")]
    TrunkBusy { branch: String, current: String },

    #[error("Cannot merge execution {branch} while it is {status}")]
    NotMergeable { branch: String, status: String },

    #[error("Failed to sync trunk: {0}")]
    SyncFailed(String),

    #[error("Integration collaborator failed: {0}")]
    Collaborator(#[source] anyhow::Error),
}
