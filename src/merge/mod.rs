//! Integration of finished executions into trunk.
//!
//! [`MergeOrchestrator`] runs one attempt end to end; [`MergeQueue`] makes
//! sure attempts run one at a time in queue order.

pub mod helpers;
mod orchestrator;
mod queue;

use std::path::PathBuf;

pub use orchestrator::{
    ConflictResolution, MergeFailure, MergeOptions, MergeOrchestrator, MergeReport, QualityChecks,
};
pub use queue::{MergeQueue, ProcessReport, QueueReport};

use crate::config::MergeSection;

/// Integration settings taken from the `[merge]` config section.
#[derive(Debug, Clone)]
pub struct MergeSettings {
    pub trunk_branch: String,
    /// Repo-relative file that gets the model-aware conflict resolution.
    pub known_conflict_file: PathBuf,
}

impl MergeSettings {
    pub fn from_section(section: &MergeSection) -> Self {
        Self {
            trunk_branch: section.trunk_branch.clone(),
            known_conflict_file: PathBuf::from(&section.known_conflict_file),
        }
    }
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self::from_section(&MergeSection::default())
    }
}
