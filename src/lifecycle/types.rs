//! Request and response records for lifecycle operations.
//!
//! Each request names exactly the inputs its operation accepts; responses
//! serialize to camelCase JSON for the CLI.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dependency::DependencyStatus;
use crate::ledger::{
    ConflictStrategy, Execution, ExecutionStatus, MergeQueueEntry, StagnationCounters, Story,
};
use crate::stagnation::{RiskAssessment, StagnationVerdict};

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub prd_path: PathBuf,
    pub project_root: PathBuf,
    /// Create an isolated worktree for the branch.
    pub worktree: bool,
    /// Return a work prompt for the agent right away.
    pub auto_start: bool,
    pub auto_merge: bool,
    pub notify_on_complete: bool,
    /// Falls back to the configured default strategy.
    pub on_conflict: Option<ConflictStrategy>,
    pub context_path: Option<PathBuf>,
}

impl StartRequest {
    pub fn new(prd_path: impl Into<PathBuf>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            prd_path: prd_path.into(),
            project_root: project_root.into(),
            worktree: true,
            auto_start: true,
            auto_merge: true,
            notify_on_complete: true,
            on_conflict: None,
            context_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorySummary {
    pub story_id: String,
    pub title: String,
    pub priority: i64,
    pub passes: bool,
}

impl From<&Story> for StorySummary {
    fn from(story: &Story) -> Self {
        Self {
            story_id: story.story_id.clone(),
            title: story.title.clone(),
            priority: story.priority,
            passes: story.passes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResult {
    pub execution_id: String,
    pub branch: String,
    pub status: ExecutionStatus,
    pub worktree_path: Option<PathBuf>,
    pub agent_prompt: Option<String>,
    pub stories: Vec<StorySummary>,
}

#[derive(Debug, Clone)]
pub struct BatchStartRequest {
    pub prd_paths: Vec<PathBuf>,
    pub project_root: PathBuf,
    pub worktree: bool,
    pub auto_merge: bool,
    pub notify_on_complete: bool,
    pub on_conflict: Option<ConflictStrategy>,
    pub context_path: Option<PathBuf>,
    /// Install dependencies in each new worktree, one at a time.
    pub preheat: bool,
}

impl BatchStartRequest {
    pub fn new(prd_paths: Vec<PathBuf>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            prd_paths,
            project_root: project_root.into(),
            worktree: true,
            auto_merge: true,
            notify_on_complete: true,
            on_conflict: None,
            context_path: None,
            preheat: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedPrd {
    pub prd_path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyExecution {
    pub branch: String,
    pub agent_prompt: String,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingExecution {
    pub branch: String,
    pub pending_dependencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStartResult {
    pub total: usize,
    pub created: usize,
    pub skipped: Vec<SkippedPrd>,
    pub ready_to_start: Vec<ReadyExecution>,
    pub waiting_for_dependencies: Vec<WaitingExecution>,
    /// Branch to its prerequisite branches.
    pub dependency_graph: BTreeMap<String, Vec<String>>,
    pub preheat_completed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StatusFilter {
    pub project: Option<String>,
    pub status: Option<ExecutionStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub branch: String,
    pub description: String,
    pub status: ExecutionStatus,
    /// `completed/total`.
    pub progress: String,
    pub completed_stories: usize,
    pub total_stories: usize,
    pub worktree_path: Option<PathBuf>,
    pub agent_task_id: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
    pub merging: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: ExecutionStatus) {
        self.total += 1;
        match status {
            ExecutionStatus::Pending => self.pending += 1,
            ExecutionStatus::Running => self.running += 1,
            ExecutionStatus::Completed => self.completed += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Stopped => self.stopped += 1,
            ExecutionStatus::Merging => self.merging += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub executions: Vec<ExecutionSummary>,
    pub summary: StatusCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percentage: u32,
}

impl Progress {
    pub fn of(stories: &[Story]) -> Self {
        let completed = stories.iter().filter(|s| s.passes).count();
        let total = stories.len();
        let percentage = if total == 0 {
            0
        } else {
            ((completed as f64 / total as f64) * 100.0).round() as u32
        };
        Self {
            completed,
            total,
            percentage,
        }
    }

    pub fn fraction(&self) -> String {
        format!("{}/{}", self.completed, self.total)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StagnationReport {
    #[serde(flatten)]
    pub counters: StagnationCounters,
    #[serde(flatten)]
    pub risk: RiskAssessment,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDetail {
    pub execution: Execution,
    pub stories: Vec<Story>,
    pub progress: Progress,
    pub stagnation: StagnationReport,
    pub dependencies: DependencyStatus,
    pub queue_entry: Option<MergeQueueEntry>,
}

#[derive(Debug, Clone)]
pub struct StoryUpdate {
    pub branch: String,
    pub story_id: String,
    pub passes: bool,
    /// `None` keeps the existing notes.
    pub notes: Option<String>,
    pub files_changed: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyDependent {
    pub branch: String,
    pub agent_prompt: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryUpdateResult {
    pub success: bool,
    pub branch: String,
    pub story_id: String,
    pub passes: bool,
    pub status: ExecutionStatus,
    pub all_complete: bool,
    pub progress: String,
    pub added_to_merge_queue: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_queue_position: Option<i64>,
    pub stagnation: StagnationVerdict,
    pub ready_dependents: Vec<ReadyDependent>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StopRequest {
    pub cleanup: bool,
    pub delete_record: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResult {
    pub success: bool,
    pub branch: String,
    pub previous_status: ExecutionStatus,
    pub cleaned_up: bool,
    pub deleted: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResult {
    pub success: bool,
    pub branch: String,
    pub message: String,
    pub previous_status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    /// Stories still failing, for prompt regeneration.
    pub remaining_stories: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetStagnationResult {
    pub success: bool,
    pub branch: String,
    pub message: String,
    pub previous_status: ExecutionStatus,
    pub new_status: ExecutionStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAgentIdResult {
    pub success: bool,
    pub branch: String,
    pub agent_task_id: String,
    pub status: ExecutionStatus,
}
