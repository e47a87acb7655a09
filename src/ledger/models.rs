use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Current time truncated to the millisecond precision the ledger file stores.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
    Merging,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Stopped,
        Self::Merging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Merging => "merging",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            "merging" => Ok(Self::Merging),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

/// How integration conflicts are handled when merging into trunk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    AutoTheirs,
    AutoOurs,
    Notify,
    #[default]
    Agent,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoTheirs => "auto_theirs",
            Self::AutoOurs => "auto_ours",
            Self::Notify => "notify",
            Self::Agent => "agent",
        }
    }

    /// The `-X` option passed to `git merge`, if the strategy maps to one.
    pub fn merge_option(&self) -> Option<&'static str> {
        match self {
            Self::AutoTheirs => Some("theirs"),
            Self::AutoOurs => Some("ours"),
            Self::Notify | Self::Agent => None,
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_theirs" => Ok(Self::AutoTheirs),
            "auto_ours" => Ok(Self::AutoOurs),
            "notify" => Ok(Self::Notify),
            "agent" => Ok(Self::Agent),
            _ => Err(format!("Invalid conflict strategy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Merging,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Pending and merging entries block a second enqueue of the same execution.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Merging)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "merging" => Ok(Self::Merging),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid merge queue status: {}", s)),
        }
    }
}

/// Loop counters feeding the stagnation circuit breaker.
///
/// Always replaced as a unit; see [`StagnationCounters::reset`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StagnationCounters {
    pub loop_count: u32,
    pub consecutive_no_progress: u32,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub last_files_changed: u32,
}

impl StagnationCounters {
    pub fn reset() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub project: String,
    pub branch: String,
    pub description: String,
    pub prd_path: PathBuf,
    pub project_root: PathBuf,
    pub worktree_path: Option<PathBuf>,
    pub status: ExecutionStatus,
    pub agent_task_id: Option<String>,
    pub on_conflict: ConflictStrategy,
    pub auto_merge: bool,
    pub notify_on_complete: bool,
    pub dependencies: Vec<String>,
    #[serde(flatten)]
    pub stagnation: StagnationCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Directory the agent works in: the isolated copy when present, else the project root.
    pub fn working_dir(&self) -> &PathBuf {
        self.worktree_path.as_ref().unwrap_or(&self.project_root)
    }
}

/// Composite story identity: `<execution id>:<story code>`.
pub fn story_key(execution_id: &str, story_id: &str) -> String {
    format!("{}:{}", execution_id, story_id)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub execution_id: String,
    pub story_id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: i64,
    pub passes: bool,
    pub notes: String,
}

impl Story {
    pub fn key(&self) -> String {
        story_key(&self.execution_id, &self.story_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MergeQueueEntry {
    pub id: i64,
    pub execution_id: String,
    pub position: i64,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
}

/// Fields an execution update may change. Identity, branch and `created_at`
/// are not representable here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub agent_task_id: Option<String>,
    pub worktree_path: Option<Option<PathBuf>>,
    pub stagnation: Option<StagnationCounters>,
}

impl ExecutionPatch {
    pub fn status(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn agent_started(agent_task_id: impl Into<String>, status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            agent_task_id: Some(agent_task_id.into()),
            ..Self::default()
        }
    }

    pub fn reset_stagnation() -> Self {
        Self {
            stagnation: Some(StagnationCounters::reset()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_stagnation(mut self, counters: StagnationCounters) -> Self {
        self.stagnation = Some(counters);
        self
    }

    pub fn with_worktree(mut self, worktree_path: Option<PathBuf>) -> Self {
        self.worktree_path = Some(worktree_path);
        self
    }

    /// Apply the patch and bump `updated_at`.
    pub fn apply(self, execution: &mut Execution, at: DateTime<Utc>) {
        if let Some(status) = self.status {
            execution.status = status;
        }
        if let Some(agent_task_id) = self.agent_task_id {
            execution.agent_task_id = Some(agent_task_id);
        }
        if let Some(worktree_path) = self.worktree_path {
            execution.worktree_path = worktree_path;
        }
        if let Some(stagnation) = self.stagnation {
            execution.stagnation = stagnation;
        }
        execution.updated_at = at;
    }
}

/// Fields a story update may change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoryPatch {
    pub passes: Option<bool>,
    pub notes: Option<String>,
}

impl StoryPatch {
    pub fn apply(self, story: &mut Story) {
        if let Some(passes) = self.passes {
            story.passes = passes;
        }
        if let Some(notes) = self.notes {
            story.notes = notes;
        }
    }
}

/// Validate that an execution status transition follows the lifecycle state machine.
pub fn is_valid_transition(from: ExecutionStatus, to: ExecutionStatus) -> bool {
    use ExecutionStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Stopped)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Stopped)
            | (Running, Merging)
            | (Completed, Merging)
            | (Failed, Merging)
            | (Failed, Running)
            | (Stopped, Running)
            | (Merging, Completed)
            | (Merging, Failed)
    )
}
