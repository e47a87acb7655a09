//! Seams to the outside world.
//!
//! Ledger-facing logic only talks to these traits. Real implementations shell
//! out to git, the verification toolchain, and the coding agent; tests use the
//! doubles in `crate::testing`.

pub mod agent;
pub mod git;
pub mod notify;
pub mod verify;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::RalphConfig;
use crate::ledger::Story;
use crate::prd::{ParsedDocument, PrdParser};

pub use agent::ClaudeDispatcher;
pub use git::{GitTrunk, GitWorktrees};
pub use notify::CommandNotifier;
pub use verify::CommandVerifier;

/// Result of reconciling trunk into an isolated copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Clean,
    Conflicts(Vec<String>),
    Failed(String),
}

/// Result of a no-fast-forward merge into trunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAttempt {
    Merged { commit: String },
    Conflicts(Vec<String>),
}

/// Output of an external command that may fail without being an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub ok: bool,
    pub output: String,
}

impl CommandOutcome {
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: output.into(),
        }
    }
}

/// Isolated working copies, one per branch.
#[async_trait]
pub trait WorktreeManager: Send + Sync {
    async fn create(&self, root: &Path, branch: &str) -> Result<PathBuf>;

    /// Idempotent: an absent path is not an error.
    async fn remove(&self, root: &Path, path: &Path) -> Result<()>;

    async fn list_conflict_files(&self, dir: &Path) -> Result<Vec<String>>;

    async fn sync_trunk_into(&self, path: &Path, branch: &str) -> Result<SyncOutcome>;

    /// Warm dependencies in a fresh copy. Default does nothing.
    async fn preheat(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Operations against the shared trunk checkout.
#[async_trait]
pub trait TrunkOps: Send + Sync {
    /// Bring local trunk up to date with `origin`. `Ok(false)` when there is
    /// no `origin` remote.
    async fn pull(&self, root: &Path) -> Result<bool>;

    /// Publish local trunk to `origin`. `Ok(false)` when there is no
    /// `origin` remote.
    async fn push(&self, root: &Path) -> Result<bool>;

    async fn is_merged(&self, root: &Path, branch: &str) -> Result<bool>;

    async fn merge_no_ff(
        &self,
        root: &Path,
        branch: &str,
        strategy_option: Option<&str>,
        message: &str,
    ) -> Result<MergeAttempt>;

    /// Conclude an in-progress merge; returns the new head commit.
    async fn commit_merge(&self, root: &Path, message: &str) -> Result<String>;

    async fn abort_merge(&self, root: &Path) -> Result<()>;

    async fn head_commit(&self, root: &Path) -> Result<String>;

    async fn stage(&self, dir: &Path, paths: &[PathBuf]) -> Result<()>;

    /// Stage `paths` and fold them into the head commit.
    async fn amend_with(&self, root: &Path, paths: &[PathBuf]) -> Result<()>;
}

/// Type-check and build commands. Timeouts count as failures.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn type_check(&self, path: &Path) -> CommandOutcome;
    async fn build(&self, path: &Path) -> CommandOutcome;
}

/// Inputs for the work prompt handed to a coding agent.
#[derive(Debug, Clone)]
pub struct WorkPrompt<'a> {
    pub branch: &'a str,
    pub description: &'a str,
    pub working_dir: &'a Path,
    pub stories: &'a [Story],
    pub context_path: Option<&'a Path>,
    pub loop_count: Option<u32>,
}

/// Inputs for the conflict-resolution prompt.
#[derive(Debug, Clone)]
pub struct ConflictPrompt<'a> {
    pub project_root: &'a Path,
    pub branch: &'a str,
    pub description: &'a str,
    pub conflict_files: &'a [String],
    pub prd_path: Option<&'a Path>,
}

#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    fn work_prompt(&self, request: &WorkPrompt<'_>) -> String;
    fn conflict_prompt(&self, request: &ConflictPrompt<'_>) -> String;
    async fn invoke(&self, root: &Path, prompt: &str) -> CommandOutcome;
}

/// Fire-and-forget notifications; implementations swallow their own failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, message: &str);
}

pub trait DocumentParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<ParsedDocument>;
}

/// Every collaborator the controllers need, behind trait objects.
#[derive(Clone)]
pub struct Collaborators {
    pub worktrees: Arc<dyn WorktreeManager>,
    pub trunk: Arc<dyn TrunkOps>,
    pub verifier: Arc<dyn Verifier>,
    pub agent: Arc<dyn AgentDispatcher>,
    pub notifier: Arc<dyn Notifier>,
    pub parser: Arc<dyn DocumentParser>,
}

impl Collaborators {
    /// Production wiring from configuration.
    pub fn from_config(config: &RalphConfig) -> Self {
        let toml = &config.toml;
        Self {
            worktrees: Arc::new(GitWorktrees::new(
                &toml.worktree.root,
                &toml.worktree.branch_prefix,
                &toml.merge.trunk_branch,
            )),
            trunk: Arc::new(GitTrunk::new(&toml.merge.trunk_branch)),
            verifier: Arc::new(CommandVerifier::from_section(&toml.verify)),
            agent: Arc::new(ClaudeDispatcher::new(toml.agent_cmd(), toml.agent.args.clone())),
            notifier: Arc::new(CommandNotifier::from_section(&toml.notify)),
            parser: Arc::new(PrdParser::new(&toml.worktree.branch_prefix)),
        }
    }
}

/// Lines of `git status --porcelain` that denote an unmerged path.
pub(crate) fn parse_conflict_status(porcelain: &str) -> Vec<String> {
    porcelain
        .lines()
        .filter(|line| line.starts_with("UU ") || line.starts_with("AA "))
        .map(|line| line[3..].trim().to_string())
        .collect()
}
