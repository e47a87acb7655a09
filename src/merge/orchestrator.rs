use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{MergeSettings, helpers};
use crate::collab::{Collaborators, ConflictPrompt, MergeAttempt, SyncOutcome};
use crate::errors::{LedgerError, MergeError};
use crate::ledger::{
    ConflictStrategy, Execution, ExecutionPatch, ExecutionStatus, Ledger, Story,
    is_valid_transition, now,
};

/// Caller knobs for one integration attempt.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Merge even when some stories still fail.
    pub force: bool,
    pub skip_quality_checks: bool,
    /// Overrides the execution's own strategy.
    pub strategy: Option<ConflictStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    Auto,
    Agent,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityChecks {
    pub type_check: bool,
    pub build: bool,
}

/// Why an attempt ended without integrating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeFailure {
    VerificationFailed { checks: Vec<String> },
    ConflictUnresolved { files: Vec<String> },
    AgentFailed { output: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub success: bool,
    pub branch: String,
    pub commit_hash: Option<String>,
    pub cleaned_up: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_resolution: Option<ConflictResolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_checks: Option<QualityChecks>,
    pub docs_updated: bool,
    /// Trunk was pushed to `origin` after landing.
    pub pushed: bool,
    pub merged_stories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<MergeFailure>,
    pub message: String,
}

impl MergeReport {
    fn new(branch: &str) -> Self {
        Self {
            success: false,
            branch: branch.to_string(),
            commit_hash: None,
            cleaned_up: false,
            conflict_resolution: None,
            quality_checks: None,
            docs_updated: false,
            pushed: false,
            merged_stories: Vec::new(),
            failure: None,
            message: String::new(),
        }
    }

    fn fail(&mut self, failure: MergeFailure, message: String) {
        self.success = false;
        self.failure = Some(failure);
        self.message = message;
    }
}

/// How the branch landed on trunk.
enum Landing {
    AlreadyMerged,
    Committed {
        commit: String,
        resolution: Option<ConflictResolution>,
    },
}

/// Drives one execution through sync, verification, integration and cleanup.
#[derive(Clone)]
pub struct MergeOrchestrator {
    ledger: Ledger,
    collab: Collaborators,
    settings: MergeSettings,
}

impl MergeOrchestrator {
    pub fn new(ledger: Ledger, collab: Collaborators, settings: MergeSettings) -> Self {
        Self {
            ledger,
            collab,
            settings,
        }
    }

    /// Integrate `branch` into trunk.
    ///
    /// `Ok` reports carry expected failures: verification, conflicts left
    /// for a human (during sync or under `notify`) and agent failure. Every path that does not
    /// end `completed` leaves the execution `failed`.
    pub async fn merge(&self, branch: &str, options: &MergeOptions) -> Result<MergeReport, MergeError> {
        let (execution, stories) = self.begin(branch, options.force).await?;
        info!(branch, "integration started");

        let outcome = self.run(&execution, &stories, options).await;
        let status = match &outcome {
            Ok(report) if report.success => ExecutionStatus::Completed,
            _ => ExecutionStatus::Failed,
        };
        let mut patch = ExecutionPatch::status(status);
        if matches!(&outcome, Ok(report) if report.cleaned_up) {
            patch = patch.with_worktree(None);
        }
        self.ledger.update_execution(&execution.id, patch).await?;

        match &outcome {
            Ok(report) if report.success => info!(branch, commit = ?report.commit_hash, "integration completed"),
            Ok(report) => warn!(branch, message = %report.message, "integration failed"),
            Err(e) => warn!(branch, error = %e, "integration aborted"),
        }
        outcome
    }

    /// Check preconditions and move the execution to `merging` in one step.
    ///
    /// Trunk has one writer: a claimed queue entry or another merging
    /// execution rejects the attempt.
    async fn begin(&self, branch: &str, force: bool) -> Result<(Execution, Vec<Story>), MergeError> {
        let branch = branch.to_string();
        self.ledger
            .mutate(move |state| {
                let execution = state
                    .execution_by_branch(&branch)
                    .cloned()
                    .ok_or_else(|| LedgerError::BranchNotFound {
                        branch: branch.clone(),
                    })?;
                if execution.status == ExecutionStatus::Merging {
                    return Err(MergeError::AlreadyMerging { branch });
                }
                if let Some(current) = state.merging_branch(Some(&execution.id)) {
                    return Err(MergeError::TrunkBusy { branch, current });
                }
                let stories: Vec<Story> = state
                    .stories_for(&execution.id)
                    .into_iter()
                    .cloned()
                    .collect();
                let completed = stories.iter().filter(|s| s.passes).count();
                if !force && completed < stories.len() {
                    return Err(MergeError::IncompleteStories {
                        completed,
                        total: stories.len(),
                    });
                }
                if !is_valid_transition(execution.status, ExecutionStatus::Merging) {
                    return Err(MergeError::NotMergeable {
                        branch,
                        status: execution.status.to_string(),
                    });
                }
                let record = state.execution_mut(&execution.id)?;
                ExecutionPatch::status(ExecutionStatus::Merging).apply(record, now());
                Ok((record.clone(), stories))
            })
            .await
    }

    async fn run(
        &self,
        execution: &Execution,
        stories: &[Story],
        options: &MergeOptions,
    ) -> Result<MergeReport, MergeError> {
        let mut report = MergeReport::new(&execution.branch);

        // Verification only runs inside a worktree; the shared checkout is
        // never built.
        if let Some(worktree) = &execution.worktree_path {
            let remaining = self.sync(execution, worktree).await?;
            if !remaining.is_empty() {
                let message = format!(
                    "Sync conflicts in: {}. Manual resolution required.",
                    remaining.join(", ")
                );
                self.leave_pending(execution, remaining, message, &mut report)
                    .await;
                return Ok(report);
            }

            if !options.skip_quality_checks {
                let type_check = self.collab.verifier.type_check(worktree).await;
                let build = self.collab.verifier.build(worktree).await;
                report.quality_checks = Some(QualityChecks {
                    type_check: type_check.ok,
                    build: build.ok,
                });
                let mut checks = Vec::new();
                if !type_check.ok {
                    checks.push("typeCheck".to_string());
                }
                if !build.ok {
                    checks.push("build".to_string());
                }
                if !checks.is_empty() {
                    let message = format!(
                        "Quality checks failed: {}. Fix issues before merging.",
                        checks.join(", ")
                    );
                    report.fail(MergeFailure::VerificationFailed { checks }, message);
                    return Ok(report);
                }
            }
        } else {
            debug!(branch = %execution.branch, "no worktree, skipping sync and quality checks");
        }

        let strategy = options.strategy.unwrap_or(execution.on_conflict);
        let root = execution.project_root.as_path();
        let message = helpers::commit_message(execution, stories);

        let landing = match self.integrate(execution, root, strategy, &message, &mut report).await? {
            Some(landing) => landing,
            None => return Ok(report),
        };

        report.success = true;
        report.merged_stories = stories
            .iter()
            .filter(|s| s.passes)
            .map(|s| s.story_id.clone())
            .collect();
        match landing {
            Landing::AlreadyMerged => {
                report.message = format!(
                    "Branch {} was already merged to {}",
                    execution.branch, self.settings.trunk_branch
                );
            }
            Landing::Committed { commit, resolution } => {
                report.conflict_resolution = resolution;
                let commit = self.finish_docs(execution, root, commit, &mut report).await;
                report.commit_hash = Some(commit);
                match self.collab.trunk.push(root).await {
                    Ok(pushed) => report.pushed = pushed,
                    Err(e) => warn!(branch = %execution.branch, error = %e, "failed to push trunk"),
                }
                report.message = format!(
                    "Successfully merged {} to {}",
                    execution.branch, self.settings.trunk_branch
                );
            }
        }

        if let Some(worktree) = &execution.worktree_path {
            match self.collab.worktrees.remove(root, worktree).await {
                Ok(()) => report.cleaned_up = true,
                Err(e) => warn!(branch = %execution.branch, error = %e, "failed to remove worktree"),
            }
        }
        if execution.notify_on_complete {
            self.collab
                .notifier
                .notify("Ralph Merge Complete", &report.message)
                .await;
        }
        Ok(report)
    }

    /// Reconcile trunk into the worktree before verifying it. Returns the
    /// conflicts left after auto-resolution; the sync merge is aborted when
    /// any remain.
    async fn sync(&self, execution: &Execution, worktree: &Path) -> Result<Vec<String>, MergeError> {
        let outcome = self
            .collab
            .worktrees
            .sync_trunk_into(worktree, &execution.branch)
            .await
            .map_err(MergeError::Collaborator)?;
        match outcome {
            SyncOutcome::Clean => Ok(Vec::new()),
            SyncOutcome::Failed(reason) => Err(MergeError::SyncFailed(reason)),
            SyncOutcome::Conflicts(files) => {
                let remaining = self.auto_resolve(worktree, files).await?;
                if !remaining.is_empty() {
                    self.abort(worktree).await;
                    return Ok(remaining);
                }
                let message = format!(
                    "Merge {} into {}",
                    self.settings.trunk_branch, execution.branch
                );
                self.collab
                    .trunk
                    .commit_merge(worktree, &message)
                    .await
                    .map_err(MergeError::Collaborator)?;
                debug!(branch = %execution.branch, "sync conflicts auto-resolved");
                Ok(Vec::new())
            }
        }
    }

    /// Record conflicts a human has to settle and tell them about it.
    async fn leave_pending(
        &self,
        execution: &Execution,
        files: Vec<String>,
        message: String,
        report: &mut MergeReport,
    ) {
        self.collab
            .notifier
            .notify("Ralph Merge Conflict", &format!("{}: {}", execution.branch, message))
            .await;
        report.conflict_resolution = Some(ConflictResolution::Pending);
        report.fail(MergeFailure::ConflictUnresolved { files }, message);
    }

    /// Merge into trunk. `None` means the attempt ended with a failure
    /// already written into `report`.
    async fn integrate(
        &self,
        execution: &Execution,
        root: &Path,
        strategy: ConflictStrategy,
        message: &str,
        report: &mut MergeReport,
    ) -> Result<Option<Landing>, MergeError> {
        let trunk = &self.collab.trunk;
        if let Err(e) = trunk.pull(root).await {
            warn!(branch = %execution.branch, error = %e, "failed to pull trunk, merging local state");
        }
        if trunk
            .is_merged(root, &execution.branch)
            .await
            .map_err(MergeError::Collaborator)?
        {
            return Ok(Some(Landing::AlreadyMerged));
        }

        let attempt = trunk
            .merge_no_ff(root, &execution.branch, strategy.merge_option(), message)
            .await
            .map_err(MergeError::Collaborator)?;
        let files = match attempt {
            MergeAttempt::Merged { commit } => {
                return Ok(Some(Landing::Committed {
                    commit,
                    resolution: None,
                }));
            }
            MergeAttempt::Conflicts(files) => files,
        };

        let remaining = self.auto_resolve(root, files).await?;
        if remaining.is_empty() {
            let commit = trunk
                .commit_merge(root, message)
                .await
                .map_err(MergeError::Collaborator)?;
            return Ok(Some(Landing::Committed {
                commit,
                resolution: Some(ConflictResolution::Auto),
            }));
        }

        match strategy {
            ConflictStrategy::Agent => {
                info!(branch = %execution.branch, files = remaining.len(), "delegating conflicts to agent");
                let prompt = self.collab.agent.conflict_prompt(&ConflictPrompt {
                    project_root: root,
                    branch: &execution.branch,
                    description: &execution.description,
                    conflict_files: &remaining,
                    prd_path: Some(&execution.prd_path),
                });
                let outcome = self.collab.agent.invoke(root, &prompt).await;
                report.conflict_resolution = Some(ConflictResolution::Agent);
                if outcome.ok {
                    let commit = trunk
                        .head_commit(root)
                        .await
                        .map_err(MergeError::Collaborator)?;
                    return Ok(Some(Landing::Committed {
                        commit,
                        resolution: Some(ConflictResolution::Agent),
                    }));
                }
                self.abort(root).await;
                let message = format!("Merge agent failed: {}", outcome.output.trim());
                report.fail(MergeFailure::AgentFailed { output: outcome.output }, message);
                Ok(None)
            }
            ConflictStrategy::Notify | ConflictStrategy::AutoTheirs | ConflictStrategy::AutoOurs => {
                self.abort(root).await;
                let message = format!(
                    "Merge conflicts detected in: {}. Manual resolution required.",
                    remaining.join(", ")
                );
                self.leave_pending(execution, remaining, message, report).await;
                Ok(None)
            }
        }
    }

    /// Apply the schema-aware resolution when the known file is among the
    /// conflicts. Returns the conflicts still left afterwards.
    async fn auto_resolve(&self, dir: &Path, files: Vec<String>) -> Result<Vec<String>, MergeError> {
        let known = &self.settings.known_conflict_file;
        if !files.iter().any(|f| Path::new(f) == known.as_path()) {
            return Ok(files);
        }
        let resolved = helpers::resolve_schema_file(&dir.join(known))
            .await
            .map_err(MergeError::Collaborator)?;
        if !resolved {
            return Ok(files);
        }
        self.collab
            .trunk
            .stage(dir, std::slice::from_ref(known))
            .await
            .map_err(MergeError::Collaborator)?;
        info!(file = %known.display(), "auto-resolved schema conflict");
        self.collab
            .worktrees
            .list_conflict_files(dir)
            .await
            .map_err(MergeError::Collaborator)
    }

    async fn abort(&self, root: &Path) {
        if let Err(e) = self.collab.trunk.abort_merge(root).await {
            warn!(error = %e, "failed to abort merge");
        }
    }

    /// Best-effort doc updates folded into the merge commit. Returns the
    /// commit that now holds the merge.
    async fn finish_docs(
        &self,
        execution: &Execution,
        root: &Path,
        commit: String,
        report: &mut MergeReport,
    ) -> String {
        let changed: Vec<PathBuf> =
            match helpers::update_docs(root, execution, &commit, now().date_naive()).await {
                Ok(changed) => changed,
                Err(e) => {
                    warn!(branch = %execution.branch, error = %e, "failed to update docs");
                    return commit;
                }
            };
        if changed.is_empty() {
            return commit;
        }
        if let Err(e) = self.collab.trunk.amend_with(root, &changed).await {
            warn!(branch = %execution.branch, error = %e, "failed to amend docs into merge commit");
            return commit;
        }
        report.docs_updated = true;
        match self.collab.trunk.head_commit(root).await {
            Ok(amended) => amended,
            Err(e) => {
                warn!(error = %e, "failed to read amended commit");
                commit
            }
        }
    }
}
