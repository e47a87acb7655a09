//! Execution lifecycle controller.
//!
//! Applies external events (start, story results, stop, retry, reset) to the
//! ledger. Every state change happens inside one ledger transaction that
//! re-reads the execution first; slow collaborator work (worktrees, prompts,
//! notifications) runs outside the gate.

pub mod types;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collab::{Collaborators, WorkPrompt};
use crate::dependency::{check_dependencies, ready_dependents, topological_order};
use crate::errors::{LedgerError, LifecycleError};
use crate::ledger::{
    ConflictStrategy, Execution, ExecutionPatch, ExecutionStatus, Ledger, LedgerState,
    StagnationCounters, Story, StoryPatch, now, story_key,
};
use crate::merge::MergeQueue;
use crate::prd::ParsedDocument;
use crate::stagnation::{StagnationVerdict, assess_risk, check_stagnation, record_loop_result};

pub use types::*;

const DEFAULT_PROJECT: &str = "project";

/// Options shared by start and batch-start when creating an execution.
struct NewExecution<'a> {
    project_root: &'a Path,
    worktree: bool,
    on_conflict: Option<ConflictStrategy>,
    auto_merge: bool,
    notify_on_complete: bool,
}

/// What a story-result transaction decided.
struct Applied {
    execution: Execution,
    stories: Vec<Story>,
    verdict: StagnationVerdict,
    all_complete: bool,
    queue_position: Option<i64>,
}

pub struct Lifecycle {
    ledger: Ledger,
    collab: Collaborators,
    queue: Arc<MergeQueue>,
    default_strategy: ConflictStrategy,
}

impl Lifecycle {
    pub fn new(
        ledger: Ledger,
        collab: Collaborators,
        queue: Arc<MergeQueue>,
        default_strategy: ConflictStrategy,
    ) -> Self {
        Self {
            ledger,
            collab,
            queue,
            default_strategy,
        }
    }

    pub fn queue(&self) -> &Arc<MergeQueue> {
        &self.queue
    }

    // ── Start ─────────────────────────────────────────────────────────

    /// Register one requirements document as a new `pending` execution.
    pub async fn start(&self, request: StartRequest) -> Result<StartResult, LifecycleError> {
        let prd_path = request.project_root.join(&request.prd_path);
        let (execution, stories) = self
            .create(
                &prd_path,
                NewExecution {
                    project_root: &request.project_root,
                    worktree: request.worktree,
                    on_conflict: request.on_conflict,
                    auto_merge: request.auto_merge,
                    notify_on_complete: request.notify_on_complete,
                },
            )
            .await?;
        info!(branch = %execution.branch, id = %execution.id, stories = stories.len(), "execution started");

        let agent_prompt = request
            .auto_start
            .then(|| self.work_prompt(&execution, &stories, request.context_path.as_deref()));
        Ok(StartResult {
            execution_id: execution.id.clone(),
            branch: execution.branch.clone(),
            status: execution.status,
            worktree_path: execution.worktree_path.clone(),
            agent_prompt,
            stories: stories.iter().map(StorySummary::from).collect(),
        })
    }

    /// Start several documents at once, activating those whose
    /// prerequisites are already satisfied.
    pub async fn batch_start(
        &self,
        request: BatchStartRequest,
    ) -> Result<BatchStartResult, LifecycleError> {
        let mut skipped = Vec::new();
        let mut created: Vec<Execution> = Vec::new();

        for prd in &request.prd_paths {
            let prd_path = request.project_root.join(prd);
            let new = NewExecution {
                project_root: &request.project_root,
                worktree: request.worktree,
                on_conflict: request.on_conflict,
                auto_merge: request.auto_merge,
                notify_on_complete: request.notify_on_complete,
            };
            match self.create(&prd_path, new).await {
                Ok((execution, _)) => created.push(execution),
                Err(e) => {
                    warn!(prd = %prd_path.display(), error = %e, "skipping document");
                    skipped.push(SkippedPrd {
                        prd_path: prd_path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let ordered: Vec<Execution> = topological_order(&created).into_iter().cloned().collect();

        let mut preheat_completed = false;
        if request.preheat && request.worktree && !ordered.is_empty() {
            // Serial: concurrent installs fight over the package store lock.
            for execution in &ordered {
                if let Some(path) = &execution.worktree_path
                    && let Err(e) = self.collab.worktrees.preheat(path).await
                {
                    warn!(branch = %execution.branch, error = %e, "preheat failed");
                }
            }
            preheat_completed = true;
        }

        let all = self.ledger.list_executions().await?;
        let mut ready_to_start = Vec::new();
        let mut waiting_for_dependencies = Vec::new();
        for execution in &ordered {
            let deps = check_dependencies(execution, &all);
            if !deps.satisfied {
                debug!(branch = %execution.branch, pending = ?deps.pending, "waiting for dependencies");
                waiting_for_dependencies.push(WaitingExecution {
                    branch: execution.branch.clone(),
                    pending_dependencies: deps.pending,
                });
                continue;
            }
            let activated = self.activate(&execution.id).await?;
            let stories = self.ledger.list_stories(&activated.id).await?;
            ready_to_start.push(ReadyExecution {
                branch: activated.branch.clone(),
                agent_prompt: self.work_prompt(&activated, &stories, request.context_path.as_deref()),
                dependencies: activated.dependencies.clone(),
            });
        }

        let dependency_graph: BTreeMap<String, Vec<String>> = ordered
            .iter()
            .map(|e| (e.branch.clone(), e.dependencies.clone()))
            .collect();

        info!(
            total = request.prd_paths.len(),
            created = created.len(),
            ready = ready_to_start.len(),
            "batch started"
        );
        Ok(BatchStartResult {
            total: request.prd_paths.len(),
            created: created.len(),
            skipped,
            ready_to_start,
            waiting_for_dependencies,
            dependency_graph,
            preheat_completed,
        })
    }

    fn parse(&self, path: &Path) -> Result<ParsedDocument, LifecycleError> {
        self.collab
            .parser
            .parse(path)
            .map_err(|source| LifecycleError::Document {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn ensure_new_branch(&self, branch: &str) -> Result<(), LifecycleError> {
        if self.ledger.find_execution_by_branch(branch).await?.is_some() {
            return Err(LedgerError::DuplicateBranch {
                branch: branch.to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn create_worktree(&self, root: &Path, branch: &str) -> Result<PathBuf, LifecycleError> {
        self.collab
            .worktrees
            .create(root, branch)
            .await
            .map_err(LifecycleError::Collaborator)
    }

    /// Parse, reject a known branch, create the worktree, then insert the
    /// execution with its stories in one transaction.
    async fn create(
        &self,
        prd_path: &Path,
        new: NewExecution<'_>,
    ) -> Result<(Execution, Vec<Story>), LifecycleError> {
        let document = self.parse(prd_path)?;
        self.ensure_new_branch(&document.branch_name).await?;
        let worktree_path = if new.worktree {
            Some(self.create_worktree(new.project_root, &document.branch_name).await?)
        } else {
            None
        };
        self.insert(&document, prd_path, &new, worktree_path).await
    }

    async fn insert(
        &self,
        document: &ParsedDocument,
        prd_path: &Path,
        new: &NewExecution<'_>,
        worktree_path: Option<PathBuf>,
    ) -> Result<(Execution, Vec<Story>), LifecycleError> {
        let at = now();
        let project = new
            .project_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| DEFAULT_PROJECT.to_string());
        let execution = Execution {
            id: Uuid::new_v4().to_string(),
            project,
            branch: document.branch_name.clone(),
            description: document.description.clone(),
            prd_path: prd_path.to_path_buf(),
            project_root: new.project_root.to_path_buf(),
            worktree_path,
            status: ExecutionStatus::Pending,
            agent_task_id: None,
            on_conflict: new.on_conflict.unwrap_or(self.default_strategy),
            auto_merge: new.auto_merge,
            notify_on_complete: new.notify_on_complete,
            dependencies: document.dependencies.clone(),
            stagnation: StagnationCounters::default(),
            created_at: at,
            updated_at: at,
        };
        let stories: Vec<Story> = document
            .stories
            .iter()
            .map(|s| Story {
                execution_id: execution.id.clone(),
                story_id: s.id.clone(),
                title: s.title.clone(),
                description: s.description.clone(),
                acceptance_criteria: s.acceptance_criteria.clone(),
                priority: s.priority,
                passes: false,
                notes: String::new(),
            })
            .collect();

        let record = (execution.clone(), stories.clone());
        let inserted = self
            .ledger
            .mutate(move |state| {
                state.insert_execution(execution)?;
                state.upsert_stories(stories);
                Ok::<_, LedgerError>(())
            })
            .await;
        if let Err(e) = inserted {
            // Lost a race for the branch; do not leave the worktree behind.
            if let Some(path) = &record.0.worktree_path
                && let Err(cleanup) = self.collab.worktrees.remove(new.project_root, path).await
            {
                warn!(path = %path.display(), error = %cleanup, "failed to remove orphaned worktree");
            }
            return Err(e.into());
        }
        Ok(record)
    }

    /// `pending → running`, re-checked inside the transaction.
    async fn activate(&self, execution_id: &str) -> Result<Execution, LifecycleError> {
        let id = execution_id.to_string();
        self.ledger
            .mutate(move |state| {
                let execution = state.execution_mut(&id)?;
                if execution.status == ExecutionStatus::Pending {
                    ExecutionPatch::status(ExecutionStatus::Running).apply(execution, now());
                }
                Ok::<_, LifecycleError>(execution.clone())
            })
            .await
    }

    fn work_prompt(&self, execution: &Execution, stories: &[Story], context: Option<&Path>) -> String {
        self.collab.agent.work_prompt(&WorkPrompt {
            branch: &execution.branch,
            description: &execution.description,
            working_dir: execution.working_dir(),
            stories,
            context_path: context,
            loop_count: (execution.stagnation.loop_count > 0).then_some(execution.stagnation.loop_count),
        })
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub async fn set_agent_id(
        &self,
        branch: &str,
        agent_task_id: &str,
    ) -> Result<SetAgentIdResult, LifecycleError> {
        let branch = branch.to_string();
        let agent = agent_task_id.to_string();
        let execution = self
            .ledger
            .mutate(move |state| {
                let id = by_branch(state, &branch)?.id;
                let execution = state.execution_mut(&id)?;
                let status = if execution.status == ExecutionStatus::Pending {
                    ExecutionStatus::Running
                } else {
                    execution.status
                };
                ExecutionPatch::agent_started(agent, status).apply(execution, now());
                Ok::<_, LifecycleError>(execution.clone())
            })
            .await?;
        info!(branch = %execution.branch, status = %execution.status, "agent task recorded");
        Ok(SetAgentIdResult {
            success: true,
            branch: execution.branch,
            agent_task_id: execution.agent_task_id.unwrap_or_default(),
            status: execution.status,
        })
    }

    pub async fn status(&self, filter: &StatusFilter) -> Result<StatusResult, LifecycleError> {
        let state = self.ledger.snapshot().await?;
        let mut matching: Vec<&Execution> = state
            .executions
            .iter()
            .filter(|e| filter.project.as_ref().is_none_or(|p| &e.project == p))
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .collect();
        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let mut summary = StatusCounts::default();
        let executions = matching
            .into_iter()
            .map(|execution| {
                summary.add(execution.status);
                let stories: Vec<Story> = state
                    .stories_for(&execution.id)
                    .into_iter()
                    .cloned()
                    .collect();
                let progress = Progress::of(&stories);
                ExecutionSummary {
                    branch: execution.branch.clone(),
                    description: execution.description.clone(),
                    status: execution.status,
                    progress: progress.fraction(),
                    completed_stories: progress.completed,
                    total_stories: progress.total,
                    worktree_path: execution.worktree_path.clone(),
                    agent_task_id: execution.agent_task_id.clone(),
                    last_activity: execution.updated_at,
                    created_at: execution.created_at,
                }
            })
            .collect();
        Ok(StatusResult {
            executions,
            summary,
        })
    }

    pub async fn get(&self, branch: &str) -> Result<ExecutionDetail, LifecycleError> {
        let state = self.ledger.snapshot().await?;
        let execution = by_branch(&state, branch)?;
        let stories: Vec<Story> = state
            .stories_for(&execution.id)
            .into_iter()
            .cloned()
            .collect();
        Ok(ExecutionDetail {
            progress: Progress::of(&stories),
            stagnation: StagnationReport {
                counters: execution.stagnation.clone(),
                risk: assess_risk(&execution.stagnation),
            },
            dependencies: check_dependencies(&execution, &state.executions),
            queue_entry: state.queue_entry_for(&execution.id).cloned(),
            stories,
            execution,
        })
    }

    // ── Story results ─────────────────────────────────────────────────

    /// Record one story result and run the stagnation circuit breaker.
    ///
    /// A tripped breaker fails the execution and drops the story update.
    /// When the last story passes, the execution may be queued for
    /// integration; the queue is then drained in the background.
    pub async fn record_story_result(
        &self,
        update: StoryUpdate,
    ) -> Result<StoryUpdateResult, LifecycleError> {
        let tx = update.clone();
        let applied = self
            .ledger
            .mutate(move |state| {
                let execution = by_branch(state, &tx.branch)?;
                match execution.status {
                    ExecutionStatus::Pending | ExecutionStatus::Running => {}
                    ExecutionStatus::Failed => {
                        return Err(LifecycleError::Halted {
                            branch: execution.branch,
                        });
                    }
                    other => {
                        return Err(LifecycleError::InvalidTransition {
                            branch: execution.branch,
                            from: other.to_string(),
                            action: "record a story result for",
                        });
                    }
                }
                let key = story_key(&execution.id, &tx.story_id);
                state.story_mut(&key)?;

                let failing = state
                    .stories_for(&execution.id)
                    .iter()
                    .filter(|s| !s.passes)
                    .count();
                let counters =
                    record_loop_result(&execution.stagnation, tx.files_changed, tx.error.as_deref());
                let verdict = check_stagnation(&counters, failing);
                let at = now();

                if verdict.is_stagnant {
                    let record = state.execution_mut(&execution.id)?;
                    ExecutionPatch::status(ExecutionStatus::Failed)
                        .with_stagnation(counters)
                        .apply(record, at);
                    let execution = record.clone();
                    let stories = state.stories_for(&execution.id).into_iter().cloned().collect();
                    return Ok(Applied {
                        execution,
                        stories,
                        verdict,
                        all_complete: false,
                        queue_position: None,
                    });
                }

                StoryPatch {
                    passes: Some(tx.passes),
                    notes: tx.notes.clone(),
                }
                .apply(state.story_mut(&key)?);
                let stories: Vec<Story> = state
                    .stories_for(&execution.id)
                    .into_iter()
                    .cloned()
                    .collect();
                let all_complete = stories.iter().all(|s| s.passes);
                let status = if all_complete {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Running
                };
                let record = state.execution_mut(&execution.id)?;
                ExecutionPatch::status(status)
                    .with_stagnation(counters)
                    .apply(record, at);
                let execution = record.clone();

                let queue_position = if all_complete
                    && execution.auto_merge
                    && state.queue_entry_for(&execution.id).is_none()
                {
                    Some(state.enqueue(&execution.id)?.position)
                } else {
                    None
                };
                Ok(Applied {
                    execution,
                    stories,
                    verdict,
                    all_complete,
                    queue_position,
                })
            })
            .await?;

        let execution = &applied.execution;
        let progress = Progress::of(&applied.stories);
        if applied.verdict.is_stagnant {
            warn!(
                branch = %execution.branch,
                kind = ?applied.verdict.kind,
                "stagnation detected, execution halted"
            );
        } else {
            info!(
                branch = %execution.branch,
                story = %update.story_id,
                passes = update.passes,
                progress = %progress.fraction(),
                "story result recorded"
            );
        }

        if let Some(position) = applied.queue_position {
            info!(branch = %execution.branch, position, "queued for integration");
            self.queue.spawn_drain();
        }

        let mut ready = Vec::new();
        if applied.all_complete {
            if execution.notify_on_complete {
                self.collab
                    .notifier
                    .notify(
                        "Ralph PRD Complete",
                        &format!(
                            "{} - All {} stories done!",
                            execution.branch,
                            applied.stories.len()
                        ),
                    )
                    .await;
            }
            ready = self.ready_dependents(&execution.branch).await?;
        }

        Ok(StoryUpdateResult {
            success: !applied.verdict.is_stagnant,
            branch: execution.branch.clone(),
            story_id: update.story_id,
            passes: update.passes,
            status: execution.status,
            all_complete: applied.all_complete,
            progress: progress.fraction(),
            added_to_merge_queue: applied.queue_position.is_some(),
            merge_queue_position: applied.queue_position,
            stagnation: applied.verdict,
            ready_dependents: ready,
        })
    }

    /// Pending executions unblocked by `branch` completing. Their status is
    /// left alone; the caller dispatches the prompts.
    async fn ready_dependents(&self, branch: &str) -> Result<Vec<ReadyDependent>, LifecycleError> {
        let state = self.ledger.snapshot().await?;
        let ready = ready_dependents(branch, &state.executions)
            .into_iter()
            .map(|dependent| {
                let stories: Vec<Story> = state
                    .stories_for(&dependent.id)
                    .into_iter()
                    .cloned()
                    .collect();
                ReadyDependent {
                    branch: dependent.branch.clone(),
                    agent_prompt: self.work_prompt(dependent, &stories, None),
                }
            })
            .collect::<Vec<_>>();
        if !ready.is_empty() {
            info!(branch, ready = ready.len(), "dependents ready to start");
        }
        Ok(ready)
    }

    // ── Stop / retry / reset ──────────────────────────────────────────

    pub async fn stop(&self, branch: &str, request: StopRequest) -> Result<StopResult, LifecycleError> {
        let execution = self.ledger.get_execution_by_branch(branch).await?;
        if execution.status == ExecutionStatus::Merging {
            return Err(LifecycleError::InvalidTransition {
                branch: execution.branch,
                from: execution.status.to_string(),
                action: "stop",
            });
        }

        let mut cleaned_up = false;
        if request.cleanup
            && let Some(path) = &execution.worktree_path
        {
            match self
                .collab
                .worktrees
                .remove(&execution.project_root, path)
                .await
            {
                Ok(()) => cleaned_up = true,
                Err(e) => warn!(branch, error = %e, "failed to remove worktree"),
            }
        }

        let mut actions = Vec::new();
        let mut deleted = false;
        let mut stopped = false;
        if request.delete_record {
            deleted = self.ledger.delete_execution(&execution.id).await?;
            actions.push("deleted record".to_string());
        } else {
            let id = execution.id.clone();
            let (changed, status) = self
                .ledger
                .mutate(move |state| {
                    let record = state.execution_mut(&id)?;
                    let mut patch = ExecutionPatch::default();
                    let changed = matches!(
                        record.status,
                        ExecutionStatus::Pending | ExecutionStatus::Running
                    );
                    if changed {
                        patch = patch.with_status(ExecutionStatus::Stopped);
                    }
                    if cleaned_up {
                        patch = patch.with_worktree(None);
                    }
                    patch.apply(record, now());
                    let status = record.status;
                    if changed {
                        state.merge_queue.retain(|q| q.execution_id != id);
                    }
                    Ok::<_, LifecycleError>((changed, status))
                })
                .await?;
            stopped = changed;
            actions.push(if changed {
                "stopped".to_string()
            } else {
                format!("status unchanged ({})", status)
            });
        }
        if cleaned_up {
            actions.push("removed worktree".to_string());
        }

        info!(branch, deleted, stopped, cleaned_up, "execution stop requested");
        Ok(StopResult {
            success: deleted || stopped || cleaned_up,
            branch: execution.branch.clone(),
            previous_status: execution.status,
            cleaned_up,
            deleted,
            message: format!("{}: {}", execution.branch, actions.join(", ")),
        })
    }

    /// Resume a `failed` or `stopped` execution with fresh counters. Any
    /// other status is rejected without touching the ledger.
    pub async fn retry(&self, branch: &str) -> Result<RetryResult, LifecycleError> {
        let current = self.ledger.get_execution_by_branch(branch).await?;
        if !matches!(
            current.status,
            ExecutionStatus::Failed | ExecutionStatus::Stopped
        ) {
            return Ok(RetryResult {
                success: false,
                branch: current.branch,
                message: format!(
                    "Cannot retry execution with status '{}'. Only 'failed' or 'stopped' executions can be retried.",
                    current.status
                ),
                previous_status: current.status,
                agent_prompt: None,
                progress: None,
                remaining_stories: 0,
            });
        }

        let id = current.id.clone();
        let (execution, previous, stories) = self
            .ledger
            .mutate(move |state| {
                let record = state.execution_mut(&id)?;
                let previous = record.status;
                if !matches!(previous, ExecutionStatus::Failed | ExecutionStatus::Stopped) {
                    return Err(LifecycleError::InvalidTransition {
                        branch: record.branch.clone(),
                        from: previous.to_string(),
                        action: "retry",
                    });
                }
                ExecutionPatch::reset_stagnation()
                    .with_status(ExecutionStatus::Running)
                    .apply(record, now());
                let execution = record.clone();
                let stories: Vec<Story> = state.stories_for(&id).into_iter().cloned().collect();
                Ok((execution, previous, stories))
            })
            .await?;

        let progress = Progress::of(&stories);
        let remaining = progress.total - progress.completed;
        info!(branch, remaining, "execution retried");
        Ok(RetryResult {
            success: true,
            branch: execution.branch.clone(),
            message: format!("Execution retried. {} stories remaining.", remaining),
            previous_status: previous,
            agent_prompt: Some(self.work_prompt(&execution, &stories, None)),
            progress: Some(progress),
            remaining_stories: remaining,
        })
    }

    pub async fn reset_stagnation(
        &self,
        branch: &str,
        resume: bool,
    ) -> Result<ResetStagnationResult, LifecycleError> {
        let branch_name = branch.to_string();
        let (previous, execution) = self
            .ledger
            .mutate(move |state| {
                let id = by_branch(state, &branch_name)?.id;
                let record = state.execution_mut(&id)?;
                let previous = record.status;
                let mut patch = ExecutionPatch::reset_stagnation();
                if resume && previous == ExecutionStatus::Failed {
                    patch = patch.with_status(ExecutionStatus::Running);
                }
                patch.apply(record, now());
                Ok::<_, LifecycleError>((previous, record.clone()))
            })
            .await?;

        let resumed = previous != execution.status;
        info!(branch, resumed, "stagnation counters reset");
        Ok(ResetStagnationResult {
            success: true,
            branch: execution.branch,
            message: if resumed {
                "Stagnation counters reset and execution resumed".to_string()
            } else {
                "Stagnation counters reset".to_string()
            },
            previous_status: previous,
            new_status: execution.status,
        })
    }
}

fn by_branch(state: &LedgerState, branch: &str) -> Result<Execution, LedgerError> {
    state
        .execution_by_branch(branch)
        .cloned()
        .ok_or_else(|| LedgerError::BranchNotFound {
            branch: branch.to_string(),
        })
}
