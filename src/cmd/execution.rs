//! Execution lifecycle commands: `ralph start`, `ralph update`, `ralph stop`, ...

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use ralph::ledger::ExecutionStatus;
use ralph::lifecycle::{BatchStartRequest, StartRequest, StatusFilter, StopRequest, StoryUpdate};

use super::super::StartFlags;
use super::{Runtime, print_json};

fn project_root(flags: &StartFlags) -> Result<PathBuf> {
    match &flags.project_root {
        Some(root) => Ok(root.clone()),
        None => std::env::current_dir().context("Failed to get current directory"),
    }
}

pub async fn cmd_start(
    runtime: &Runtime,
    prd: &Path,
    flags: &StartFlags,
    auto_start: bool,
) -> Result<()> {
    let mut request = StartRequest::new(prd, project_root(flags)?);
    request.worktree = !flags.no_worktree;
    request.auto_start = auto_start;
    request.auto_merge = flags.auto_merge;
    request.notify_on_complete = flags.notify;
    request.on_conflict = flags.on_conflict;
    request.context_path = flags.context.clone();

    let result = runtime.lifecycle.start(request).await?;
    print_json(&result)
}

pub async fn cmd_batch_start(
    runtime: &Runtime,
    prds: &[PathBuf],
    flags: &StartFlags,
    preheat: bool,
) -> Result<()> {
    let mut request = BatchStartRequest::new(prds.to_vec(), project_root(flags)?);
    request.worktree = !flags.no_worktree;
    request.auto_merge = flags.auto_merge;
    request.notify_on_complete = flags.notify;
    request.on_conflict = flags.on_conflict;
    request.context_path = flags.context.clone();
    request.preheat = preheat;

    let result = runtime.lifecycle.batch_start(request).await?;
    print_json(&result)
}

pub async fn cmd_status(
    runtime: &Runtime,
    project: Option<String>,
    status: Option<ExecutionStatus>,
) -> Result<()> {
    let result = runtime
        .lifecycle
        .status(&StatusFilter { project, status })
        .await?;
    print_json(&result)
}

pub async fn cmd_get(runtime: &Runtime, branch: &str) -> Result<()> {
    print_json(&runtime.lifecycle.get(branch).await?)
}

pub async fn cmd_update(runtime: &Runtime, update: StoryUpdate) -> Result<()> {
    let result = runtime.lifecycle.record_story_result(update).await?;
    print_json(&result)
}

pub async fn cmd_stop(runtime: &Runtime, branch: &str, cleanup: bool, delete: bool) -> Result<()> {
    let result = runtime
        .lifecycle
        .stop(
            branch,
            StopRequest {
                cleanup,
                delete_record: delete,
            },
        )
        .await?;
    print_json(&result)
}

pub async fn cmd_retry(runtime: &Runtime, branch: &str) -> Result<()> {
    print_json(&runtime.lifecycle.retry(branch).await?)
}

pub async fn cmd_reset_stagnation(runtime: &Runtime, branch: &str, resume: bool) -> Result<()> {
    print_json(&runtime.lifecycle.reset_stagnation(branch, resume).await?)
}

pub async fn cmd_set_agent_id(runtime: &Runtime, branch: &str, agent_task_id: &str) -> Result<()> {
    print_json(&runtime.lifecycle.set_agent_id(branch, agent_task_id).await?)
}
