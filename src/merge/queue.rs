use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{MergeOptions, MergeOrchestrator, MergeReport};
use crate::errors::LedgerError;
use crate::ledger::{Ledger, LedgerState, QueueClaim, QueueStatus};

/// Active queue contents as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueReport {
    /// Branches of pending and merging entries, in queue order.
    pub queue: Vec<String>,
    /// Branch currently merging, if any.
    pub current: Option<String>,
    pub message: String,
}

/// Result of one process-next step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReport {
    pub processed: bool,
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
}

impl ProcessReport {
    fn skipped(branch: Option<String>, message: String) -> Self {
        Self {
            processed: false,
            branch,
            merge: None,
            error: None,
            message,
        }
    }
}

/// Serializes integrations: at most one entry is `merging` at a time and
/// entries are taken lowest position first.
pub struct MergeQueue {
    ledger: Ledger,
    orchestrator: MergeOrchestrator,
    background: Mutex<JoinSet<()>>,
}

impl MergeQueue {
    pub fn new(ledger: Ledger, orchestrator: MergeOrchestrator) -> Self {
        Self {
            ledger,
            orchestrator,
            background: Mutex::new(JoinSet::new()),
        }
    }

    pub fn orchestrator(&self) -> &MergeOrchestrator {
        &self.orchestrator
    }

    pub async fn list(&self) -> Result<QueueReport, LedgerError> {
        let state = self.ledger.snapshot().await?;
        let mut report = queue_report(&state);
        report.message = format!("{} items in merge queue", report.queue.len());
        Ok(report)
    }

    /// Enqueue an execution explicitly.
    pub async fn add(&self, branch: &str) -> Result<QueueReport, LedgerError> {
        let execution = self.ledger.get_execution_by_branch(branch).await?;
        let entry = self.ledger.enqueue(&execution.id).await?;
        info!(branch, position = entry.position, "added to merge queue");
        let mut report = queue_report(&self.ledger.snapshot().await?);
        report.message = format!(
            "Added {} to merge queue at position {}",
            branch, entry.position
        );
        Ok(report)
    }

    pub async fn remove(&self, branch: &str) -> Result<QueueReport, LedgerError> {
        let execution = self.ledger.get_execution_by_branch(branch).await?;
        let removed = self.ledger.delete_queue_entries(&execution.id).await?;
        debug!(branch, removed, "removed from merge queue");
        let mut report = queue_report(&self.ledger.snapshot().await?);
        report.message = format!("Removed {} from merge queue", branch);
        Ok(report)
    }

    /// Claim the next pending entry and integrate it.
    ///
    /// Integration failures end up in the report; only ledger errors are
    /// returned as `Err`.
    pub async fn process_next(&self) -> Result<ProcessReport, LedgerError> {
        let entry = match self.ledger.claim_next_queue_entry().await? {
            QueueClaim::Idle => {
                return Ok(ProcessReport::skipped(
                    None,
                    "No pending items in merge queue".to_string(),
                ));
            }
            QueueClaim::Busy { branch } => {
                let message = format!("Merge already in progress for {}", branch);
                return Ok(ProcessReport::skipped(Some(branch), message));
            }
            QueueClaim::Claimed(entry) => entry,
        };

        let Some(execution) = self.ledger.find_execution_by_id(&entry.execution_id).await? else {
            warn!(entry = entry.id, "queued execution no longer exists");
            self.finish(entry.id, QueueStatus::Failed).await?;
            return Ok(ProcessReport {
                processed: true,
                branch: None,
                merge: None,
                error: Some(format!("No execution found with id: {}", entry.execution_id)),
                message: "Queued execution no longer exists".to_string(),
            });
        };

        info!(branch = %execution.branch, position = entry.position, "processing merge queue entry");
        let outcome = self
            .orchestrator
            .merge(&execution.branch, &MergeOptions::default())
            .await;
        let status = match &outcome {
            Ok(report) if report.success => QueueStatus::Completed,
            _ => QueueStatus::Failed,
        };
        self.finish(entry.id, status).await?;

        Ok(match outcome {
            Ok(report) => ProcessReport {
                processed: true,
                branch: Some(execution.branch),
                message: report.message.clone(),
                merge: Some(report),
                error: None,
            },
            Err(e) => ProcessReport {
                processed: true,
                branch: Some(execution.branch),
                merge: None,
                message: format!("Merge failed: {}", e),
                error: Some(e.to_string()),
            },
        })
    }

    /// Release trunk after a process died mid-merge: stranded `merging`
    /// entries and executions become `failed` so they can be retried.
    ///
    /// Refused while this process still has a drain running.
    pub async fn recover(&self) -> Result<QueueReport, LedgerError> {
        if !self.tasks().is_empty() {
            let mut report = queue_report(&self.ledger.snapshot().await?);
            report.message = "Merge drain still running; nothing recovered".to_string();
            return Ok(report);
        }
        let recovered = self.ledger.fail_interrupted_merges().await?;
        for branch in &recovered {
            warn!(branch = %branch, "interrupted merge marked failed");
        }
        let mut report = queue_report(&self.ledger.snapshot().await?);
        report.message = if recovered.is_empty() {
            "No interrupted merges found".to_string()
        } else {
            format!(
                "Recovered {} interrupted merge(s): {}",
                recovered.len(),
                recovered.join(", ")
            )
        };
        Ok(report)
    }

    async fn finish(&self, entry_id: i64, status: QueueStatus) -> Result<(), LedgerError> {
        match self.ledger.update_queue_entry(entry_id, status).await {
            Ok(_) => Ok(()),
            // Dequeued while merging.
            Err(e) if e.is_not_found() => {
                warn!(entry = entry_id, "queue entry removed before it finished");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Process entries until the queue is idle or another drain holds it.
    pub async fn drain(&self) -> Result<Vec<ProcessReport>, LedgerError> {
        let mut reports = Vec::new();
        loop {
            let report = self.process_next().await?;
            if !report.processed {
                break;
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Drain in a background task. Failures are logged, never returned.
    pub fn spawn_drain(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        self.tasks().spawn(async move {
            match queue.drain().await {
                Ok(reports) => debug!(processed = reports.len(), "background merge drain finished"),
                Err(e) => warn!(error = %e, "background merge drain failed"),
            }
        });
    }

    /// Wait for every background drain spawned so far.
    pub async fn wait_background(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "background merge task panicked");
            }
        }
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn queue_report(state: &LedgerState) -> QueueReport {
    let branch_of = |execution_id: &str| {
        state
            .execution_by_id(execution_id)
            .map(|e| e.branch.clone())
            .unwrap_or_else(|| execution_id.to_string())
    };
    let active: Vec<_> = state
        .ordered_queue()
        .into_iter()
        .filter(|q| q.status.is_active())
        .collect();
    QueueReport {
        queue: active.iter().map(|q| branch_of(&q.execution_id)).collect(),
        current: active
            .iter()
            .find(|q| q.status == QueueStatus::Merging)
            .map(|q| branch_of(&q.execution_id)),
        message: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ExecutionPatch, ExecutionStatus};
    use std::path::PathBuf;
    use crate::merge::MergeSettings;
    use crate::testing::{Mocks, execution_fixture, story_fixture};

    async fn ready(ledger: &Ledger, id: &str, branch: &str) {
        let mut execution = execution_fixture(id, branch);
        execution.status = ExecutionStatus::Completed;
        execution.worktree_path = Some(PathBuf::from(format!("/repo/.tmp/worktrees/{}", id)));
        ledger.insert_execution(execution).await.unwrap();
        let mut story = story_fixture(id, "US-001", 1);
        story.passes = true;
        ledger.insert_stories(vec![story]).await.unwrap();
    }

    fn queue(ledger: &Ledger, mocks: &Mocks) -> Arc<MergeQueue> {
        let orchestrator =
            MergeOrchestrator::new(ledger.clone(), mocks.collaborators(), MergeSettings::default());
        Arc::new(MergeQueue::new(ledger.clone(), orchestrator))
    }

    #[tokio::test]
    async fn test_add_list_remove_messages() {
        let ledger = Ledger::in_memory();
        let mocks = Mocks::default();
        ready(&ledger, "e1", "ralph/a").await;
        ready(&ledger, "e2", "ralph/b").await;
        let queue = queue(&ledger, &mocks);

        let added = queue.add("ralph/a").await.unwrap();
        assert_eq!(added.message, "Added ralph/a to merge queue at position 1");
        let added = queue.add("ralph/b").await.unwrap();
        assert_eq!(added.message, "Added ralph/b to merge queue at position 2");
        assert_eq!(added.queue, vec!["ralph/a", "ralph/b"]);

        let err = queue.add("ralph/a").await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyQueued { .. }));

        let removed = queue.remove("ralph/a").await.unwrap();
        assert_eq!(removed.message, "Removed ralph/a from merge queue");
        assert_eq!(removed.queue, vec!["ralph/b"]);

        let listed = queue.list().await.unwrap();
        assert_eq!(listed.message, "1 items in merge queue");
        assert_eq!(listed.current, None);
    }

    #[tokio::test]
    async fn test_process_next_on_empty_queue() {
        let ledger = Ledger::in_memory();
        let queue = queue(&ledger, &Mocks::default());
        let report = queue.process_next().await.unwrap();
        assert!(!report.processed);
        assert_eq!(report.message, "No pending items in merge queue");
    }

    #[tokio::test]
    async fn test_drain_merges_in_position_order() {
        let ledger = Ledger::in_memory();
        let mocks = Mocks::default();
        ready(&ledger, "e1", "ralph/a").await;
        ready(&ledger, "e2", "ralph/b").await;
        ledger.insert_queue_entry("e2", 1, QueueStatus::Pending).await.unwrap();
        ledger.insert_queue_entry("e1", 2, QueueStatus::Pending).await.unwrap();
        let queue = queue(&ledger, &mocks);

        let reports = queue.drain().await.unwrap();
        let branches: Vec<_> = reports.iter().filter_map(|r| r.branch.clone()).collect();
        assert_eq!(branches, vec!["ralph/b", "ralph/a"]);
        assert!(reports.iter().all(|r| r.merge.as_ref().is_some_and(|m| m.success)));

        let merged: Vec<String> = mocks
            .trunk
            .merges
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.0.clone())
            .collect();
        assert_eq!(merged, vec!["ralph/b", "ralph/a"]);
        let entries = ledger.list_merge_queue().await.unwrap();
        assert!(entries.iter().all(|q| q.status == QueueStatus::Completed));
    }

    #[tokio::test]
    async fn test_busy_queue_does_not_start_second_merge() {
        let ledger = Ledger::in_memory();
        let mocks = Mocks::default();
        ready(&ledger, "e1", "ralph/a").await;
        ready(&ledger, "e2", "ralph/b").await;
        ledger.insert_queue_entry("e1", 1, QueueStatus::Merging).await.unwrap();
        ledger.insert_queue_entry("e2", 2, QueueStatus::Pending).await.unwrap();
        let queue = queue(&ledger, &mocks);

        let report = queue.process_next().await.unwrap();
        assert!(!report.processed);
        assert_eq!(report.message, "Merge already in progress for ralph/a");
        assert!(mocks.trunk.merges.lock().unwrap().is_empty());

        let listed = queue.list().await.unwrap();
        assert_eq!(listed.current.as_deref(), Some("ralph/a"));
    }

    #[tokio::test]
    async fn test_failed_merge_marks_entry_failed() {
        let ledger = Ledger::in_memory();
        let mocks = Mocks::default();
        *mocks.verifier.build_ok.lock().unwrap() = false;
        ready(&ledger, "e1", "ralph/a").await;
        ledger.enqueue("e1").await.unwrap();
        let queue = queue(&ledger, &mocks);

        let report = queue.process_next().await.unwrap();
        assert!(report.processed);
        assert!(!report.merge.unwrap().success);
        let entry = ledger.find_queue_entry_by_execution("e1").await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);
        let execution = ledger.get_execution_by_branch("ralph/a").await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_spawned_drain_is_awaited() {
        let ledger = Ledger::in_memory();
        let mocks = Mocks::default();
        ready(&ledger, "e1", "ralph/a").await;
        ledger.enqueue("e1").await.unwrap();
        let queue = queue(&ledger, &mocks);

        queue.spawn_drain();
        queue.wait_background().await;

        let entry = ledger.find_queue_entry_by_execution("e1").await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Completed);
    }

    #[tokio::test]
    async fn test_direct_merge_in_flight_keeps_entry_pending() {
        let ledger = Ledger::in_memory();
        let mocks = Mocks::default();
        ready(&ledger, "e1", "ralph/a").await;
        ready(&ledger, "e2", "ralph/b").await;
        ledger
            .update_execution("e1", ExecutionPatch::status(ExecutionStatus::Merging))
            .await
            .unwrap();
        ledger.enqueue("e2").await.unwrap();
        let queue = queue(&ledger, &mocks);

        let report = queue.process_next().await.unwrap();
        assert!(!report.processed);
        assert_eq!(report.message, "Merge already in progress for ralph/a");
        assert!(mocks.trunk.merges.lock().unwrap().is_empty());
        let entry = ledger.find_queue_entry_by_execution("e2").await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn test_recover_unblocks_stranded_queue() {
        let ledger = Ledger::in_memory();
        let mocks = Mocks::default();
        ready(&ledger, "e1", "ralph/a").await;
        ready(&ledger, "e2", "ralph/b").await;
        ledger.insert_queue_entry("e1", 1, QueueStatus::Merging).await.unwrap();
        ledger.insert_queue_entry("e2", 2, QueueStatus::Pending).await.unwrap();
        ledger
            .update_execution("e1", ExecutionPatch::status(ExecutionStatus::Merging))
            .await
            .unwrap();
        let queue = queue(&ledger, &mocks);
        assert!(!queue.process_next().await.unwrap().processed);

        let recovered = queue.recover().await.unwrap();
        assert_eq!(recovered.message, "Recovered 1 interrupted merge(s): ralph/a");
        assert_eq!(recovered.current, None);
        assert_eq!(recovered.queue, vec!["ralph/b"]);
        let stranded = ledger.get_execution_by_branch("ralph/a").await.unwrap();
        assert_eq!(stranded.status, ExecutionStatus::Failed);

        let report = queue.process_next().await.unwrap();
        assert!(report.processed);
        assert_eq!(report.branch.as_deref(), Some("ralph/b"));
        assert!(report.merge.unwrap().success);

        let again = queue.recover().await.unwrap();
        assert_eq!(again.message, "No interrupted merges found");
    }
}
