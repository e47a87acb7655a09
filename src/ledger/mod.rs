//! Durable execution ledger.
//!
//! Holds executions, their stories, and merge-queue entries in a single JSON
//! document. All access goes through [`Ledger`], which funnels every operation
//! through one FIFO gate (`tokio::sync::Mutex`) and runs the blocking
//! load/patch/save cycle on tokio's blocking pool. Operations therefore never
//! interleave, and an operation started after another completed observes its
//! effects. Reads return owned snapshots.

pub mod models;
pub mod schema;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use models::{
    ConflictStrategy, Execution, ExecutionPatch, ExecutionStatus, MergeQueueEntry, QueueStatus,
    StagnationCounters, Story, StoryPatch, is_valid_transition, now, story_key,
};
use storage::{Access, Storage};

use crate::errors::LedgerError;

/// In-memory view of the whole ledger document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub executions: Vec<Execution>,
    pub stories: Vec<Story>,
    pub merge_queue: Vec<MergeQueueEntry>,
}

impl LedgerState {
    pub fn execution_by_branch(&self, branch: &str) -> Option<&Execution> {
        self.executions.iter().find(|e| e.branch == branch)
    }

    pub fn execution_by_id(&self, id: &str) -> Option<&Execution> {
        self.executions.iter().find(|e| e.id == id)
    }

    pub fn execution_mut(&mut self, id: &str) -> Result<&mut Execution, LedgerError> {
        self.executions
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| LedgerError::ExecutionNotFound { id: id.to_string() })
    }

    /// Stories of one execution, highest priority (lowest number) first.
    pub fn stories_for(&self, execution_id: &str) -> Vec<&Story> {
        let mut stories: Vec<&Story> = self
            .stories
            .iter()
            .filter(|s| s.execution_id == execution_id)
            .collect();
        stories.sort_by_key(|s| s.priority);
        stories
    }

    pub fn story_mut(&mut self, key: &str) -> Result<&mut Story, LedgerError> {
        self.stories
            .iter_mut()
            .find(|s| s.key() == key)
            .ok_or_else(|| LedgerError::StoryNotFound {
                key: key.to_string(),
            })
    }

    /// Queue ordered by position, then id.
    pub fn ordered_queue(&self) -> Vec<&MergeQueueEntry> {
        let mut queue: Vec<&MergeQueueEntry> = self.merge_queue.iter().collect();
        queue.sort_by_key(|q| (q.position, q.id));
        queue
    }

    pub fn queue_entry_for(&self, execution_id: &str) -> Option<&MergeQueueEntry> {
        self.merge_queue
            .iter()
            .find(|q| q.execution_id == execution_id)
    }

    pub fn insert_execution(&mut self, execution: Execution) -> Result<(), LedgerError> {
        if self.execution_by_branch(&execution.branch).is_some() {
            return Err(LedgerError::DuplicateBranch {
                branch: execution.branch,
            });
        }
        if self.execution_by_id(&execution.id).is_some() {
            return Err(LedgerError::CorruptRecord {
                field: "executions.id".to_string(),
                message: format!("duplicate execution id {}", execution.id),
            });
        }
        self.executions.push(execution);
        Ok(())
    }

    /// Insert or replace stories by composite key.
    pub fn upsert_stories(&mut self, stories: Vec<Story>) {
        for story in stories {
            let key = story.key();
            self.stories.retain(|s| s.key() != key);
            self.stories.push(story);
        }
    }

    /// Remove an execution with its stories and queue entries.
    pub fn remove_execution(&mut self, execution_id: &str) -> bool {
        let before = self.executions.len();
        self.executions.retain(|e| e.id != execution_id);
        self.stories.retain(|s| s.execution_id != execution_id);
        self.merge_queue.retain(|q| q.execution_id != execution_id);
        self.executions.len() != before
    }

    pub fn next_queue_position(&self) -> i64 {
        self.merge_queue
            .iter()
            .map(|q| q.position)
            .max()
            .unwrap_or(0)
            + 1
    }

    fn next_queue_id(&self) -> i64 {
        self.merge_queue.iter().map(|q| q.id).max().unwrap_or(0) + 1
    }

    pub fn push_queue_entry(
        &mut self,
        execution_id: &str,
        position: i64,
        status: QueueStatus,
        created_at: DateTime<Utc>,
    ) -> MergeQueueEntry {
        let entry = MergeQueueEntry {
            id: self.next_queue_id(),
            execution_id: execution_id.to_string(),
            position,
            status,
            created_at,
        };
        self.merge_queue.push(entry.clone());
        entry
    }

    /// Append a pending entry at the tail of the queue.
    ///
    /// Rejects a second active entry for the same execution; a finished
    /// (completed/failed) entry for it is replaced so each execution has at
    /// most one entry.
    pub fn enqueue(&mut self, execution_id: &str) -> Result<MergeQueueEntry, LedgerError> {
        let execution = self
            .execution_by_id(execution_id)
            .ok_or_else(|| LedgerError::ExecutionNotFound {
                id: execution_id.to_string(),
            })?;
        if let Some(existing) = self.queue_entry_for(execution_id)
            && existing.status.is_active()
        {
            return Err(LedgerError::AlreadyQueued {
                branch: execution.branch.clone(),
            });
        }
        self.merge_queue.retain(|q| q.execution_id != execution_id);
        let position = self.next_queue_position();
        Ok(self.push_queue_entry(execution_id, position, QueueStatus::Pending, now()))
    }

    /// Branch currently holding trunk: a `merging` queue entry or an
    /// execution merged directly. `except` skips one execution id.
    pub fn merging_branch(&self, except: Option<&str>) -> Option<String> {
        let skip = |execution_id: &str| except == Some(execution_id);
        if let Some(active) = self
            .merge_queue
            .iter()
            .find(|q| q.status == QueueStatus::Merging && !skip(&q.execution_id))
        {
            return Some(
                self.execution_by_id(&active.execution_id)
                    .map(|e| e.branch.clone())
                    .unwrap_or_else(|| active.execution_id.clone()),
            );
        }
        self.executions
            .iter()
            .find(|e| e.status == ExecutionStatus::Merging && !skip(&e.id))
            .map(|e| e.branch.clone())
    }

    /// Mark the lowest-positioned pending entry as merging, unless anything
    /// is already merging.
    pub fn claim_next(&mut self) -> QueueClaim {
        if let Some(branch) = self.merging_branch(None) {
            return QueueClaim::Busy { branch };
        }
        let Some(next_id) = self
            .ordered_queue()
            .into_iter()
            .find(|q| q.status == QueueStatus::Pending)
            .map(|q| q.id)
        else {
            return QueueClaim::Idle;
        };
        match self.merge_queue.iter_mut().find(|q| q.id == next_id) {
            Some(entry) => {
                entry.status = QueueStatus::Merging;
                QueueClaim::Claimed(entry.clone())
            }
            None => QueueClaim::Idle,
        }
    }

    /// Fail every `merging` queue entry and execution left behind by an
    /// interrupted process. Returns the affected branches.
    pub fn fail_interrupted_merges(&mut self) -> Vec<String> {
        let at = now();
        let mut ids: Vec<String> = Vec::new();
        for entry in &mut self.merge_queue {
            if entry.status == QueueStatus::Merging {
                entry.status = QueueStatus::Failed;
                ids.push(entry.execution_id.clone());
            }
        }
        for execution in &mut self.executions {
            if execution.status == ExecutionStatus::Merging {
                ExecutionPatch::status(ExecutionStatus::Failed).apply(execution, at);
                if !ids.contains(&execution.id) {
                    ids.push(execution.id.clone());
                }
            }
        }
        ids.into_iter()
            .map(|id| {
                self.execution_by_id(&id)
                    .map(|e| e.branch.clone())
                    .unwrap_or(id)
            })
            .collect()
    }
}

/// Outcome of trying to claim the next queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueClaim {
    Claimed(MergeQueueEntry),
    Busy { branch: String },
    Idle,
}

/// Async-safe handle to the ledger. Cheap to clone; clones share one gate.
#[derive(Clone)]
pub struct Ledger {
    gate: Arc<tokio::sync::Mutex<Storage>>,
}

impl Ledger {
    /// File-backed ledger. The file is created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_storage(Storage::File { path: path.into() })
    }

    /// Ledger kept in memory (for tests and dry runs).
    pub fn in_memory() -> Self {
        Self::with_storage(Storage::Memory { contents: None })
    }

    fn with_storage(storage: Storage) -> Self {
        Self {
            gate: Arc::new(tokio::sync::Mutex::new(storage)),
        }
    }

    async fn transact<R, E, F>(&self, access: Access, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut LedgerState) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<LedgerError> + Send + 'static,
    {
        // tokio's Mutex queues waiters in FIFO order.
        let mut storage = self.gate.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || storage.transact(access, f))
            .await
            .map_err(|e| E::from(LedgerError::TaskPanicked(e.to_string())))?
    }

    async fn read<R, F>(&self, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&LedgerState) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.transact(Access::Read, move |state| Ok(f(state))).await
    }

    /// Run a read-modify-write closure atomically. Nothing is persisted when
    /// the closure returns an error, so callers may reject a request from
    /// inside the closure with their own error type.
    pub async fn mutate<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut LedgerState) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<LedgerError> + Send + 'static,
    {
        self.transact(Access::Write, f).await
    }

    pub async fn snapshot(&self) -> Result<LedgerState, LedgerError> {
        self.read(|s| s.clone()).await
    }

    // ── Executions ────────────────────────────────────────────────────

    pub async fn list_executions(&self) -> Result<Vec<Execution>, LedgerError> {
        self.read(|s| s.executions.clone()).await
    }

    pub async fn find_execution_by_branch(
        &self,
        branch: &str,
    ) -> Result<Option<Execution>, LedgerError> {
        let branch = branch.to_string();
        self.read(move |s| s.execution_by_branch(&branch).cloned())
            .await
    }

    /// Like [`Ledger::find_execution_by_branch`] but a missing branch is an error.
    pub async fn get_execution_by_branch(&self, branch: &str) -> Result<Execution, LedgerError> {
        self.find_execution_by_branch(branch)
            .await?
            .ok_or_else(|| LedgerError::BranchNotFound {
                branch: branch.to_string(),
            })
    }

    pub async fn find_execution_by_id(&self, id: &str) -> Result<Option<Execution>, LedgerError> {
        let id = id.to_string();
        self.read(move |s| s.execution_by_id(&id).cloned()).await
    }

    pub async fn insert_execution(&self, execution: Execution) -> Result<(), LedgerError> {
        self.mutate(move |s| s.insert_execution(execution)).await
    }

    pub async fn update_execution(
        &self,
        id: &str,
        patch: ExecutionPatch,
    ) -> Result<Execution, LedgerError> {
        let id = id.to_string();
        self.mutate(move |s| {
            let execution = s.execution_mut(&id)?;
            patch.apply(execution, now());
            Ok(execution.clone())
        })
        .await
    }

    /// Delete an execution and cascade to its stories and queue entries.
    pub async fn delete_execution(&self, id: &str) -> Result<bool, LedgerError> {
        let id = id.to_string();
        self.mutate(move |s| Ok(s.remove_execution(&id))).await
    }

    // ── Stories ───────────────────────────────────────────────────────

    pub async fn list_stories(&self, execution_id: &str) -> Result<Vec<Story>, LedgerError> {
        let execution_id = execution_id.to_string();
        self.read(move |s| s.stories_for(&execution_id).into_iter().cloned().collect())
            .await
    }

    pub async fn find_story(&self, key: &str) -> Result<Option<Story>, LedgerError> {
        let key = key.to_string();
        self.read(move |s| s.stories.iter().find(|st| st.key() == key).cloned())
            .await
    }

    pub async fn insert_stories(&self, stories: Vec<Story>) -> Result<(), LedgerError> {
        self.mutate(move |s| {
            s.upsert_stories(stories);
            Ok(())
        })
        .await
    }

    pub async fn update_story(&self, key: &str, patch: StoryPatch) -> Result<Story, LedgerError> {
        let key = key.to_string();
        self.mutate(move |s| {
            let story = s.story_mut(&key)?;
            patch.apply(story);
            Ok(story.clone())
        })
        .await
    }

    // ── Merge queue ───────────────────────────────────────────────────

    pub async fn list_merge_queue(&self) -> Result<Vec<MergeQueueEntry>, LedgerError> {
        self.read(|s| s.ordered_queue().into_iter().cloned().collect())
            .await
    }

    pub async fn find_queue_entry_by_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<MergeQueueEntry>, LedgerError> {
        let execution_id = execution_id.to_string();
        self.read(move |s| s.queue_entry_for(&execution_id).cloned())
            .await
    }

    /// Insert an entry at an explicit position; the id is assigned here.
    pub async fn insert_queue_entry(
        &self,
        execution_id: &str,
        position: i64,
        status: QueueStatus,
    ) -> Result<MergeQueueEntry, LedgerError> {
        let execution_id = execution_id.to_string();
        self.mutate(move |s| Ok(s.push_queue_entry(&execution_id, position, status, now())))
            .await
    }

    pub async fn update_queue_entry(
        &self,
        id: i64,
        status: QueueStatus,
    ) -> Result<MergeQueueEntry, LedgerError> {
        self.mutate(move |s| {
            let entry = s
                .merge_queue
                .iter_mut()
                .find(|q| q.id == id)
                .ok_or(LedgerError::QueueEntryNotFound { id })?;
            entry.status = status;
            Ok(entry.clone())
        })
        .await
    }

    pub async fn delete_queue_entries(&self, execution_id: &str) -> Result<usize, LedgerError> {
        let execution_id = execution_id.to_string();
        self.mutate(move |s| {
            let before = s.merge_queue.len();
            s.merge_queue.retain(|q| q.execution_id != execution_id);
            Ok(before - s.merge_queue.len())
        })
        .await
    }

    pub async fn enqueue(&self, execution_id: &str) -> Result<MergeQueueEntry, LedgerError> {
        let execution_id = execution_id.to_string();
        self.mutate(move |s| s.enqueue(&execution_id)).await
    }

    pub async fn claim_next_queue_entry(&self) -> Result<QueueClaim, LedgerError> {
        self.mutate(|s| Ok(s.claim_next())).await
    }

    pub async fn fail_interrupted_merges(&self) -> Result<Vec<String>, LedgerError> {
        self.mutate(|s| Ok(s.fail_interrupted_merges())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{execution_fixture, story_fixture};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_insert_execution_rejects_duplicate_branch() {
        let ledger = Ledger::in_memory();
        ledger
            .insert_execution(execution_fixture("e1", "ralph/a"))
            .await
            .unwrap();
        let err = ledger
            .insert_execution(execution_fixture("e2", "ralph/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateBranch { ref branch } if branch == "ralph/a"));
        let executions = ledger.list_executions().await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].id, "e1");
    }

    #[tokio::test]
    async fn test_update_missing_identities_fail_not_found() {
        let ledger = Ledger::in_memory();
        let err = ledger
            .update_execution("nope", ExecutionPatch::status(ExecutionStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ExecutionNotFound { .. }));

        let err = ledger
            .update_story("nope:US-001", StoryPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::StoryNotFound { .. }));

        let err = ledger
            .update_queue_entry(42, QueueStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::QueueEntryNotFound { id: 42 }));
    }

    #[tokio::test]
    async fn test_update_execution_bumps_updated_at_and_keeps_identity() {
        let ledger = Ledger::in_memory();
        let original = execution_fixture("e1", "ralph/a");
        ledger.insert_execution(original.clone()).await.unwrap();
        let updated = ledger
            .update_execution("e1", ExecutionPatch::agent_started("agent-1", ExecutionStatus::Running))
            .await
            .unwrap();
        assert_eq!(updated.id, original.id);
        assert_eq!(updated.created_at, original.created_at);
        assert_eq!(updated.status, ExecutionStatus::Running);
        assert_eq!(updated.agent_task_id.as_deref(), Some("agent-1"));
        assert!(updated.updated_at >= original.updated_at);
    }

    #[tokio::test]
    async fn test_insert_stories_upserts_by_key() {
        let ledger = Ledger::in_memory();
        ledger
            .insert_execution(execution_fixture("e1", "ralph/a"))
            .await
            .unwrap();
        ledger
            .insert_stories(vec![story_fixture("e1", "US-001", 1)])
            .await
            .unwrap();
        let mut replacement = story_fixture("e1", "US-001", 1);
        replacement.title = "Replaced".into();
        ledger.insert_stories(vec![replacement]).await.unwrap();

        let stories = ledger.list_stories("e1").await.unwrap();
        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].title, "Replaced");
    }

    #[tokio::test]
    async fn test_list_stories_orders_by_priority() {
        let ledger = Ledger::in_memory();
        ledger
            .insert_stories(vec![
                story_fixture("e1", "US-003", 3),
                story_fixture("e1", "US-001", 1),
                story_fixture("e2", "US-001", 1),
                story_fixture("e1", "US-002", 2),
            ])
            .await
            .unwrap();
        let ids: Vec<String> = ledger
            .list_stories("e1")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.story_id)
            .collect();
        assert_eq!(ids, vec!["US-001", "US-002", "US-003"]);
    }

    #[tokio::test]
    async fn test_delete_execution_cascades() {
        let ledger = Ledger::in_memory();
        ledger
            .insert_execution(execution_fixture("e1", "ralph/a"))
            .await
            .unwrap();
        ledger
            .insert_execution(execution_fixture("e2", "ralph/b"))
            .await
            .unwrap();
        ledger
            .insert_stories(vec![story_fixture("e1", "US-001", 1), story_fixture("e2", "US-001", 1)])
            .await
            .unwrap();
        ledger.enqueue("e1").await.unwrap();
        ledger.enqueue("e2").await.unwrap();

        assert!(ledger.delete_execution("e1").await.unwrap());

        let state = ledger.snapshot().await.unwrap();
        assert_eq!(state.executions.len(), 1);
        assert!(state.stories.iter().all(|s| s.execution_id == "e2"));
        assert!(state.merge_queue.iter().all(|q| q.execution_id == "e2"));
        assert!(!ledger.delete_execution("e1").await.unwrap());
    }

    #[tokio::test]
    async fn test_merge_queue_lists_by_position_regardless_of_insert_order() {
        let ledger = Ledger::in_memory();
        for (id, branch) in [("e1", "ralph/a"), ("e2", "ralph/b"), ("e3", "ralph/c")] {
            ledger
                .insert_execution(execution_fixture(id, branch))
                .await
                .unwrap();
        }
        ledger.insert_queue_entry("e1", 3, QueueStatus::Pending).await.unwrap();
        ledger.insert_queue_entry("e2", 1, QueueStatus::Pending).await.unwrap();
        ledger.insert_queue_entry("e3", 2, QueueStatus::Pending).await.unwrap();

        let positions: Vec<i64> = ledger
            .list_merge_queue()
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.position)
            .collect();
        assert_eq!(positions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_enqueue_assigns_max_plus_one_and_rejects_active_duplicate() {
        let ledger = Ledger::in_memory();
        ledger
            .insert_execution(execution_fixture("e1", "ralph/a"))
            .await
            .unwrap();
        ledger
            .insert_execution(execution_fixture("e2", "ralph/b"))
            .await
            .unwrap();

        let first = ledger.enqueue("e1").await.unwrap();
        assert_eq!(first.position, 1);
        assert_eq!(first.status, QueueStatus::Pending);
        let second = ledger.enqueue("e2").await.unwrap();
        assert_eq!(second.position, 2);

        let err = ledger.enqueue("e1").await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyQueued { ref branch } if branch == "ralph/a"));

        ledger
            .update_queue_entry(first.id, QueueStatus::Failed)
            .await
            .unwrap();
        let requeued = ledger.enqueue("e1").await.unwrap();
        assert_eq!(requeued.position, 3);
        let entries = ledger.list_merge_queue().await.unwrap();
        assert_eq!(entries.iter().filter(|q| q.execution_id == "e1").count(), 1);
    }

    #[tokio::test]
    async fn test_claim_next_serializes_merging() {
        let ledger = Ledger::in_memory();
        for (id, branch) in [("e1", "ralph/a"), ("e2", "ralph/b")] {
            ledger
                .insert_execution(execution_fixture(id, branch))
                .await
                .unwrap();
            ledger.enqueue(id).await.unwrap();
        }

        let first = ledger.claim_next_queue_entry().await.unwrap();
        let QueueClaim::Claimed(entry) = first else {
            panic!("expected claim, got {:?}", first);
        };
        assert_eq!(entry.execution_id, "e1");

        let busy = ledger.claim_next_queue_entry().await.unwrap();
        assert_eq!(busy, QueueClaim::Busy { branch: "ralph/a".to_string() });

        ledger
            .update_queue_entry(entry.id, QueueStatus::Completed)
            .await
            .unwrap();
        let next = ledger.claim_next_queue_entry().await.unwrap();
        assert!(matches!(next, QueueClaim::Claimed(ref e) if e.execution_id == "e2"));
    }

    #[tokio::test]
    async fn test_direct_merge_blocks_queue_claim() {
        let ledger = Ledger::in_memory();
        let mut direct = execution_fixture("e1", "ralph/a");
        direct.status = ExecutionStatus::Merging;
        ledger.insert_execution(direct).await.unwrap();
        ledger
            .insert_execution(execution_fixture("e2", "ralph/b"))
            .await
            .unwrap();
        ledger.enqueue("e2").await.unwrap();

        let claim = ledger.claim_next_queue_entry().await.unwrap();
        assert_eq!(claim, QueueClaim::Busy { branch: "ralph/a".to_string() });
        let entry = ledger.find_queue_entry_by_execution("e2").await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);

        let state = ledger.snapshot().await.unwrap();
        assert_eq!(state.merging_branch(Some("e1")), None);
    }

    #[tokio::test]
    async fn test_fail_interrupted_merges_releases_trunk() {
        let ledger = Ledger::in_memory();
        for (id, branch) in [("e1", "ralph/a"), ("e2", "ralph/b"), ("e3", "ralph/c")] {
            ledger
                .insert_execution(execution_fixture(id, branch))
                .await
                .unwrap();
        }
        ledger.insert_queue_entry("e1", 1, QueueStatus::Merging).await.unwrap();
        ledger.insert_queue_entry("e3", 2, QueueStatus::Pending).await.unwrap();
        for id in ["e1", "e2"] {
            ledger
                .update_execution(id, ExecutionPatch::status(ExecutionStatus::Merging))
                .await
                .unwrap();
        }

        let recovered = ledger.fail_interrupted_merges().await.unwrap();
        assert_eq!(recovered, vec!["ralph/a", "ralph/b"]);

        let state = ledger.snapshot().await.unwrap();
        assert_eq!(state.merging_branch(None), None);
        assert_eq!(state.execution_by_id("e1").unwrap().status, ExecutionStatus::Failed);
        assert_eq!(state.execution_by_id("e2").unwrap().status, ExecutionStatus::Failed);
        assert_eq!(state.execution_by_id("e3").unwrap().status, ExecutionStatus::Pending);
        let entry = state.queue_entry_for("e1").unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);

        let claim = ledger.claim_next_queue_entry().await.unwrap();
        assert!(matches!(claim, QueueClaim::Claimed(ref e) if e.execution_id == "e3"));
        assert!(ledger.fail_interrupted_merges().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_mutations_are_serialized() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path().join("state.json"));
        ledger
            .insert_execution(execution_fixture("e1", "ralph/a"))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .mutate(move |s| {
                        let exec = s.execution_mut("e1")?;
                        exec.stagnation.loop_count += 1;
                        exec.dependencies.push(format!("dep-{}", i));
                        Ok::<_, LedgerError>(())
                    })
                    .await
            }));
        }
        for handle in futures::future::join_all(handles).await {
            handle.unwrap().unwrap();
        }

        let reopened = Ledger::open(dir.path().join("state.json"));
        let exec = reopened
            .get_execution_by_branch("ralph/a")
            .await
            .unwrap();
        assert_eq!(exec.stagnation.loop_count, 20);
        assert_eq!(exec.dependencies.len(), 20);
    }

    #[tokio::test]
    async fn test_file_ledger_round_trips_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let ledger = Ledger::open(&path);
        ledger
            .insert_execution(execution_fixture("e1", "ralph/a"))
            .await
            .unwrap();
        ledger
            .insert_stories(vec![story_fixture("e1", "US-001", 1)])
            .await
            .unwrap();
        ledger.enqueue("e1").await.unwrap();
        let before = ledger.snapshot().await.unwrap();

        let after = Ledger::open(&path).snapshot().await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_get_execution_by_branch_missing_is_not_found() {
        let ledger = Ledger::in_memory();
        let err = ledger.get_execution_by_branch("ralph/x").await.unwrap_err();
        assert!(matches!(err, LedgerError::BranchNotFound { .. }));
        assert!(err.is_not_found());
    }
}
