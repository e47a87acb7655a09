//! Fixtures and collaborator doubles shared by unit tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::collab::{
    AgentDispatcher, Collaborators, CommandOutcome, ConflictPrompt, DocumentParser, MergeAttempt,
    Notifier, SyncOutcome, TrunkOps, Verifier, WorkPrompt, WorktreeManager,
};
use crate::ledger::{ConflictStrategy, Execution, ExecutionStatus, StagnationCounters, Story, now};
use crate::prd::{ParsedDocument, ParsedStory};

pub fn execution_fixture(id: &str, branch: &str) -> Execution {
    let at = now();
    Execution {
        id: id.to_string(),
        project: "demo".to_string(),
        branch: branch.to_string(),
        description: format!("work on {}", branch),
        prd_path: PathBuf::from(format!("/prds/{}.md", id)),
        project_root: PathBuf::from("/repo"),
        worktree_path: None,
        status: ExecutionStatus::Pending,
        agent_task_id: None,
        on_conflict: ConflictStrategy::Agent,
        auto_merge: true,
        notify_on_complete: true,
        dependencies: Vec::new(),
        stagnation: StagnationCounters::default(),
        created_at: at,
        updated_at: at,
    }
}

pub fn story_fixture(execution_id: &str, story_id: &str, priority: i64) -> Story {
    Story {
        execution_id: execution_id.to_string(),
        story_id: story_id.to_string(),
        title: format!("Story {}", story_id),
        description: String::new(),
        acceptance_criteria: vec!["it works".to_string()],
        priority,
        passes: false,
        notes: String::new(),
    }
}

pub fn document_fixture(branch: &str, story_ids: &[&str], dependencies: &[&str]) -> ParsedDocument {
    ParsedDocument {
        title: format!("PRD {}", branch),
        description: format!("Deliver {}", branch),
        branch_name: branch.to_string(),
        stories: story_ids
            .iter()
            .enumerate()
            .map(|(i, id)| ParsedStory {
                id: id.to_string(),
                title: format!("Story {}", id),
                description: String::new(),
                acceptance_criteria: vec!["it works".to_string()],
                priority: i as i64 + 1,
            })
            .collect(),
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
    }
}

#[derive(Default)]
pub struct MockWorktrees {
    pub created: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<PathBuf>>,
    pub preheated: Mutex<Vec<PathBuf>>,
    pub fail_remove: Mutex<bool>,
    pub sync: Mutex<Option<SyncOutcome>>,
    pub remaining_conflicts: Mutex<Vec<String>>,
}

#[async_trait]
impl WorktreeManager for MockWorktrees {
    async fn create(&self, root: &Path, branch: &str) -> Result<PathBuf> {
        self.created.lock().unwrap().push(branch.to_string());
        Ok(root
            .join(".tmp/worktrees")
            .join(format!("ralph-{}", branch.replace('/', "-"))))
    }

    async fn remove(&self, _root: &Path, path: &Path) -> Result<()> {
        if *self.fail_remove.lock().unwrap() {
            return Err(anyhow!("worktree is locked"));
        }
        self.removed.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    async fn list_conflict_files(&self, _dir: &Path) -> Result<Vec<String>> {
        Ok(self.remaining_conflicts.lock().unwrap().clone())
    }

    async fn sync_trunk_into(&self, _path: &Path, _branch: &str) -> Result<SyncOutcome> {
        Ok(self
            .sync
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(SyncOutcome::Clean))
    }

    async fn preheat(&self, path: &Path) -> Result<()> {
        self.preheated.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

pub struct MockTrunk {
    /// Whether an `origin` remote exists.
    pub origin: Mutex<bool>,
    pub fail_push: Mutex<bool>,
    pub pulls: Mutex<usize>,
    pub pushes: Mutex<usize>,
    pub already_merged: Mutex<bool>,
    pub attempt: Mutex<MergeAttempt>,
    pub merges: Mutex<Vec<(String, Option<String>, String)>>,
    pub commits: Mutex<Vec<String>>,
    pub aborts: Mutex<usize>,
    pub staged: Mutex<Vec<PathBuf>>,
    pub amended: Mutex<Vec<PathBuf>>,
}

impl Default for MockTrunk {
    fn default() -> Self {
        Self {
            origin: Mutex::new(false),
            fail_push: Mutex::new(false),
            pulls: Mutex::new(0),
            pushes: Mutex::new(0),
            already_merged: Mutex::new(false),
            attempt: Mutex::new(MergeAttempt::Merged {
                commit: "abc1234def".to_string(),
            }),
            merges: Mutex::new(Vec::new()),
            commits: Mutex::new(Vec::new()),
            aborts: Mutex::new(0),
            staged: Mutex::new(Vec::new()),
            amended: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TrunkOps for MockTrunk {
    async fn pull(&self, _root: &Path) -> Result<bool> {
        *self.pulls.lock().unwrap() += 1;
        Ok(*self.origin.lock().unwrap())
    }

    async fn push(&self, _root: &Path) -> Result<bool> {
        if *self.fail_push.lock().unwrap() {
            return Err(anyhow!("remote rejected"));
        }
        let origin = *self.origin.lock().unwrap();
        if origin {
            *self.pushes.lock().unwrap() += 1;
        }
        Ok(origin)
    }

    async fn is_merged(&self, _root: &Path, _branch: &str) -> Result<bool> {
        Ok(*self.already_merged.lock().unwrap())
    }

    async fn merge_no_ff(
        &self,
        _root: &Path,
        branch: &str,
        strategy_option: Option<&str>,
        message: &str,
    ) -> Result<MergeAttempt> {
        self.merges.lock().unwrap().push((
            branch.to_string(),
            strategy_option.map(str::to_string),
            message.to_string(),
        ));
        Ok(self.attempt.lock().unwrap().clone())
    }

    async fn commit_merge(&self, _root: &Path, message: &str) -> Result<String> {
        self.commits.lock().unwrap().push(message.to_string());
        Ok("merged0commit".to_string())
    }

    async fn abort_merge(&self, _root: &Path) -> Result<()> {
        *self.aborts.lock().unwrap() += 1;
        Ok(())
    }

    async fn head_commit(&self, _root: &Path) -> Result<String> {
        Ok("head0commit".to_string())
    }

    async fn stage(&self, _dir: &Path, paths: &[PathBuf]) -> Result<()> {
        self.staged.lock().unwrap().extend(paths.iter().cloned());
        Ok(())
    }

    async fn amend_with(&self, _root: &Path, paths: &[PathBuf]) -> Result<()> {
        self.amended.lock().unwrap().extend(paths.iter().cloned());
        Ok(())
    }
}

pub struct MockVerifier {
    pub type_check_ok: Mutex<bool>,
    pub build_ok: Mutex<bool>,
    pub runs: Mutex<Vec<&'static str>>,
}

impl Default for MockVerifier {
    fn default() -> Self {
        Self {
            type_check_ok: Mutex::new(true),
            build_ok: Mutex::new(true),
            runs: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Verifier for MockVerifier {
    async fn type_check(&self, _path: &Path) -> CommandOutcome {
        self.runs.lock().unwrap().push("typeCheck");
        if *self.type_check_ok.lock().unwrap() {
            CommandOutcome::passed("types ok")
        } else {
            CommandOutcome::failed("type error")
        }
    }

    async fn build(&self, _path: &Path) -> CommandOutcome {
        self.runs.lock().unwrap().push("build");
        if *self.build_ok.lock().unwrap() {
            CommandOutcome::passed("built")
        } else {
            CommandOutcome::failed("build error")
        }
    }
}

pub struct MockAgent {
    pub succeed: Mutex<bool>,
    pub prompts: Mutex<Vec<String>>,
}

impl Default for MockAgent {
    fn default() -> Self {
        Self {
            succeed: Mutex::new(true),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AgentDispatcher for MockAgent {
    fn work_prompt(&self, request: &WorkPrompt<'_>) -> String {
        format!("work on {}", request.branch)
    }

    fn conflict_prompt(&self, request: &ConflictPrompt<'_>) -> String {
        format!("resolve {}", request.conflict_files.join(","))
    }

    async fn invoke(&self, _root: &Path, prompt: &str) -> CommandOutcome {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if *self.succeed.lock().unwrap() {
            CommandOutcome::passed("resolved")
        } else {
            CommandOutcome::failed("agent gave up")
        }
    }
}

#[derive(Default)]
pub struct MockNotifier {
    pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, title: &str, message: &str) {
        self.sent
            .lock()
            .unwrap()
            .push((title.to_string(), message.to_string()));
    }
}

#[derive(Default)]
pub struct MockParser {
    pub documents: Mutex<HashMap<PathBuf, ParsedDocument>>,
}

impl MockParser {
    pub fn insert(&self, path: impl Into<PathBuf>, document: ParsedDocument) {
        self.documents.lock().unwrap().insert(path.into(), document);
    }
}

impl DocumentParser for MockParser {
    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        self.documents
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no such document: {}", path.display()))
    }
}

/// One of each double, kept typed so tests can inspect them.
#[derive(Default, Clone)]
pub struct Mocks {
    pub worktrees: Arc<MockWorktrees>,
    pub trunk: Arc<MockTrunk>,
    pub verifier: Arc<MockVerifier>,
    pub agent: Arc<MockAgent>,
    pub notifier: Arc<MockNotifier>,
    pub parser: Arc<MockParser>,
}

impl Mocks {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            worktrees: self.worktrees.clone(),
            trunk: self.trunk.clone(),
            verifier: self.verifier.clone(),
            agent: self.agent.clone(),
            notifier: self.notifier.clone(),
            parser: self.parser.clone(),
        }
    }
}
