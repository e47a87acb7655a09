use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use git2::{BranchType, Repository};
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{MergeAttempt, SyncOutcome, TrunkOps, WorktreeManager, parse_conflict_status};

async fn run_git(dir: &Path, args: &[&str]) -> Result<Output> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))
}

fn stderr_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    }
}

async fn has_origin(dir: &Path) -> Result<bool> {
    with_repo(dir, |repo| Ok(repo.find_remote("origin").is_ok())).await
}

async fn porcelain_conflicts(dir: &Path) -> Result<Vec<String>> {
    let status = run_git(dir, &["status", "--porcelain"]).await?;
    Ok(parse_conflict_status(&String::from_utf8_lossy(&status.stdout)))
}

/// Run a git2 closure on the blocking pool.
async fn with_repo<R, F>(dir: &Path, f: F) -> Result<R>
where
    F: FnOnce(&Repository) -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)
            .with_context(|| format!("Failed to open git repository at {}", dir.display()))?;
        f(&repo)
    })
    .await
    .context("git task panicked")?
}

/// Git worktrees under `<project>/<root>/ralph-<short branch>`.
pub struct GitWorktrees {
    root: PathBuf,
    branch_prefix: String,
    trunk: String,
}

impl GitWorktrees {
    pub fn new(root: &str, branch_prefix: &str, trunk: &str) -> Self {
        Self {
            root: PathBuf::from(root),
            branch_prefix: branch_prefix.to_string(),
            trunk: trunk.to_string(),
        }
    }

    /// `ralph/task1-agent` → `<project>/.tmp/worktrees/ralph-task1-agent`.
    pub fn worktree_path(&self, project_root: &Path, branch: &str) -> PathBuf {
        let short = branch
            .strip_prefix(self.branch_prefix.as_str())
            .unwrap_or(branch)
            .replace('/', "-");
        project_root.join(&self.root).join(format!("ralph-{}", short))
    }
}

#[async_trait]
impl WorktreeManager for GitWorktrees {
    async fn create(&self, root: &Path, branch: &str) -> Result<PathBuf> {
        let path = self.worktree_path(root, branch);
        if path.exists() {
            info!(path = %path.display(), "worktree already exists");
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?
            .to_string();

        let owned_branch = branch.to_string();
        let branch_exists = with_repo(root, move |repo| {
            Ok(repo.find_branch(&owned_branch, BranchType::Local).is_ok())
        })
        .await?;

        let output = if branch_exists {
            run_git(root, &["worktree", "add", &path_str, branch]).await?
        } else {
            run_git(root, &["worktree", "add", "-b", branch, &path_str, &self.trunk]).await?
        };
        if !output.status.success() {
            bail!("Git worktree creation failed: {}", stderr_of(&output));
        }
        info!(branch, path = %path.display(), "created worktree");
        Ok(path)
    }

    async fn remove(&self, root: &Path, path: &Path) -> Result<()> {
        if !path.exists() {
            debug!(path = %path.display(), "worktree already absent");
            return Ok(());
        }
        let path_str = path.to_str().context("Worktree path contains invalid UTF-8")?;
        let output = run_git(root, &["worktree", "remove", path_str, "--force"]).await?;
        if !output.status.success() {
            bail!("git worktree remove failed: {}", stderr_of(&output));
        }
        Ok(())
    }

    async fn list_conflict_files(&self, dir: &Path) -> Result<Vec<String>> {
        with_repo(dir, |repo| {
            let index = repo.index()?;
            let mut files = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
                if let Some(entry) = entry {
                    let path = String::from_utf8_lossy(&entry.path).to_string();
                    if !files.contains(&path) {
                        files.push(path);
                    }
                }
            }
            Ok(files)
        })
        .await
    }

    async fn sync_trunk_into(&self, path: &Path, branch: &str) -> Result<SyncOutcome> {
        let upstream = if has_origin(path).await? {
            let fetch = run_git(path, &["fetch", "origin", &self.trunk]).await?;
            if !fetch.status.success() {
                return Ok(SyncOutcome::Failed(format!(
                    "Failed to fetch {}: {}",
                    self.trunk,
                    stderr_of(&fetch)
                )));
            }
            format!("origin/{}", self.trunk)
        } else {
            self.trunk.clone()
        };

        debug!(branch, upstream = %upstream, "syncing trunk into worktree");
        let merge = run_git(path, &["merge", &upstream, "--no-edit"]).await?;
        if merge.status.success() {
            return Ok(SyncOutcome::Clean);
        }
        let conflicts = porcelain_conflicts(path).await?;
        if conflicts.is_empty() {
            Ok(SyncOutcome::Failed(stderr_of(&merge)))
        } else {
            Ok(SyncOutcome::Conflicts(conflicts))
        }
    }

    async fn preheat(&self, path: &Path) -> Result<()> {
        let install = InstallCommand::detect(path);
        info!(path = %path.display(), command = install.program, "preheating dependencies");
        let strict = Command::new(install.program)
            .args(install.args)
            .current_dir(path)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", install.program))?;
        if strict.status.success() {
            return Ok(());
        }
        warn!(path = %path.display(), "strict install failed, retrying without lockfile check");
        let fallback = Command::new(install.program)
            .arg("install")
            .current_dir(path)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", install.program))?;
        if !fallback.status.success() {
            bail!("{} install failed: {}", install.program, stderr_of(&fallback));
        }
        Ok(())
    }
}

/// Package-manager install command chosen from the lockfile present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallCommand {
    pub program: &'static str,
    pub args: &'static [&'static str],
}

impl InstallCommand {
    pub fn detect(dir: &Path) -> Self {
        let frozen: &'static [&'static str] = &["install", "--frozen-lockfile"];
        if dir.join("pnpm-lock.yaml").exists() {
            Self { program: "pnpm", args: frozen }
        } else if dir.join("yarn.lock").exists() {
            Self { program: "yarn", args: frozen }
        } else if dir.join("bun.lockb").exists() {
            Self { program: "bun", args: frozen }
        } else {
            Self { program: "npm", args: &["ci"] }
        }
    }
}

/// Trunk operations in the main project checkout.
pub struct GitTrunk {
    trunk: String,
}

impl GitTrunk {
    pub fn new(trunk: &str) -> Self {
        Self {
            trunk: trunk.to_string(),
        }
    }

    async fn ensure_on_trunk(&self, root: &Path) -> Result<()> {
        let current = with_repo(root, |repo| {
            Ok(repo.head().ok().and_then(|h| h.shorthand().map(str::to_string)))
        })
        .await?;
        if current.as_deref() == Some(self.trunk.as_str()) {
            return Ok(());
        }
        let checkout = run_git(root, &["checkout", &self.trunk]).await?;
        if !checkout.status.success() {
            bail!("Failed to checkout {}: {}", self.trunk, stderr_of(&checkout));
        }
        Ok(())
    }
}

#[async_trait]
impl TrunkOps for GitTrunk {
    async fn pull(&self, root: &Path) -> Result<bool> {
        if !has_origin(root).await? {
            return Ok(false);
        }
        self.ensure_on_trunk(root).await?;
        let fetch = run_git(root, &["fetch", "origin", &self.trunk]).await?;
        if !fetch.status.success() {
            bail!("Failed to fetch {}: {}", self.trunk, stderr_of(&fetch));
        }
        let pull = run_git(root, &["pull", "--no-rebase", "--no-edit", "origin", &self.trunk]).await?;
        if !pull.status.success() {
            bail!("Failed to pull {}: {}", self.trunk, stderr_of(&pull));
        }
        debug!(trunk = %self.trunk, "pulled trunk from origin");
        Ok(true)
    }

    async fn push(&self, root: &Path) -> Result<bool> {
        if !has_origin(root).await? {
            return Ok(false);
        }
        let push = run_git(root, &["push", "origin", &self.trunk]).await?;
        if !push.status.success() {
            bail!("Failed to push {}: {}", self.trunk, stderr_of(&push));
        }
        info!(trunk = %self.trunk, "pushed trunk to origin");
        Ok(true)
    }

    async fn is_merged(&self, root: &Path, branch: &str) -> Result<bool> {
        let trunk = self.trunk.clone();
        let branch = branch.to_string();
        with_repo(root, move |repo| {
            let Ok(feature) = repo.find_branch(&branch, BranchType::Local) else {
                return Ok(false);
            };
            let trunk_ref = repo
                .find_branch(&trunk, BranchType::Local)
                .with_context(|| format!("Trunk branch {} not found", trunk))?;
            let feature_oid = feature.get().peel_to_commit()?.id();
            let trunk_oid = trunk_ref.get().peel_to_commit()?.id();
            Ok(feature_oid == trunk_oid || repo.graph_descendant_of(trunk_oid, feature_oid)?)
        })
        .await
    }

    async fn merge_no_ff(
        &self,
        root: &Path,
        branch: &str,
        strategy_option: Option<&str>,
        message: &str,
    ) -> Result<MergeAttempt> {
        self.ensure_on_trunk(root).await?;
        let mut args = vec!["merge", "--no-ff"];
        if let Some(option) = strategy_option {
            args.push("-X");
            args.push(option);
        }
        args.extend([branch, "-m", message]);

        let output = run_git(root, &args).await?;
        if output.status.success() {
            let commit = self.head_commit(root).await?;
            return Ok(MergeAttempt::Merged { commit });
        }
        let conflicts = porcelain_conflicts(root).await?;
        if conflicts.is_empty() {
            bail!("Merge of {} failed: {}", branch, stderr_of(&output));
        }
        Ok(MergeAttempt::Conflicts(conflicts))
    }

    async fn commit_merge(&self, root: &Path, message: &str) -> Result<String> {
        let output = run_git(root, &["commit", "-m", message]).await?;
        if !output.status.success() {
            bail!("Failed to commit merge: {}", stderr_of(&output));
        }
        self.head_commit(root).await
    }

    async fn abort_merge(&self, root: &Path) -> Result<()> {
        let output = run_git(root, &["merge", "--abort"]).await?;
        if !output.status.success() {
            bail!("git merge --abort failed: {}", stderr_of(&output));
        }
        Ok(())
    }

    async fn head_commit(&self, root: &Path) -> Result<String> {
        with_repo(root, |repo| {
            let head = repo.head().context("Repository has no HEAD")?;
            Ok(head.peel_to_commit()?.id().to_string())
        })
        .await
    }

    async fn stage(&self, dir: &Path, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut cmd = Command::new("git");
        cmd.arg("add").arg("--").args(paths).current_dir(dir);
        let output = cmd.output().await.context("Failed to run git add")?;
        if !output.status.success() {
            bail!("git add failed: {}", stderr_of(&output));
        }
        Ok(())
    }

    async fn amend_with(&self, root: &Path, paths: &[PathBuf]) -> Result<()> {
        self.stage(root, paths).await?;
        let output = run_git(root, &["commit", "--amend", "--no-edit"]).await?;
        if !output.status.success() {
            bail!("git commit --amend failed: {}", stderr_of(&output));
        }
        Ok(())
    }
}
