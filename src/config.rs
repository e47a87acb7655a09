//! Configuration for Ralph.
//!
//! Settings are read from `config.toml` in the data directory and layered
//! file → environment → CLI. Every field has a default, so a missing file
//! yields a fully usable configuration.
//!
//! ```toml
//! [merge]
//! trunk_branch = "main"
//! known_conflict_file = "apps/api/src/infra/prisma/schema.prisma"
//! default_strategy = "agent"
//!
//! [worktree]
//! root = ".tmp/worktrees"
//! branch_prefix = "ralph/"
//!
//! [verify]
//! type_check = "pnpm check-types"
//! type_check_timeout_secs = 120
//! build = "pnpm --filter api build"
//! build_timeout_secs = 180
//!
//! [agent]
//! command = "claude"
//! args = ["--dangerously-skip-permissions", "--print"]
//!
//! [notify]
//! command = "notify-send"
//! timeout_secs = 10
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ledger::ConflictStrategy;

pub const CONFIG_FILE: &str = "config.toml";
pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSection {
    #[serde(default = "default_trunk_branch")]
    pub trunk_branch: String,
    /// Path (relative to the checkout) that gets the model-aware auto-resolution.
    #[serde(default = "default_known_conflict_file")]
    pub known_conflict_file: String,
    #[serde(default)]
    pub default_strategy: ConflictStrategy,
}

fn default_trunk_branch() -> String {
    "main".to_string()
}

fn default_known_conflict_file() -> String {
    "apps/api/src/infra/prisma/schema.prisma".to_string()
}

impl Default for MergeSection {
    fn default() -> Self {
        Self {
            trunk_branch: default_trunk_branch(),
            known_conflict_file: default_known_conflict_file(),
            default_strategy: ConflictStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeSection {
    /// Directory under the project root that holds isolated copies.
    #[serde(default = "default_worktree_root")]
    pub root: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

fn default_worktree_root() -> String {
    ".tmp/worktrees".to_string()
}

fn default_branch_prefix() -> String {
    "ralph/".to_string()
}

impl Default for WorktreeSection {
    fn default() -> Self {
        Self {
            root: default_worktree_root(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifySection {
    #[serde(default = "default_type_check")]
    pub type_check: String,
    #[serde(default = "default_type_check_timeout")]
    pub type_check_timeout_secs: u64,
    #[serde(default = "default_build")]
    pub build: String,
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
}

fn default_type_check() -> String {
    "pnpm check-types".to_string()
}

fn default_type_check_timeout() -> u64 {
    120
}

fn default_build() -> String {
    "pnpm --filter api build".to_string()
}

fn default_build_timeout() -> u64 {
    180
}

impl Default for VerifySection {
    fn default() -> Self {
        Self {
            type_check: default_type_check(),
            type_check_timeout_secs: default_type_check_timeout(),
            build: default_build(),
            build_timeout_secs: default_build_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent CLI command (default: "claude")
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
}

fn default_agent_args() -> Vec<String> {
    vec![
        "--dangerously-skip-permissions".to_string(),
        "--print".to_string(),
    ]
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            args: default_agent_args(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySection {
    /// Command invoked as `<command> <title> <message>`. Unset means log only.
    #[serde(default)]
    pub command: Option<String>,
    /// The command is killed after this many seconds.
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

fn default_notify_timeout() -> u64 {
    10
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_notify_timeout(),
        }
    }
}

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RalphToml {
    #[serde(default)]
    pub merge: MergeSection,
    #[serde(default)]
    pub worktree: WorktreeSection,
    #[serde(default)]
    pub verify: VerifySection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub notify: NotifySection,
}

impl RalphToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config.toml")
    }

    /// Load `config.toml` from the data directory, or defaults if absent.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Agent command (file → `CLAUDE_CMD` → "claude").
    pub fn agent_cmd(&self) -> String {
        self.agent
            .command
            .clone()
            .or_else(|| std::env::var("CLAUDE_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Returns human-readable warnings; an empty list means the file is sane.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.merge.trunk_branch.trim().is_empty() {
            warnings.push("merge.trunk_branch is empty".to_string());
        }
        if self.verify.type_check.trim().is_empty() {
            warnings.push("verify.type_check is empty; type checks will always pass".to_string());
        }
        if self.verify.build.trim().is_empty() {
            warnings.push("verify.build is empty; builds will always pass".to_string());
        }
        if self.verify.type_check_timeout_secs == 0 {
            warnings.push("verify.type_check_timeout_secs is 0; every type check will time out".to_string());
        }
        if self.verify.build_timeout_secs == 0 {
            warnings.push("verify.build_timeout_secs is 0; every build will time out".to_string());
        }
        if !self.worktree.branch_prefix.is_empty() && !self.worktree.branch_prefix.ends_with('/') {
            warnings.push(format!(
                "worktree.branch_prefix '{}' does not end with '/'",
                self.worktree.branch_prefix
            ));
        }
        if let Some(cmd) = &self.notify.command
            && cmd.trim().is_empty()
        {
            warnings.push("notify.command is set but empty".to_string());
        }
        if self.notify.command.is_some() && self.notify.timeout_secs == 0 {
            warnings.push("notify.timeout_secs is 0; every notification will time out".to_string());
        }

        warnings
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct RalphConfig {
    pub data_dir: PathBuf,
    pub toml: RalphToml,
    pub verbose: bool,
}

impl RalphConfig {
    /// Resolve the data directory and load its `config.toml`.
    pub fn load(cli_data_dir: Option<PathBuf>, verbose: bool) -> Result<Self> {
        let data_dir = resolve_data_dir(cli_data_dir)?;
        let toml = RalphToml::load_or_default(&data_dir)?;
        Ok(Self {
            data_dir,
            toml,
            verbose,
        })
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

/// `--data-dir` > `RALPH_DATA_DIR` > `~/.ralph`.
pub fn resolve_data_dir(cli: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = cli {
        return Ok(expand_home(&dir.to_string_lossy()));
    }
    if let Ok(dir) = std::env::var("RALPH_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return Ok(expand_home(dir.trim()));
    }
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".ralph"))
}

fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(raw),
        },
        _ => PathBuf::from(raw),
    }
}
