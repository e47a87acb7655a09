use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ralph::config::RalphConfig;
use ralph::ledger::{ConflictStrategy, ExecutionStatus};
use ralph::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "ralph")]
#[command(version, about = "Execution ledger and merge queue for autonomous PRD workflows")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding config.toml and the ledger (default: ~/.ralph)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Diagnostic log format on stderr
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by `start` and `batch-start`.
#[derive(clap::Args, Clone)]
pub struct StartFlags {
    /// Project checkout the documents belong to (default: current directory)
    #[arg(long)]
    pub project_root: Option<PathBuf>,

    /// Work directly in the project checkout
    #[arg(long)]
    pub no_worktree: bool,

    /// Queue for integration automatically once every story passes
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_merge: bool,

    /// Send a desktop notification on completion
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub notify: bool,

    /// Conflict strategy: auto_theirs, auto_ours, notify, agent
    #[arg(long)]
    pub on_conflict: Option<ConflictStrategy>,

    /// File whose contents are injected into work prompts
    #[arg(long)]
    pub context: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register a PRD as a new execution
    Start {
        /// PRD path, relative to the project root
        prd: PathBuf,

        #[command(flatten)]
        flags: StartFlags,

        /// Do not return a work prompt
        #[arg(long)]
        no_prompt: bool,
    },
    /// Register several PRDs and activate those whose dependencies are met
    BatchStart {
        #[arg(required = true)]
        prds: Vec<PathBuf>,

        #[command(flatten)]
        flags: StartFlags,

        /// Skip the dependency install in each new worktree
        #[arg(long)]
        no_preheat: bool,
    },
    /// List executions, most recently active first
    Status {
        #[arg(long)]
        project: Option<String>,

        #[arg(long)]
        status: Option<ExecutionStatus>,
    },
    /// Show one execution in detail
    Get { branch: String },
    /// Record the result of one story iteration
    Update {
        branch: String,
        story_id: String,

        /// The story now passes
        #[arg(long)]
        passes: bool,

        #[arg(long)]
        notes: Option<String>,

        #[arg(long, default_value_t = 0)]
        files_changed: u32,

        #[arg(long)]
        error: Option<String>,
    },
    /// Stop an execution
    Stop {
        branch: String,

        /// Remove the worktree
        #[arg(long)]
        cleanup: bool,

        /// Delete the execution and its stories
        #[arg(long)]
        delete: bool,
    },
    /// Resume a failed or stopped execution
    Retry { branch: String },
    /// Clear the stagnation counters
    ResetStagnation {
        branch: String,

        /// Also move a failed execution back to running
        #[arg(long)]
        resume: bool,
    },
    /// Record the agent task driving an execution
    SetAgentId {
        branch: String,
        agent_task_id: String,
    },
    /// Integrate a completed execution into trunk now
    Merge {
        branch: String,

        /// Merge even when stories still fail
        #[arg(long)]
        force: bool,

        #[arg(long)]
        skip_quality_checks: bool,

        /// Override the execution's conflict strategy
        #[arg(long)]
        strategy: Option<ConflictStrategy>,
    },
    /// Inspect or drive the merge queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum QueueCommands {
    /// Show queued branches and the one merging
    List,
    /// Queue a branch for integration
    Add { branch: String },
    /// Take a branch out of the queue
    Remove { branch: String },
    /// Integrate the next queued branch
    Process,
    /// Fail merges stranded by a process that died mid-integration
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format)?;

    let config = RalphConfig::load(cli.data_dir.clone(), cli.verbose)?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    let runtime = cmd::Runtime::from_config(&config);

    let outcome = dispatch(&cli, &runtime).await;
    // An update may have started a background drain; let it finish.
    runtime.lifecycle.queue().wait_background().await;
    outcome
}

async fn dispatch(cli: &Cli, runtime: &cmd::Runtime) -> Result<()> {
    match &cli.command {
        Commands::Start {
            prd,
            flags,
            no_prompt,
        } => cmd::cmd_start(runtime, prd, flags, !no_prompt).await,
        Commands::BatchStart {
            prds,
            flags,
            no_preheat,
        } => cmd::cmd_batch_start(runtime, prds, flags, !no_preheat).await,
        Commands::Status { project, status } => {
            cmd::cmd_status(runtime, project.clone(), *status).await
        }
        Commands::Get { branch } => cmd::cmd_get(runtime, branch).await,
        Commands::Update {
            branch,
            story_id,
            passes,
            notes,
            files_changed,
            error,
        } => {
            cmd::cmd_update(
                runtime,
                ralph::lifecycle::StoryUpdate {
                    branch: branch.clone(),
                    story_id: story_id.clone(),
                    passes: *passes,
                    notes: notes.clone(),
                    files_changed: *files_changed,
                    error: error.clone(),
                },
            )
            .await
        }
        Commands::Stop {
            branch,
            cleanup,
            delete,
        } => cmd::cmd_stop(runtime, branch, *cleanup, *delete).await,
        Commands::Retry { branch } => cmd::cmd_retry(runtime, branch).await,
        Commands::ResetStagnation { branch, resume } => {
            cmd::cmd_reset_stagnation(runtime, branch, *resume).await
        }
        Commands::SetAgentId {
            branch,
            agent_task_id,
        } => cmd::cmd_set_agent_id(runtime, branch, agent_task_id).await,
        Commands::Merge {
            branch,
            force,
            skip_quality_checks,
            strategy,
        } => {
            cmd::cmd_merge(
                runtime,
                branch,
                ralph::merge::MergeOptions {
                    force: *force,
                    skip_quality_checks: *skip_quality_checks,
                    strategy: *strategy,
                },
            )
            .await
        }
        Commands::Queue { command } => cmd::cmd_queue(runtime, command.clone()).await,
    }
}
