//! Integration commands: `ralph merge` and `ralph queue`.

use anyhow::Result;

use ralph::merge::MergeOptions;

use super::super::QueueCommands;
use super::{Runtime, print_json};

pub async fn cmd_merge(runtime: &Runtime, branch: &str, options: MergeOptions) -> Result<()> {
    let report = runtime.queue().orchestrator().merge(branch, &options).await?;
    print_json(&report)
}

pub async fn cmd_queue(runtime: &Runtime, command: QueueCommands) -> Result<()> {
    let queue = runtime.queue();
    match command {
        QueueCommands::List => print_json(&queue.list().await?),
        QueueCommands::Add { branch } => print_json(&queue.add(&branch).await?),
        QueueCommands::Remove { branch } => print_json(&queue.remove(&branch).await?),
        QueueCommands::Process => print_json(&queue.process_next().await?),
        QueueCommands::Recover => print_json(&queue.recover().await?),
    }
}
