//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module       | Commands handled                                                |
//! |--------------|------------------------------------------------------------------|
//! | `execution`  | `Start`, `BatchStart`, `Status`, `Get`, `Update`, `Stop`,        |
//! |              | `Retry`, `ResetStagnation`, `SetAgentId`                         |
//! | `merge`      | `Merge`, `Queue`                                                 |
//!
//! Every command prints one JSON document to stdout.

pub mod execution;
pub mod merge;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use ralph::collab::Collaborators;
use ralph::config::RalphConfig;
use ralph::ledger::Ledger;
use ralph::lifecycle::Lifecycle;
use ralph::merge::{MergeOrchestrator, MergeQueue, MergeSettings};

pub use execution::{
    cmd_batch_start, cmd_get, cmd_reset_stagnation, cmd_retry, cmd_set_agent_id, cmd_start,
    cmd_status, cmd_stop, cmd_update,
};
pub use merge::{cmd_merge, cmd_queue};

/// Controllers wired to the configured ledger and collaborators.
pub struct Runtime {
    pub lifecycle: Lifecycle,
}

impl Runtime {
    pub fn from_config(config: &RalphConfig) -> Self {
        let ledger = Ledger::open(config.state_file());
        let collab = Collaborators::from_config(config);
        let settings = MergeSettings::from_section(&config.toml.merge);
        let orchestrator = MergeOrchestrator::new(ledger.clone(), collab.clone(), settings);
        let queue = Arc::new(MergeQueue::new(ledger.clone(), orchestrator));
        let lifecycle = Lifecycle::new(
            ledger,
            collab,
            queue,
            config.toml.merge.default_strategy,
        );
        Self { lifecycle }
    }

    pub fn queue(&self) -> &Arc<MergeQueue> {
        self.lifecycle.queue()
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize command output")?;
    println!("{}", json);
    Ok(())
}
