use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use super::Notifier;
use crate::config::NotifySection;

/// Runs `<command> <title> <message>` when configured, else only logs.
///
/// The command is killed once `timeout` elapses.
pub struct CommandNotifier {
    command: Option<String>,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(command: Option<String>, timeout: Duration) -> Self {
        Self {
            command: command.filter(|c| !c.trim().is_empty()),
            timeout,
        }
    }

    pub fn from_section(section: &NotifySection) -> Self {
        Self::new(
            section.command.clone(),
            Duration::from_secs(section.timeout_secs),
        )
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, title: &str, message: &str) {
        info!(title, message, "notification");
        let Some(command) = &self.command else {
            return;
        };
        let child = Command::new(command)
            .arg(title)
            .arg(message)
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) if output.status.success() => {}
            Ok(Ok(output)) => warn!(
                command = %command,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "notification command failed"
            ),
            Ok(Err(e)) => warn!(command = %command, error = %e, "notification command could not start"),
            Err(_) => warn!(
                command = %command,
                timeout_secs = self.timeout.as_secs(),
                "notification command timed out"
            ),
        }
    }
}
