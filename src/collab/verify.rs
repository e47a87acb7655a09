use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use super::{CommandOutcome, Verifier};
use crate::config::VerifySection;

/// Runs the configured shell commands with a wall-clock ceiling each.
pub struct CommandVerifier {
    type_check: String,
    type_check_timeout: Duration,
    build: String,
    build_timeout: Duration,
}

impl CommandVerifier {
    pub fn from_section(section: &VerifySection) -> Self {
        Self {
            type_check: section.type_check.clone(),
            type_check_timeout: Duration::from_secs(section.type_check_timeout_secs),
            build: section.build.clone(),
            build_timeout: Duration::from_secs(section.build_timeout_secs),
        }
    }

    async fn run(&self, label: &str, command: &str, timeout: Duration, dir: &Path) -> CommandOutcome {
        if command.trim().is_empty() {
            return CommandOutcome::passed(format!("{} skipped: no command configured", label));
        }
        info!(check = label, command, dir = %dir.display(), "running verification");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let text = if stdout.trim().is_empty() { stderr } else { stdout };
                if output.status.success() {
                    CommandOutcome::passed(text)
                } else {
                    warn!(check = label, "verification failed");
                    CommandOutcome::failed(text)
                }
            }
            Ok(Err(e)) => {
                warn!(check = label, error = %e, "verification command could not start");
                CommandOutcome::failed(format!("Failed to run {}: {}", command, e))
            }
            Err(_) => {
                warn!(check = label, timeout_secs = timeout.as_secs(), "verification timed out");
                CommandOutcome::failed(format!(
                    "{} timed out after {}s",
                    command,
                    timeout.as_secs()
                ))
            }
        }
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn type_check(&self, path: &Path) -> CommandOutcome {
        self.run("typeCheck", &self.type_check, self.type_check_timeout, path)
            .await
    }

    async fn build(&self, path: &Path) -> CommandOutcome {
        self.run("build", &self.build, self.build_timeout, path).await
    }
}
