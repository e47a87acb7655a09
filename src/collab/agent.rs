use anyhow::Context;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use super::{AgentDispatcher, CommandOutcome, ConflictPrompt, WorkPrompt};

const PROGRESS_LOG: &str = "ralph-progress.md";
const KNOWLEDGE_BASE: &str = "knowledge.md";

/// Dispatches prompts to the `claude` CLI in print mode.
pub struct ClaudeDispatcher {
    command: String,
    args: Vec<String>,
}

impl ClaudeDispatcher {
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self { command, args }
    }

    async fn run(&self, root: &Path, prompt: &str) -> anyhow::Result<std::process::Output> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {} process", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("Failed to write prompt to agent stdin")?;
        }
        child
            .wait_with_output()
            .await
            .context("Failed to wait for agent process")
    }
}

fn read_optional(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .filter(|text| !text.trim().is_empty())
}

#[async_trait]
impl AgentDispatcher for ClaudeDispatcher {
    fn work_prompt(&self, request: &WorkPrompt<'_>) -> String {
        let mut pending: Vec<_> = request.stories.iter().filter(|s| !s.passes).collect();
        pending.sort_by_key(|s| s.priority);
        let Some(current) = pending.first() else {
            return "All user stories are complete. No action needed.".to_string();
        };
        let completed = request.stories.len() - pending.len();

        let mut prompt = String::new();
        let _ = writeln!(
            prompt,
            "You are an autonomous coding agent working on the \"{}\" branch.\n",
            request.branch
        );
        let _ = writeln!(prompt, "## Working Directory\n{}\n", request.working_dir.display());
        let _ = writeln!(prompt, "## PRD: {}\n", request.description);
        let _ = writeln!(prompt, "## Progress");
        let _ = writeln!(
            prompt,
            "- Completed: {}/{} stories",
            completed,
            request.stories.len()
        );
        let _ = writeln!(prompt, "- Current story: {}", current.story_id);
        if let Some(loops) = request.loop_count {
            let _ = writeln!(prompt, "- Loop iteration: {}", loops);
        }
        prompt.push('\n');

        if let Some(knowledge) = read_optional(&request.working_dir.join(KNOWLEDGE_BASE)) {
            let _ = writeln!(prompt, "## Knowledge Base\n{}\n", knowledge.trim_end());
        }
        if let Some(context) = request.context_path.and_then(read_optional) {
            let _ = writeln!(prompt, "## Project Context\n{}\n", context.trim_end());
        }
        if let Some(progress) = read_optional(&request.working_dir.join(PROGRESS_LOG)) {
            let _ = writeln!(prompt, "## Progress & Learnings\n{}\n", progress.trim_end());
        }

        let _ = writeln!(prompt, "## Pending User Stories");
        for story in &pending {
            let _ = writeln!(prompt, "\n### {}: {}", story.story_id, story.title);
            if !story.description.is_empty() {
                let _ = writeln!(prompt, "{}", story.description);
            }
            let _ = writeln!(prompt, "\n**Acceptance Criteria:**");
            for criterion in &story.acceptance_criteria {
                let _ = writeln!(prompt, "- {}", criterion);
            }
        }

        let _ = write!(
            prompt,
            "\n## Instructions\n\
             1. Work on ONE user story at a time, highest priority first.\n\
             2. Review {progress} for context if it exists and append your learnings to it.\n\
             3. Implement the story until every acceptance criterion holds.\n\
             4. Run the project's type check and build before committing; never commit broken code.\n\
             5. Commit with message: `feat: [{id}] - {title}`\n\
             6. Report the result with `ralph update --branch {branch} --story {id} --passes <true|false> \
             --files-changed <n> [--error <text>] --notes <notes>`.\n\
             \x20  `--files-changed` and `--error` drive stagnation detection; report honestly.\n\
             7. Continue with the next story until all are complete.\n\
             \n## Stagnation\n\
             - If the same error repeats, change approach.\n\
             - If no files change across updates, step back and reassess.\n\
             - Reporting `--passes false` with notes explaining a blocker is fine.\n",
            progress = PROGRESS_LOG,
            id = current.story_id,
            title = current.title,
            branch = request.branch,
        );
        prompt
    }

    fn conflict_prompt(&self, request: &ConflictPrompt<'_>) -> String {
        let architecture = read_optional(&request.project_root.join("CLAUDE.md")).unwrap_or_else(|| {
            "No CLAUDE.md found. Use your best judgment based on the code.".to_string()
        });
        let prd = request
            .prd_path
            .and_then(read_optional)
            .unwrap_or_else(|| format!("Branch: {}\nDescription: {}", request.branch, request.description));
        let files: Vec<String> = request
            .conflict_files
            .iter()
            .map(|f| format!("- {}", f))
            .collect();

        format!(
            "You are a Git merge expert. Resolve the following merge conflicts.\n\n\
             ## Project Architecture\n{architecture}\n\n\
             ## PRD Context\n{prd}\n\n\
             ## Conflict Files\n{files}\n\n\
             ## Tasks\n\
             1. Read each conflict file and understand both sides.\n\
             2. Keep valuable changes from both sides; when they truly conflict prefer the feature branch.\n\
             3. Make sure the PRD requirements still hold and the code compiles.\n\
             4. `git add` each resolved file.\n\
             5. Conclude the merge with `git commit --no-edit`.\n",
            files = files.join("\n"),
        )
    }

    async fn invoke(&self, root: &Path, prompt: &str) -> CommandOutcome {
        info!(command = %self.command, root = %root.display(), "invoking agent");
        match self.run(root, prompt).await {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let text = if stdout.trim().is_empty() {
                    String::from_utf8_lossy(&output.stderr).to_string()
                } else {
                    stdout
                };
                if output.status.success() {
                    CommandOutcome::passed(text)
                } else {
                    warn!(status = ?output.status.code(), "agent exited unsuccessfully");
                    CommandOutcome::failed(text)
                }
            }
            Err(e) => {
                warn!(error = %e, "agent invocation failed");
                CommandOutcome::failed(format!("{:#}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::story_fixture;
    use tempfile::tempdir;

    fn dispatcher() -> ClaudeDispatcher {
        ClaudeDispatcher::new("claude".into(), vec!["--print".into()])
    }

    #[test]
    fn test_work_prompt_lists_pending_stories_in_priority_order() {
        let dir = tempdir().unwrap();
        let mut done = story_fixture("e1", "US-001", 1);
        done.passes = true;
        let stories = vec![
            story_fixture("e1", "US-003", 3),
            done,
            story_fixture("e1", "US-002", 2),
        ];
        let prompt = dispatcher().work_prompt(&WorkPrompt {
            branch: "ralph/a",
            description: "Add things",
            working_dir: dir.path(),
            stories: &stories,
            context_path: None,
            loop_count: Some(4),
        });
        assert!(prompt.contains("- Completed: 1/3 stories"));
        assert!(prompt.contains("- Current story: US-002"));
        assert!(prompt.contains("- Loop iteration: 4"));
        assert!(!prompt.contains("### US-001"));
        let second = prompt.find("### US-002").unwrap();
        let third = prompt.find("### US-003").unwrap();
        assert!(second < third);
    }

    #[test]
    fn test_work_prompt_includes_progress_log_and_context() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(PROGRESS_LOG), "learned X").unwrap();
        let ctx = dir.path().join("ctx.md");
        std::fs::write(&ctx, "monorepo rules").unwrap();
        let stories = vec![story_fixture("e1", "US-001", 1)];
        let prompt = dispatcher().work_prompt(&WorkPrompt {
            branch: "ralph/a",
            description: "d",
            working_dir: dir.path(),
            stories: &stories,
            context_path: Some(&ctx),
            loop_count: None,
        });
        assert!(prompt.contains("## Progress & Learnings\nlearned X"));
        assert!(prompt.contains("## Project Context\nmonorepo rules"));
    }

    #[test]
    fn test_work_prompt_when_everything_passes() {
        let dir = tempdir().unwrap();
        let mut story = story_fixture("e1", "US-001", 1);
        story.passes = true;
        let prompt = dispatcher().work_prompt(&WorkPrompt {
            branch: "ralph/a",
            description: "d",
            working_dir: dir.path(),
            stories: &[story],
            context_path: None,
            loop_count: None,
        });
        assert_eq!(prompt, "All user stories are complete. No action needed.");
    }

    #[test]
    fn test_conflict_prompt_lists_files_and_falls_back_to_description() {
        let dir = tempdir().unwrap();
        let files = vec!["src/a.ts".to_string(), "src/b.ts".to_string()];
        let prompt = dispatcher().conflict_prompt(&ConflictPrompt {
            project_root: dir.path(),
            branch: "ralph/a",
            description: "Add things",
            conflict_files: &files,
            prd_path: None,
        });
        assert!(prompt.contains("- src/a.ts\n- src/b.ts"));
        assert!(prompt.contains("Branch: ralph/a\nDescription: Add things"));
        assert!(prompt.contains("No CLAUDE.md found"));
    }

    #[tokio::test]
    async fn test_invoke_reports_spawn_failure_as_failed_outcome() {
        let dir = tempdir().unwrap();
        let outcome = ClaudeDispatcher::new("ralph-no-such-agent".into(), vec![])
            .invoke(dir.path(), "hello")
            .await;
        assert!(!outcome.ok);
        assert!(outcome.output.contains("ralph-no-such-agent"));
    }

    #[tokio::test]
    async fn test_invoke_feeds_prompt_on_stdin() {
        let dir = tempdir().unwrap();
        let outcome = ClaudeDispatcher::new("cat".into(), vec![])
            .invoke(dir.path(), "prompt text")
            .await;
        assert!(outcome.ok);
        assert_eq!(outcome.output, "prompt text");
    }
}
