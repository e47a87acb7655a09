//! Text rewrites used around an integration: the merge commit message, the
//! documentation touch-ups after a merge, and the model-aware resolution of
//! the schema file that conflicts on almost every parallel branch.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use regex::{NoExpand, Regex};
use tracing::debug;

use crate::ledger::{Execution, Story};

pub const TODO_DOC: &str = "docs/TODO.md";
pub const STATUS_DOC: &str = "docs/PROJECT-STATUS.md";

const RECENT_MERGES: &str = "## Recent Merges\n";

static OPEN_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^<<<<<<< .*\n").unwrap());
static MID_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^=======\n").unwrap());
static CLOSE_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^>>>>>>> .*\n").unwrap());
static ANY_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(<<<<<<< |=======$|>>>>>>> )").unwrap());
static MODEL_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?ms)^model (\w+) \{.*?^\}\n?").unwrap());
static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// `merge: <branch> - <description>` followed by the completed stories.
pub fn commit_message(execution: &Execution, stories: &[Story]) -> String {
    let completed: Vec<String> = stories
        .iter()
        .filter(|s| s.passes)
        .map(|s| format!("- {}: {}", s.story_id, s.title))
        .collect();
    let list = if completed.is_empty() {
        "- No stories tracked".to_string()
    } else {
        completed.join("\n")
    };
    format!(
        "merge: {} - {}\n\nCompleted User Stories:\n{}",
        execution.branch, execution.description, list
    )
}

/// Tick the first open checklist line that mentions the work. `None` when
/// nothing matched.
pub fn tick_todo(content: &str, description: &str, branch: &str) -> Option<String> {
    let needle: String = description.trim().chars().take(30).collect();
    let branch = regex::escape(branch);
    // An empty needle would match every open line.
    let target = if needle.is_empty() {
        format!(".*{}.*", branch)
    } else {
        format!(".*{}.*|.*{}.*", regex::escape(&needle), branch)
    };
    let pattern = format!(r"(?m)^(\s*)- \[ \] ({})$", target);
    let re = Regex::new(&pattern).ok()?;
    let caps = re.captures(content)?;
    let whole = caps.get(0)?;
    let ticked = format!("{}- [x] {}", &caps[1], &caps[2]);
    let mut out = String::with_capacity(content.len());
    out.push_str(&content[..whole.start()]);
    out.push_str(&ticked);
    out.push_str(&content[whole.end()..]);
    Some(out)
}

pub fn status_entry(date: NaiveDate, branch: &str, description: &str, commit: &str) -> String {
    let short: String = commit.chars().take(7).collect();
    format!(
        "- {}: {} - {} ({})",
        date.format("%Y-%m-%d"),
        branch,
        description,
        short
    )
}

/// Put `entry` at the top of the `## Recent Merges` section, creating the
/// section at the end of the document when absent.
pub fn record_recent_merge(content: &str, entry: &str) -> String {
    match content.find(RECENT_MERGES) {
        Some(at) => {
            let insert_at = at + RECENT_MERGES.len();
            format!("{}{}\n{}", &content[..insert_at], entry, &content[insert_at..])
        }
        None => {
            let separator = if content.is_empty() || content.ends_with('\n') {
                ""
            } else {
                "\n"
            };
            format!("{}{}\n{}{}\n", content, separator, RECENT_MERGES, entry)
        }
    }
}

/// Rewrite the docs after a merge. Returns the repo-relative paths that
/// changed so the caller can fold them into the merge commit.
pub async fn update_docs(root: &Path, execution: &Execution, commit: &str, date: NaiveDate) -> Result<Vec<PathBuf>> {
    let mut changed = Vec::new();

    let todo_path = root.join(TODO_DOC);
    if let Ok(content) = tokio::fs::read_to_string(&todo_path).await
        && let Some(updated) = tick_todo(&content, &execution.description, &execution.branch)
    {
        tokio::fs::write(&todo_path, updated)
            .await
            .with_context(|| format!("Failed to write {}", todo_path.display()))?;
        changed.push(PathBuf::from(TODO_DOC));
    }

    let status_path = root.join(STATUS_DOC);
    if let Ok(content) = tokio::fs::read_to_string(&status_path).await {
        let entry = status_entry(date, &execution.branch, &execution.description, commit);
        tokio::fs::write(&status_path, record_recent_merge(&content, &entry))
            .await
            .with_context(|| format!("Failed to write {}", status_path.display()))?;
        changed.push(PathBuf::from(STATUS_DOC));
    }

    debug!(branch = %execution.branch, changed = changed.len(), "updated docs");
    Ok(changed)
}

pub fn has_conflict_markers(content: &str) -> bool {
    ANY_MARKER.is_match(content)
}

/// Keep both sides of every hunk, then drop repeated `model X { ... }`
/// blocks so each model is defined once (first wins).
pub fn merge_schema_sides(content: &str) -> String {
    let unmarked = OPEN_MARKER.replace_all(content, "");
    let unmarked = MID_MARKER.replace_all(&unmarked, "");
    let unmarked = CLOSE_MARKER.replace_all(&unmarked, "").into_owned();

    let mut seen = HashSet::new();
    let mut deduped = String::with_capacity(unmarked.len());
    let mut last = 0;
    for caps in MODEL_BLOCK.captures_iter(&unmarked) {
        let (Some(block), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if !seen.insert(name.as_str().to_string()) {
            deduped.push_str(&unmarked[last..block.start()]);
            last = block.end();
        }
    }
    deduped.push_str(&unmarked[last..]);

    BLANK_RUN.replace_all(&deduped, NoExpand("\n\n")).into_owned()
}

/// Resolve the schema file in place. A file without markers is already
/// resolved. Returns whether the file is now free of markers.
pub async fn resolve_schema_file(path: &Path) -> Result<bool> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if !has_conflict_markers(&content) {
        return Ok(true);
    }
    let merged = merge_schema_sides(&content);
    tokio::fs::write(path, &merged)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(!has_conflict_markers(&merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{execution_fixture, story_fixture};
    use tempfile::tempdir;

    #[test]
    fn test_commit_message_lists_completed_stories() {
        let mut execution = execution_fixture("e1", "ralph/auth");
        execution.description = "Add auth".into();
        let mut done = story_fixture("e1", "US-001", 1);
        done.passes = true;
        done.title = "Login form".into();
        let open = story_fixture("e1", "US-002", 2);

        let message = commit_message(&execution, &[done, open]);
        assert_eq!(
            message,
            "merge: ralph/auth - Add auth\n\nCompleted User Stories:\n- US-001: Login form"
        );
    }

    #[test]
    fn test_commit_message_without_stories() {
        let execution = execution_fixture("e1", "ralph/auth");
        assert!(commit_message(&execution, &[]).ends_with("- No stories tracked"));
    }

    #[test]
    fn test_tick_todo_matches_description_or_branch() {
        let content = "# TODO\n- [ ] Something else\n- [ ] Add auth with sessions\n- [ ] ralph/auth leftovers\n";
        let updated = tick_todo(content, "Add auth with sessions", "ralph/zzz").unwrap();
        assert!(updated.contains("- [x] Add auth with sessions"));
        assert!(updated.contains("- [ ] ralph/auth leftovers"));

        let by_branch = tick_todo(content, "unrelated", "ralph/auth").unwrap();
        assert!(by_branch.contains("- [x] ralph/auth leftovers"));
        assert!(tick_todo(content, "nothing", "ralph/none").is_none());
    }

    #[test]
    fn test_tick_todo_blank_description_only_matches_branch() {
        let content = "- [ ] Unrelated chore\n- [ ] Ship ralph/auth\n";
        for description in ["", "   "] {
            let updated = tick_todo(content, description, "ralph/auth").unwrap();
            assert_eq!(updated, "- [ ] Unrelated chore\n- [x] Ship ralph/auth\n");
            assert!(tick_todo("- [ ] Unrelated chore\n", description, "ralph/auth").is_none());
        }
    }

    #[test]
    fn test_tick_todo_escapes_regex_characters() {
        let content = "- [ ] Fix (a+b)* parsing\n";
        let updated = tick_todo(content, "Fix (a+b)* parsing", "ralph/p").unwrap();
        assert_eq!(updated, "- [x] Fix (a+b)* parsing\n");
    }

    #[test]
    fn test_record_recent_merge_prepends_under_heading() {
        let content = "# Status\n\n## Recent Merges\n- 2026-01-01: old\n";
        let updated = record_recent_merge(content, "- 2026-02-02: new");
        assert_eq!(
            updated,
            "# Status\n\n## Recent Merges\n- 2026-02-02: new\n- 2026-01-01: old\n"
        );
    }

    #[test]
    fn test_record_recent_merge_appends_missing_section() {
        let updated = record_recent_merge("# Status", "- entry");
        assert_eq!(updated, "# Status\n## Recent Merges\n- entry\n");
    }

    #[test]
    fn test_status_entry_uses_short_hash() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 4).unwrap();
        assert_eq!(
            status_entry(date, "ralph/a", "Do a", "0123456789abcdef"),
            "- 2026-03-04: ralph/a - Do a (0123456)"
        );
    }

    #[test]
    fn test_merge_schema_sides_keeps_both_and_dedupes_models() {
        let content = "\
datasource db {
  provider = \"postgresql\"
}

<<<<<<< HEAD
model User {
  id Int @id
}
=======
model User {
  id Int @id
}

model Post {
  id Int @id
}
>>>>>>> ralph/posts
";
        let merged = merge_schema_sides(content);
        assert!(!has_conflict_markers(&merged));
        assert_eq!(merged.matches("model User {").count(), 1);
        assert_eq!(merged.matches("model Post {").count(), 1);
        assert!(!merged.contains("\n\n\n"));
    }

    #[tokio::test]
    async fn test_resolve_schema_file_rewrites_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schema.prisma");
        std::fs::write(
            &path,
            "<<<<<<< HEAD\nmodel A {\n  id Int\n}\n=======\nmodel B {\n  id Int\n}\n>>>>>>> feature\n",
        )
        .unwrap();
        assert!(resolve_schema_file(&path).await.unwrap());
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("model A {"));
        assert!(content.contains("model B {"));
        assert!(!has_conflict_markers(&content));
    }

    #[tokio::test]
    async fn test_resolve_schema_file_without_markers_is_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schema.prisma");
        std::fs::write(&path, "model A {\n}\n").unwrap();
        assert!(resolve_schema_file(&path).await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "model A {\n}\n");
    }

    #[tokio::test]
    async fn test_update_docs_touches_existing_files_only() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join(TODO_DOC), "- [ ] work on ralph/a\n").unwrap();
        let execution = execution_fixture("e1", "ralph/a");
        let date = NaiveDate::from_ymd_opt(2026, 5, 6).unwrap();

        let changed = update_docs(dir.path(), &execution, "abcdef012", date)
            .await
            .unwrap();
        assert_eq!(changed, vec![PathBuf::from(TODO_DOC)]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(TODO_DOC)).unwrap(),
            "- [x] work on ralph/a\n"
        );
        assert!(!dir.path().join(STATUS_DOC).exists());
    }
}
