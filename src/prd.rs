//! Requirements-document parsing.
//!
//! Two formats are accepted: a JSON document (`.json`) and markdown with
//! optional YAML frontmatter, `### US-001: Title` story headings, and an
//! optional `## Dependencies` section.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::LazyLock;

use crate::collab::DocumentParser;

static STORY_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^###\s*(US-\d+)[:\s]+(.+)$").unwrap());

static CHECKBOX_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\d+\.\s*\[[ x]\]\s*\*\*(.+?)\*\*[:\s]*(.*)$").unwrap());

static NUMBERED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\s*(.+)$").unwrap());

static USER_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)As\s+an?\s+.+?I\s+want.+?So\s+that.+?(?:\.|$)").unwrap()
});

static PRIORITY_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)priority[:\s]*(\d+)").unwrap());

static BULLET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*[-*]\s*(.+)$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStory {
    pub id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDocument {
    pub title: String,
    pub description: String,
    pub branch_name: String,
    pub stories: Vec<ParsedStory>,
    /// Prerequisite branch names, normalized to carry the branch prefix.
    pub dependencies: Vec<String>,
}

pub struct PrdParser {
    branch_prefix: String,
}

impl PrdParser {
    pub fn new(branch_prefix: &str) -> Self {
        Self {
            branch_prefix: branch_prefix.to_string(),
        }
    }

    pub fn parse_str(&self, content: &str, is_json: bool) -> Result<ParsedDocument> {
        if is_json {
            self.parse_json(content)
        } else {
            Ok(self.parse_markdown(content))
        }
    }

    fn parse_json(&self, content: &str) -> Result<ParsedDocument> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct JsonStory {
            id: Option<String>,
            title: Option<String>,
            description: Option<String>,
            #[serde(default)]
            acceptance_criteria: Vec<String>,
            priority: Option<i64>,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct JsonPrd {
            title: Option<String>,
            description: Option<String>,
            branch_name: Option<String>,
            #[serde(default)]
            user_stories: Vec<JsonStory>,
            #[serde(default)]
            dependencies: Vec<String>,
        }

        let prd: JsonPrd = serde_json::from_str(content).context("Invalid PRD JSON")?;
        let description = prd.description.unwrap_or_default();
        let title = if description.is_empty() {
            prd.title.unwrap_or_else(|| "Untitled PRD".to_string())
        } else {
            description.clone()
        };
        let stories = prd
            .user_stories
            .into_iter()
            .enumerate()
            .map(|(i, s)| ParsedStory {
                id: s.id.unwrap_or_else(|| format!("US-{:03}", i + 1)),
                title: s.title.unwrap_or_default(),
                description: s.description.unwrap_or_default(),
                acceptance_criteria: s.acceptance_criteria,
                priority: s.priority.filter(|p| *p != 0).unwrap_or(i as i64 + 1),
            })
            .collect();
        Ok(ParsedDocument {
            title,
            description,
            branch_name: prd
                .branch_name
                .unwrap_or_else(|| format!("{}unnamed", self.branch_prefix)),
            stories,
            dependencies: prd.dependencies,
        })
    }

    fn parse_markdown(&self, content: &str) -> ParsedDocument {
        let content = content.replace("\r\n", "\n");
        let (front, body) = split_frontmatter(&content);
        let sections = level_two_sections(body);

        let title = front
            .title
            .clone()
            .or_else(|| {
                body.lines()
                    .find_map(|l| l.strip_prefix("# ").map(|t| t.trim().to_string()))
            })
            .unwrap_or_else(|| "Untitled PRD".to_string());
        let branch_name = front
            .branch
            .clone()
            .unwrap_or_else(|| generate_branch_name(&self.branch_prefix, &title));
        let description = find_section(&sections, &["description", "overview"])
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| title.clone());

        let mut dependencies = Vec::new();
        let listed = find_section(&sections, &["dependencies"])
            .map(|section| {
                section
                    .lines()
                    .filter_map(|l| BULLET.captures(l))
                    .map(|c| c[1].trim().to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        for raw in front.dependencies.iter().cloned().chain(listed) {
            let raw = raw.trim();
            let raw = raw
                .strip_prefix("depends_on:")
                .map(str::trim)
                .unwrap_or(raw);
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            let dep = self.normalize_dependency(raw);
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        let story_section = find_section(&sections, &["user stories"]);
        let stories = extract_stories(story_section.unwrap_or(body), story_section.is_some());

        ParsedDocument {
            title,
            description,
            branch_name,
            stories,
            dependencies,
        }
    }

    /// `prd-a.md` → `ralph/prd-a`; already-prefixed names pass through.
    fn normalize_dependency(&self, dep: &str) -> String {
        let dep = dep
            .strip_suffix(".md")
            .or_else(|| dep.strip_suffix(".MD"))
            .unwrap_or(dep);
        if dep.starts_with(self.branch_prefix.as_str()) {
            dep.to_string()
        } else {
            format!("{}{}", self.branch_prefix, dep)
        }
    }
}

impl DocumentParser for PrdParser {
    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read PRD: {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        self.parse_str(&content, is_json)
    }
}

#[derive(Debug, Default, Deserialize)]
struct Frontmatter {
    title: Option<String>,
    branch: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
}

fn split_frontmatter(content: &str) -> (Frontmatter, &str) {
    let Some(rest) = content.strip_prefix("---\n") else {
        return (Frontmatter::default(), content);
    };
    let Some(end) = rest.find("\n---") else {
        return (Frontmatter::default(), content);
    };
    let yaml = &rest[..end];
    let after = &rest[end + 4..];
    let body = after.strip_prefix('\n').unwrap_or(after);
    let front = serde_yaml::from_str(yaml).unwrap_or_default();
    (front, body)
}

/// `(lowercased heading, content)` for every `## ` section.
fn level_two_sections(body: &str) -> Vec<(String, String)> {
    let mut sections: Vec<(String, String)> = Vec::new();
    for line in body.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            sections.push((heading.trim().to_lowercase(), String::new()));
        } else if let Some((_, content)) = sections.last_mut() {
            content.push_str(line);
            content.push('\n');
        }
    }
    sections
}

fn find_section<'a>(sections: &'a [(String, String)], names: &[&str]) -> Option<&'a str> {
    sections
        .iter()
        .find(|(heading, _)| names.contains(&heading.as_str()))
        .map(|(_, content)| content.as_str())
}

fn extract_stories(text: &str, is_story_section: bool) -> Vec<ParsedStory> {
    // Outside a dedicated section, stop at the next level-two heading.
    let lines: Vec<&str> = text.lines().collect();

    let mut stories = Vec::new();
    let mut current: Option<(String, String, Vec<&str>)> = None;
    for line in &lines {
        if let Some(caps) = STORY_HEADING.captures(line) {
            if let Some((id, title, body)) = current.take() {
                stories.push(parse_story_body(id, title, &body.join("\n")));
            }
            current = Some((caps[1].to_uppercase(), caps[2].trim().to_string(), Vec::new()));
        } else if line.starts_with("## ") {
            if let Some((id, title, body)) = current.take() {
                stories.push(parse_story_body(id, title, &body.join("\n")));
            }
        } else if let Some((_, _, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((id, title, body)) = current.take() {
        stories.push(parse_story_body(id, title, &body.join("\n")));
    }
    for (i, story) in stories.iter_mut().enumerate() {
        story.priority = i as i64 + 1;
    }
    if !stories.is_empty() {
        return stories;
    }

    let mut current: Option<(String, Vec<&str>)> = None;
    let flush = |current: Option<(String, Vec<&str>)>, stories: &mut Vec<ParsedStory>| {
        if let Some((title, body)) = current {
            let id = format!("US-{:03}", stories.len() + 1);
            stories.push(parse_story_body(id, title, &body.join("\n")));
        }
    };
    for line in &lines {
        if let Some(caps) = CHECKBOX_ITEM.captures(line) {
            flush(current.take(), &mut stories);
            let first = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            current = Some((caps[1].trim().to_string(), vec![first]));
        } else if line.starts_with("## ") || NUMBERED_ITEM.is_match(line) {
            flush(current.take(), &mut stories);
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    flush(current.take(), &mut stories);
    if !stories.is_empty() || !is_story_section {
        return stories;
    }

    lines
        .iter()
        .filter_map(|l| NUMBERED_ITEM.captures(l))
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty() && !t.starts_with('#'))
        .enumerate()
        .map(|(i, title)| ParsedStory {
            id: format!("US-{:03}", i + 1),
            title,
            description: String::new(),
            acceptance_criteria: Vec::new(),
            priority: i as i64 + 1,
        })
        .collect()
}

fn parse_story_body(id: String, title: String, body: &str) -> ParsedStory {
    let description = USER_STATEMENT
        .find(body)
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    let lines: Vec<&str> = body.lines().collect();
    let ac_start = lines.iter().position(|l| {
        let lower = l.to_lowercase();
        lower.contains("acceptance criteria") || lower.trim_start_matches(['*', ' ']).starts_with("ac:")
    });
    let criteria_lines: &[&str] = match ac_start {
        Some(start) => {
            let rest = &lines[start + 1..];
            let end = rest
                .iter()
                .position(|l| {
                    let lower = l.trim_start_matches(['*', ' ']).to_lowercase();
                    lower.starts_with("priority") || lower.starts_with("notes")
                })
                .unwrap_or(rest.len());
            &rest[..end]
        }
        None => &lines,
    };
    let acceptance_criteria = criteria_lines
        .iter()
        .filter_map(|l| BULLET.captures(l))
        .map(|c| c[1].trim().to_string())
        .filter(|c| !c.is_empty() && !c.starts_with("As a"))
        .collect();

    let priority = PRIORITY_LINE
        .captures(body)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(1);

    ParsedStory {
        id,
        title: title.trim().to_string(),
        description,
        acceptance_criteria,
        priority,
    }
}

/// `prefix` + lowercase slug of `title`, at most 50 slug characters.
pub fn generate_branch_name(prefix: &str, title: &str) -> String {
    let mut slug = String::new();
    for ch in title.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            slug.push(ch);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug: String = slug.trim_matches('-').chars().take(50).collect();
    format!("{}{}", prefix, slug)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MARKDOWN: &str = "---
branch: ralph/auth
dependencies: [prd-db.md]
---
# Authentication

## Description
Add login and session handling.

## User Stories

### US-001: Login form
As a user, I want to log in, so that I can see my data.

**Acceptance Criteria:**
- Form has email and password
- Errors are shown inline

Priority: 3

### US-002: Sessions
- Sessions expire after 1h

## Dependencies
- depends_on: ralph/prd-shared
- prd-db.md
";

    fn parser() -> PrdParser {
        PrdParser::new("ralph/")
    }

    #[test]
    fn test_markdown_frontmatter_and_sections() {
        let doc = parser().parse_str(MARKDOWN, false).unwrap();
        assert_eq!(doc.title, "Authentication");
        assert_eq!(doc.branch_name, "ralph/auth");
        assert_eq!(doc.description, "Add login and session handling.");
        assert_eq!(
            doc.dependencies,
            vec!["ralph/prd-db".to_string(), "ralph/prd-shared".to_string()]
        );
    }

    #[test]
    fn test_markdown_story_headings() {
        let doc = parser().parse_str(MARKDOWN, false).unwrap();
        assert_eq!(doc.stories.len(), 2);
        let first = &doc.stories[0];
        assert_eq!(first.id, "US-001");
        assert_eq!(first.title, "Login form");
        assert_eq!(first.priority, 1);
        assert!(first.description.starts_with("As a user"));
        assert_eq!(
            first.acceptance_criteria,
            vec!["Form has email and password", "Errors are shown inline"]
        );
        assert_eq!(doc.stories[1].priority, 2);
        assert_eq!(
            doc.stories[1].acceptance_criteria,
            vec!["Sessions expire after 1h"]
        );
    }

    #[test]
    fn test_markdown_checkbox_list_fallback() {
        let doc = parser()
            .parse_str(
                "# Billing\n\n## User Stories\n1. [ ] **Invoices**: list invoices\n- shows totals\n2. [x] **Refunds**\n",
                false,
            )
            .unwrap();
        assert_eq!(doc.branch_name, "ralph/billing");
        let ids: Vec<&str> = doc.stories.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["US-001", "US-002"]);
        assert_eq!(doc.stories[0].title, "Invoices");
        assert_eq!(doc.stories[0].acceptance_criteria, vec!["shows totals"]);
    }

    #[test]
    fn test_markdown_simple_numbered_list_only_in_story_section() {
        let doc = parser()
            .parse_str("# X\n\n## User Stories\n1. First thing\n2. Second thing\n", false)
            .unwrap();
        assert_eq!(doc.stories.len(), 2);
        assert_eq!(doc.stories[1].title, "Second thing");

        let doc = parser()
            .parse_str("# X\n\n## Notes\n1. Not a story\n", false)
            .unwrap();
        assert!(doc.stories.is_empty());
    }

    #[test]
    fn test_json_defaults() {
        let doc = parser()
            .parse_str(
                r#"{"description":"Queue work","userStories":[{"title":"A"},{"id":"US-009","title":"B","priority":5}]}"#,
                true,
            )
            .unwrap();
        assert_eq!(doc.branch_name, "ralph/unnamed");
        assert_eq!(doc.title, "Queue work");
        assert_eq!(doc.stories[0].id, "US-001");
        assert_eq!(doc.stories[0].priority, 1);
        assert_eq!(doc.stories[1].id, "US-009");
        assert_eq!(doc.stories[1].priority, 5);
        assert!(doc.dependencies.is_empty());
    }

    #[test]
    fn test_json_invalid_is_error() {
        assert!(parser().parse_str("{ nope", true).is_err());
    }

    #[test]
    fn test_generate_branch_name() {
        assert_eq!(
            generate_branch_name("ralph/", "  Add OAuth (v2) Login!  "),
            "ralph/add-oauth-v2-login"
        );
    }

    #[test]
    fn test_parse_reads_file_and_picks_format_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prd.json");
        std::fs::write(&path, r#"{"branchName":"ralph/j","userStories":[]}"#).unwrap();
        assert_eq!(parser().parse(&path).unwrap().branch_name, "ralph/j");
        assert!(parser().parse(&dir.path().join("missing.md")).is_err());
    }
}
