//! On-disk ledger format (`state.json`, version 1) and its normalization.
//!
//! Loading goes through [`normalize`], which turns a loosely-shaped JSON
//! document into fully typed records exactly once. Missing arrays, counters
//! and flags take their defaults. A root that is not an object, or enum
//! strings and timestamps that cannot be parsed, fail the whole load.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use super::models::{
    ConflictStrategy, Execution, ExecutionStatus, MergeQueueEntry, QueueStatus,
    StagnationCounters, Story,
};
use super::LedgerState;
use crate::errors::LedgerError;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LedgerFile<'a> {
    version: u32,
    executions: &'a [Execution],
    user_stories: Vec<StoryRecord<'a>>,
    merge_queue: &'a [MergeQueueEntry],
}

/// Stories carry their composite key on disk for readability.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoryRecord<'a> {
    id: String,
    #[serde(flatten)]
    story: &'a Story,
}

/// Serialize the full ledger as one pretty-printed JSON document.
pub fn serialize(state: &LedgerState) -> Result<String, LedgerError> {
    let file = LedgerFile {
        version: SCHEMA_VERSION,
        executions: &state.executions,
        user_stories: state
            .stories
            .iter()
            .map(|story| StoryRecord {
                id: story.key(),
                story,
            })
            .collect(),
        merge_queue: &state.merge_queue,
    };
    let mut text = serde_json::to_string_pretty(&file)?;
    text.push('\n');
    Ok(text)
}

/// Parse and normalize ledger text.
pub fn deserialize(text: &str) -> Result<LedgerState, LedgerError> {
    if text.trim().is_empty() {
        return Ok(LedgerState::default());
    }
    let raw: Value = serde_json::from_str(text)?;
    normalize(raw)
}

/// Build typed ledger records from a raw JSON document.
pub fn normalize(raw: Value) -> Result<LedgerState, LedgerError> {
    let Value::Object(root) = raw else {
        return Err(LedgerError::CorruptRecord {
            field: "root".to_string(),
            message: format!("expected an object, found {}", kind(&raw)),
        });
    };

    let executions = array(&root, "executions")
        .iter()
        .map(normalize_execution)
        .collect::<Result<Vec<_>, _>>()?;
    let stories = array(&root, "userStories")
        .iter()
        .map(normalize_story)
        .collect::<Result<Vec<_>, _>>()?;
    let merge_queue = array(&root, "mergeQueue")
        .iter()
        .map(normalize_queue_entry)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(LedgerState {
        executions,
        stories,
        merge_queue,
    })
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn array<'a>(obj: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    match obj.get(key) {
        Some(Value::Array(items)) => items,
        _ => &[],
    }
}

fn object<'a>(value: &'a Value, field: &str) -> Result<&'a Map<String, Value>, LedgerError> {
    value.as_object().ok_or_else(|| LedgerError::CorruptRecord {
        field: field.to_string(),
        message: "expected an object".to_string(),
    })
}

fn required_str(obj: &Map<String, Value>, key: &str, field: &str) -> Result<String, LedgerError> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(LedgerError::CorruptRecord {
            field: format!("{}.{}", field, key),
            message: "missing required string".to_string(),
        }),
    }
}

fn opt_str(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

fn str_or_default(obj: &Map<String, Value>, key: &str) -> String {
    opt_str(obj, key).unwrap_or_default()
}

fn bool_or(obj: &Map<String, Value>, key: &str, default: bool) -> bool {
    obj.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn count(obj: &Map<String, Value>, key: &str) -> u32 {
    obj.get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

fn string_list(obj: &Map<String, Value>, key: &str) -> Vec<String> {
    match obj.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn timestamp(obj: &Map<String, Value>, key: &str, field: &str) -> Result<DateTime<Utc>, LedgerError> {
    let raw = obj.get(key).and_then(Value::as_str).unwrap_or_default();
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| LedgerError::CorruptTimestamp {
            field: format!("{}.{}", field, key),
            value: raw.to_string(),
        })
}

fn parse_enum<T: FromStr<Err = String>>(
    obj: &Map<String, Value>,
    key: &str,
    field: &str,
    default: T,
) -> Result<T, LedgerError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::String(s)) => s.parse().map_err(|message| LedgerError::CorruptRecord {
            field: format!("{}.{}", field, key),
            message,
        }),
        Some(other) => Err(LedgerError::CorruptRecord {
            field: format!("{}.{}", field, key),
            message: format!("expected a string, found {}", other),
        }),
    }
}

fn normalize_execution(value: &Value) -> Result<Execution, LedgerError> {
    const FIELD: &str = "executions";
    let obj = object(value, FIELD)?;
    Ok(Execution {
        id: required_str(obj, "id", FIELD)?,
        project: str_or_default(obj, "project"),
        branch: required_str(obj, "branch", FIELD)?,
        description: str_or_default(obj, "description"),
        prd_path: PathBuf::from(str_or_default(obj, "prdPath")),
        project_root: PathBuf::from(str_or_default(obj, "projectRoot")),
        worktree_path: opt_str(obj, "worktreePath").map(PathBuf::from),
        status: parse_enum(obj, "status", FIELD, ExecutionStatus::Pending)?,
        agent_task_id: opt_str(obj, "agentTaskId"),
        on_conflict: parse_enum(obj, "onConflict", FIELD, ConflictStrategy::default())?,
        auto_merge: bool_or(obj, "autoMerge", true),
        notify_on_complete: bool_or(obj, "notifyOnComplete", true),
        dependencies: string_list(obj, "dependencies"),
        stagnation: StagnationCounters {
            loop_count: count(obj, "loopCount"),
            consecutive_no_progress: count(obj, "consecutiveNoProgress"),
            consecutive_errors: count(obj, "consecutiveErrors"),
            last_error: opt_str(obj, "lastError"),
            last_files_changed: count(obj, "lastFilesChanged"),
        },
        created_at: timestamp(obj, "createdAt", FIELD)?,
        updated_at: timestamp(obj, "updatedAt", FIELD)?,
    })
}

fn normalize_story(value: &Value) -> Result<Story, LedgerError> {
    const FIELD: &str = "userStories";
    let obj = object(value, FIELD)?;
    Ok(Story {
        execution_id: required_str(obj, "executionId", FIELD)?,
        story_id: required_str(obj, "storyId", FIELD)?,
        title: str_or_default(obj, "title"),
        description: str_or_default(obj, "description"),
        acceptance_criteria: string_list(obj, "acceptanceCriteria"),
        priority: obj.get("priority").and_then(Value::as_i64).unwrap_or(1),
        passes: bool_or(obj, "passes", false),
        notes: str_or_default(obj, "notes"),
    })
}

fn normalize_queue_entry(value: &Value) -> Result<MergeQueueEntry, LedgerError> {
    const FIELD: &str = "mergeQueue";
    let obj = object(value, FIELD)?;
    let id = obj
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| LedgerError::CorruptRecord {
            field: format!("{}.id", FIELD),
            message: "missing numeric id".to_string(),
        })?;
    Ok(MergeQueueEntry {
        id,
        execution_id: required_str(obj, "executionId", FIELD)?,
        position: obj.get("position").and_then(Value::as_i64).unwrap_or(0),
        status: parse_enum(obj, "status", FIELD, QueueStatus::Pending)?,
        created_at: timestamp(obj, "createdAt", FIELD)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::now;
    use serde_json::json;

    fn sample_state() -> LedgerState {
        let at = now();
        LedgerState {
            executions: vec![Execution {
                id: "exec-1".into(),
                project: "shop".into(),
                branch: "ralph/cart".into(),
                description: "Shopping cart".into(),
                prd_path: PathBuf::from("/repo/tasks/prd-cart.md"),
                project_root: PathBuf::from("/repo"),
                worktree_path: Some(PathBuf::from("/repo/.tmp/worktrees/ralph-cart")),
                status: ExecutionStatus::Running,
                agent_task_id: Some("agent-7".into()),
                on_conflict: ConflictStrategy::Notify,
                auto_merge: false,
                notify_on_complete: true,
                dependencies: vec!["ralph/auth".into()],
                stagnation: StagnationCounters {
                    loop_count: 4,
                    consecutive_no_progress: 1,
                    consecutive_errors: 2,
                    last_error: Some("tsc failed".into()),
                    last_files_changed: 0,
                },
                created_at: at,
                updated_at: at,
            }],
            stories: vec![Story {
                execution_id: "exec-1".into(),
                story_id: "US-001".into(),
                title: "Add cart".into(),
                description: "As a shopper...".into(),
                acceptance_criteria: vec!["Cart persists".into(), "Totals update".into()],
                priority: 1,
                passes: true,
                notes: "done".into(),
            }],
            merge_queue: vec![MergeQueueEntry {
                id: 1,
                execution_id: "exec-1".into(),
                position: 1,
                status: QueueStatus::Pending,
                created_at: at,
            }],
        }
    }

    #[test]
    fn test_serialize_then_deserialize_reproduces_records() {
        let state = sample_state();
        let text = serialize(&state).unwrap();
        let loaded = deserialize(&text).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_serialized_layout_uses_camel_case_keys() {
        let text = serialize(&sample_state()).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["executions"][0]["prdPath"], "/repo/tasks/prd-cart.md");
        assert_eq!(value["executions"][0]["consecutiveNoProgress"], 1);
        assert_eq!(value["userStories"][0]["id"], "exec-1:US-001");
        assert_eq!(value["mergeQueue"][0]["executionId"], "exec-1");
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let raw = json!({
            "executions": [{
                "id": "e1",
                "branch": "ralph/a",
                "status": "pending",
                "createdAt": "2025-01-02T03:04:05.678Z",
                "updatedAt": "2025-01-02T03:04:05.678Z"
            }],
            "userStories": [{ "executionId": "e1", "storyId": "US-001" }]
        });
        let state = normalize(raw).unwrap();
        let exec = &state.executions[0];
        assert!(exec.dependencies.is_empty());
        assert_eq!(exec.stagnation, StagnationCounters::default());
        assert!(exec.auto_merge);
        assert_eq!(exec.on_conflict, ConflictStrategy::Agent);
        assert!(state.stories[0].acceptance_criteria.is_empty());
        assert_eq!(state.stories[0].notes, "");
        assert!(state.merge_queue.is_empty());
    }

    #[test]
    fn test_non_array_collections_are_treated_as_empty() {
        let state = normalize(json!({ "executions": "oops", "mergeQueue": 3 })).unwrap();
        assert_eq!(state, LedgerState::default());
        assert_eq!(deserialize("  ").unwrap(), LedgerState::default());
    }

    #[test]
    fn test_non_object_root_is_corrupt() {
        for text in ["[]", "null", "42", "\"state\""] {
            match deserialize(text) {
                Err(LedgerError::CorruptRecord { field, message }) => {
                    assert_eq!(field, "root");
                    assert!(message.starts_with("expected an object"), "{}", message);
                }
                other => panic!("Expected CorruptRecord for {}, got {:?}", text, other),
            }
        }
    }

    #[test]
    fn test_bad_timestamp_fails_whole_load() {
        let raw = json!({
            "executions": [{
                "id": "e1",
                "branch": "ralph/a",
                "createdAt": "yesterday",
                "updatedAt": "2025-01-02T03:04:05.678Z"
            }]
        });
        match normalize(raw) {
            Err(LedgerError::CorruptTimestamp { field, value }) => {
                assert_eq!(field, "executions.createdAt");
                assert_eq!(value, "yesterday");
            }
            other => panic!("Expected CorruptTimestamp, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_status_is_corrupt() {
        let raw = json!({
            "mergeQueue": [{
                "id": 1,
                "executionId": "e1",
                "position": 1,
                "status": "paused",
                "createdAt": "2025-01-02T03:04:05.678Z"
            }]
        });
        assert!(matches!(
            normalize(raw),
            Err(LedgerError::CorruptRecord { .. })
        ));
    }
}
