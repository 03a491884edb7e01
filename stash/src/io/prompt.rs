//! Planner prompt composition.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::Value;

use crate::core::summary::truncate_chars;
use crate::core::types::{Message, Project};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const MAX_FILE_PARTS: usize = 6;
const FILE_EXCERPT_LIMIT: usize = 5_000;

#[derive(Debug, Clone, Serialize)]
struct ProjectContext<'a> {
    name: &'a str,
    root_path: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct TranscriptEntry<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct FileContext {
    path: String,
    excerpt: Option<String>,
}

/// Everything the planner sees for one run.
#[derive(Debug, Clone)]
pub struct PlannerInputs<'a> {
    pub project: &'a Project,
    /// Rolling conversation summary, if one has been recorded.
    pub summary: Option<&'a str>,
    /// Prior messages, oldest first, excluding the trigger.
    pub transcript: &'a [Message],
    pub trigger: &'a Message,
}

/// Render the planner prompt for a run.
pub fn render_planner_prompt(inputs: &PlannerInputs<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("planner", PLANNER_TEMPLATE)
        .context("load planner template")?;
    let template = env.get_template("planner")?;

    let transcript: Vec<TranscriptEntry<'_>> = inputs
        .transcript
        .iter()
        .filter(|m| !m.is_superseded() && !m.content.trim().is_empty())
        .map(|m| TranscriptEntry {
            role: m.role.as_str(),
            content: m.content.trim(),
        })
        .collect();

    let rendered = template
        .render(context! {
            project => ProjectContext {
                name: &inputs.project.name,
                root_path: &inputs.project.root_path,
            },
            summary => inputs.summary.map(str::trim).filter(|s| !s.is_empty()),
            transcript => transcript,
            request => inputs.trigger.content.trim(),
            files => file_contexts(&inputs.trigger.parts),
        })
        .context("render planner template")?;
    Ok(rendered)
}

/// `file_context` parts attached to a message, bounded in count and size.
fn file_contexts(parts: &[Value]) -> Vec<FileContext> {
    parts
        .iter()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("file_context"))
        .filter_map(|part| {
            let path = part.get("path").and_then(Value::as_str).unwrap_or("").trim();
            let excerpt = part
                .get("excerpt")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim();
            if path.is_empty() && excerpt.is_empty() {
                return None;
            }
            Some(FileContext {
                path: if path.is_empty() { "(unknown)" } else { path }.to_string(),
                excerpt: (!excerpt.is_empty()).then(|| truncate_chars(excerpt, FILE_EXCERPT_LIMIT)),
            })
        })
        .take(MAX_FILE_PARTS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Role;
    use serde_json::json;

    fn project() -> Project {
        Project {
            id: "proj_1".to_string(),
            name: "notes".to_string(),
            root_path: "/work/notes".to_string(),
            created_at: "2026-01-01T00:00:00.000000Z".to_string(),
            last_opened_at: "2026-01-01T00:00:00.000000Z".to_string(),
            active_conversation_id: None,
        }
    }

    fn message(seq: i64, role: Role, content: &str, parts: Vec<Value>) -> Message {
        Message {
            id: format!("msg_{seq}"),
            project_id: "proj_1".to_string(),
            conversation_id: "conv_1".to_string(),
            role,
            content: content.to_string(),
            parts,
            parent_message_id: None,
            sequence_no: seq,
            created_at: "2026-01-01T00:00:00.000000Z".to_string(),
            superseded_by: None,
            metadata: json!({}),
            asset_ids: Vec::new(),
        }
    }

    /// Verifies the prompt carries the block contract, history, and request in order.
    #[test]
    fn prompt_sections_are_ordered() {
        let project = project();
        let history = vec![
            message(1, Role::User, "hello", vec![]),
            message(2, Role::Assistant, "hi there", vec![]),
        ];
        let trigger = message(3, Role::User, "create notes.md", vec![]);
        let prompt = render_planner_prompt(&PlannerInputs {
            project: &project,
            summary: Some("a notes folder"),
            transcript: &history,
            trigger: &trigger,
        })
        .expect("render");

        let contract = prompt.find("<codex_cmd>").expect("contract");
        let summary = prompt.find("a notes folder").expect("summary");
        let history = prompt.find("[assistant] hi there").expect("history");
        let request = prompt.find("create notes.md").expect("request");
        assert!(contract < summary && summary < history && history < request);
        assert!(prompt.contains("cwd: /work/notes"));
    }

    /// Verifies superseded messages are left out of the transcript.
    #[test]
    fn superseded_history_is_skipped() {
        let project = project();
        let mut old = message(1, Role::User, "old wording", vec![]);
        old.superseded_by = Some("msg_2".to_string());
        let history = vec![old, message(2, Role::User, "new wording", vec![])];
        let trigger = message(3, Role::User, "go", vec![]);
        let prompt = render_planner_prompt(&PlannerInputs {
            project: &project,
            summary: None,
            transcript: &history,
            trigger: &trigger,
        })
        .expect("render");
        assert!(!prompt.contains("old wording"));
        assert!(prompt.contains("new wording"));
    }

    /// Verifies file context parts are bounded and non-file parts ignored.
    #[test]
    fn file_context_parts_are_bounded() {
        let mut parts: Vec<Value> = (0..8)
            .map(|i| json!({"type": "file_context", "path": format!("f{i}.txt"), "excerpt": "x"}))
            .collect();
        parts.push(json!({"type": "command_execution", "path": "ignored"}));
        parts.push(json!({"type": "file_context"}));
        let files = file_contexts(&parts);
        assert_eq!(files.len(), MAX_FILE_PARTS);
        assert_eq!(files[0].path, "f0.txt");

        let long = json!([{"type": "file_context", "excerpt": "y".repeat(6_000)}]);
        let files = file_contexts(long.as_array().expect("array"));
        assert_eq!(files[0].path, "(unknown)");
        assert!(files[0].excerpt.as_deref().is_some_and(|e| e.ends_with("(truncated)")));
    }
}
