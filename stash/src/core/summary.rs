//! Deterministic text rendering for run outcomes.

use serde::{Deserialize, Serialize};

const DETAIL_LIMIT: usize = 240;
const TOOL_STDOUT_LIMIT: usize = 4_000;
const TOOL_STDERR_LIMIT: usize = 2_000;

/// Outcome of one executed step, as reported in the assistant summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepReport {
    Exited { exit_code: i32, detail: Option<String> },
    Errored { error: String },
}

impl StepReport {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Exited { exit_code: 0, .. })
    }

    /// `Step 2: exit_code=1 (No such file)` style line. `step_index` is the run step index.
    pub fn line(&self, step_index: i64) -> String {
        match self {
            Self::Exited {
                exit_code,
                detail: Some(detail),
            } if *exit_code != 0 => format!("Step {step_index}: exit_code={exit_code} ({detail})"),
            Self::Exited { exit_code, .. } => format!("Step {step_index}: exit_code={exit_code}"),
            Self::Errored { error } => format!("Step {step_index}: failed ({error})"),
        }
    }
}

/// First non-empty line of stderr, else stdout, bounded for display.
pub fn failure_detail(stdout: &str, stderr: &str) -> Option<String> {
    [stderr, stdout]
        .into_iter()
        .filter_map(|stream| stream.trim().lines().next())
        .map(|line| truncate_chars(line.trim(), DETAIL_LIMIT))
        .find(|line| !line.is_empty())
}

/// Body of the `tool` message recorded for an executed command.
pub fn tool_message(cmd: &str, exit_code: i32, stdout: &str, stderr: &str) -> String {
    format!(
        "Executed command:\n{cmd}\n\nexit_code={exit_code}\nstdout:\n{}\n\nstderr:\n{}",
        truncate_chars(stdout.trim(), TOOL_STDOUT_LIMIT),
        truncate_chars(stderr.trim(), TOOL_STDERR_LIMIT),
    )
}

/// Planner reply followed by an execution summary, when any step ran.
pub fn assistant_message(planner_text: &str, reports: &[(i64, StepReport)]) -> String {
    let mut content = planner_text.trim().to_string();
    if !reports.is_empty() {
        let lines: Vec<String> = reports
            .iter()
            .map(|(index, report)| report.line(*index))
            .collect();
        if !content.is_empty() {
            content.push_str("\n\n");
        }
        content.push_str("Execution summary:\n- ");
        content.push_str(&lines.join("\n- "));
    }
    if content.is_empty() {
        content.push_str("(no reply)");
    }
    content
}

/// `output_summary` for a run that executed its whole plan.
pub fn output_summary(total: usize, failures: usize) -> String {
    if failures == 0 {
        format!("{total} step(s) executed")
    } else {
        format!("{total} step(s), {failures} failed")
    }
}

pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((byte_idx, _)) => format!("{}... (truncated)", &text[..byte_idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_message_appends_execution_summary() {
        let reports = vec![
            (
                1,
                StepReport::Exited {
                    exit_code: 0,
                    detail: None,
                },
            ),
            (
                2,
                StepReport::Exited {
                    exit_code: 2,
                    detail: Some("boom".to_string()),
                },
            ),
        ];
        let message = assistant_message("Doing it.", &reports);
        assert_eq!(
            message,
            "Doing it.\n\nExecution summary:\n- Step 1: exit_code=0\n- Step 2: exit_code=2 (boom)"
        );
    }

    #[test]
    fn prose_only_reply_is_passed_through() {
        assert_eq!(assistant_message("  hello \n", &[]), "hello");
    }

    #[test]
    fn failure_detail_prefers_stderr() {
        assert_eq!(
            failure_detail("out line\n", "\nerr line\nmore"),
            Some("err line".to_string())
        );
        assert_eq!(failure_detail("only out", ""), Some("only out".to_string()));
        assert_eq!(failure_detail("", "  "), None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé... (truncated)");
        assert_eq!(truncate_chars("hi", 2), "hi");
    }
}
