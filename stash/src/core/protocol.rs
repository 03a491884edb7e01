//! Extraction of `<codex_cmd>` blocks from planner output.
//!
//! A block body is a tiny `key: value` schema. `cmd` is always the last key:
//! everything from the `cmd:` line to the end marker belongs to the command,
//! so multi-line shell snippets survive intact.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

pub const BLOCK_START: &str = "<codex_cmd>";
pub const BLOCK_END: &str = "</codex_cmd>";
pub const DEFAULT_WORKTREE: &str = "main";

static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<codex_cmd>(.*?)</codex_cmd>").expect("block regex should be valid")
});

/// A syntactically valid block, before path and policy checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandBlock {
    /// 0-based position of the block in the planner text.
    pub index: usize,
    pub worktree: String,
    /// Raw `cwd` value; `None` means "project root".
    pub cwd: Option<String>,
    pub cmd: String,
    pub raw: String,
}

/// A block that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockParseError {
    pub index: usize,
    pub reason: String,
}

/// Scan `text` for tagged blocks, returning one result per block in order.
///
/// Zero blocks is a valid, prose-only reply.
pub fn extract_blocks(text: &str) -> Vec<Result<CommandBlock, BlockParseError>> {
    BLOCK_RE
        .captures_iter(text)
        .enumerate()
        .map(|(index, caps)| {
            let raw = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            let body = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            parse_block(index, body, raw)
        })
        .collect()
}

fn parse_block(index: usize, body: &str, raw: &str) -> Result<CommandBlock, BlockParseError> {
    let fail = |reason: String| BlockParseError { index, reason };

    let mut worktree: Option<String> = None;
    let mut cwd: Option<String> = None;
    let mut cmd_lines: Option<Vec<&str>> = None;

    for line in body.lines() {
        if let Some(lines) = cmd_lines.as_mut() {
            lines.push(line);
            continue;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            return Err(fail(format!("expected `key: value`, got `{trimmed}`")));
        };
        let value = value.trim();
        match key.trim() {
            "worktree" => {
                if worktree.replace(value.to_string()).is_some() {
                    return Err(fail("duplicate key `worktree`".to_string()));
                }
            }
            "cwd" => {
                if cwd.replace(value.to_string()).is_some() {
                    return Err(fail("duplicate key `cwd`".to_string()));
                }
            }
            "cmd" => cmd_lines = Some(vec![value]),
            "" => return Err(fail("empty key".to_string())),
            other => return Err(fail(format!("unrecognized key `{other}`"))),
        }
    }

    let Some(lines) = cmd_lines else {
        return Err(fail("missing `cmd`".to_string()));
    };
    let cmd = lines.join("\n").trim().to_string();

    Ok(CommandBlock {
        index,
        worktree: worktree
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| DEFAULT_WORKTREE.to_string()),
        cwd: cwd.filter(|c| !c.is_empty()),
        cmd,
        raw: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prose_only_yields_no_blocks() {
        assert!(extract_blocks("Sure, nothing to run here.").is_empty());
    }

    #[test]
    fn parses_all_three_keys() {
        let text = "Plan:\n<codex_cmd>\nworktree: feature-x\ncwd: /tmp/p\ncmd: create notes.md\n</codex_cmd>\n";
        let blocks = extract_blocks(text);
        assert_eq!(blocks.len(), 1);
        let block = blocks[0].as_ref().expect("parsed");
        assert_eq!(block.index, 0);
        assert_eq!(block.worktree, "feature-x");
        assert_eq!(block.cwd.as_deref(), Some("/tmp/p"));
        assert_eq!(block.cmd, "create notes.md");
    }

    #[test]
    fn cmd_spans_multiple_lines_until_end_marker() {
        let text = "<codex_cmd>\ncwd: /p\ncmd: first line\nsecond line\n  indented: third\n</codex_cmd>";
        let block = extract_blocks(text).remove(0).expect("parsed");
        assert_eq!(block.cmd, "first line\nsecond line\n  indented: third");
    }

    #[test]
    fn missing_cmd_is_a_block_level_error() {
        let text = "<codex_cmd>\ncwd: /p\n</codex_cmd>\n<codex_cmd>\ncmd: ok\n</codex_cmd>";
        let blocks = extract_blocks(text);
        assert_eq!(blocks.len(), 2);
        let err = blocks[0].as_ref().expect_err("missing cmd");
        assert_eq!(err.index, 0);
        assert!(err.reason.contains("missing `cmd`"));
        let ok = blocks[1].as_ref().expect("second block parses");
        assert_eq!(ok.worktree, DEFAULT_WORKTREE);
        assert_eq!(ok.cwd, None);
    }

    #[test]
    fn unknown_and_duplicate_keys_are_rejected() {
        let unknown = extract_blocks("<codex_cmd>\nshell: bash\ncmd: ls\n</codex_cmd>");
        assert!(unknown[0].as_ref().is_err_and(|e| e.reason.contains("unrecognized key")));

        let dup = extract_blocks("<codex_cmd>\ncwd: /a\ncwd: /b\ncmd: ls\n</codex_cmd>");
        assert!(dup[0].as_ref().is_err_and(|e| e.reason.contains("duplicate key")));
    }

    #[test]
    fn unterminated_block_is_ignored() {
        assert!(extract_blocks("<codex_cmd>\ncmd: ls\n").is_empty());
    }
}
