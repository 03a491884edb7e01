//! Path confinement and denylist validation for extracted command blocks.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::protocol::{CommandBlock, extract_blocks};

/// Why a block was refused.
///
/// `Parse` means the block could not be understood; `Policy` means it was
/// understood and refused for safety. Callers rely on the distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionKind {
    #[serde(rename = "protocol_parse_error")]
    Parse,
    #[serde(rename = "policy_rejected")]
    Policy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub block_index: usize,
    pub kind: RejectionKind,
    pub reason: String,
}

/// A block that passed every check and may be executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedCommand {
    pub block_index: usize,
    pub worktree: String,
    pub cwd: PathBuf,
    pub cmd: String,
}

/// Output of the command protocol for one planner reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPlan {
    pub commands: Vec<ValidatedCommand>,
    pub rejections: Vec<Rejection>,
}

impl CommandPlan {
    pub fn is_clean(&self) -> bool {
        self.rejections.is_empty()
    }

    /// One line per rejection, suitable for a run's error detail.
    pub fn rejection_detail(&self) -> String {
        self.rejections
            .iter()
            .map(|r| {
                let kind = match r.kind {
                    RejectionKind::Parse => "ProtocolParseError",
                    RejectionKind::Policy => "PolicyRejected",
                };
                format!("block {}: {kind}: {}", r.block_index, r.reason)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Resolves symlinks for a normalized absolute path.
///
/// Kept behind a trait so the protocol stays free of filesystem access.
pub trait PathResolver {
    fn resolve(&self, path: &Path) -> PathBuf;
}

/// Resolver that trusts the lexical path (no symlink resolution).
pub struct LexicalResolver;

impl PathResolver for LexicalResolver {
    fn resolve(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }
}

/// Denylist policy applied to every shell segment of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPolicy {
    deny_prefixes: Vec<String>,
}

impl CommandPolicy {
    pub fn new<I, S>(deny_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            deny_prefixes: deny_prefixes
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn permissive() -> Self {
        Self {
            deny_prefixes: Vec::new(),
        }
    }

    /// Return the first denied prefix matched by any segment of `cmd`.
    pub fn denied_prefix(&self, cmd: &str) -> Option<&str> {
        shell_segments(cmd).find_map(|segment| {
            let segment = segment.to_lowercase();
            self.deny_prefixes
                .iter()
                .find(|prefix| starts_with_word(&segment, prefix))
                .map(String::as_str)
        })
    }
}

/// Extract and validate every block in `planner_text` against `root`.
///
/// `root` must already be canonical. The result keeps document order for both
/// accepted commands and rejections.
pub fn plan_commands<R: PathResolver>(
    planner_text: &str,
    root: &Path,
    policy: &CommandPolicy,
    resolver: &R,
) -> CommandPlan {
    let mut plan = CommandPlan::default();
    for parsed in extract_blocks(planner_text) {
        match parsed {
            Ok(block) => match validate_block(&block, root, policy, resolver) {
                Ok(command) => plan.commands.push(command),
                Err(rejection) => plan.rejections.push(rejection),
            },
            Err(err) => plan.rejections.push(Rejection {
                block_index: err.index,
                kind: RejectionKind::Parse,
                reason: err.reason,
            }),
        }
    }
    plan
}

pub fn validate_block<R: PathResolver>(
    block: &CommandBlock,
    root: &Path,
    policy: &CommandPolicy,
    resolver: &R,
) -> Result<ValidatedCommand, Rejection> {
    let reject = |kind, reason: String| Rejection {
        block_index: block.index,
        kind,
        reason,
    };

    if block.cmd.trim().is_empty() {
        return Err(reject(RejectionKind::Parse, "empty `cmd`".to_string()));
    }

    let cwd = match block.cwd.as_deref() {
        None => root.to_path_buf(),
        Some(raw) => {
            let path = Path::new(raw);
            if !path.is_absolute() {
                return Err(reject(
                    RejectionKind::Policy,
                    format!("cwd `{raw}` is not an absolute path"),
                ));
            }
            let resolved = resolver.resolve(&normalize_lexically(path));
            if !resolved.starts_with(root) {
                return Err(reject(
                    RejectionKind::Policy,
                    format!("cwd `{raw}` escapes project root {}", root.display()),
                ));
            }
            resolved
        }
    };

    if let Some(prefix) = policy.denied_prefix(&block.cmd) {
        return Err(reject(
            RejectionKind::Policy,
            format!("command matches denied prefix `{prefix}`"),
        ));
    }

    Ok(ValidatedCommand {
        block_index: block.index,
        worktree: block.worktree.clone(),
        cwd,
        cmd: block.cmd.clone(),
    })
}

/// Collapse `.` and `..` without touching the filesystem. `..` at the root stays at the root.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn shell_segments(cmd: &str) -> impl Iterator<Item = &str> {
    cmd.split(['\n', ';', '|', '&'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn starts_with_word(segment: &str, prefix: &str) -> bool {
    segment.starts_with(prefix)
        && segment[prefix.len()..]
            .chars()
            .next()
            .is_none_or(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(cwd: Option<&str>, cmd: &str) -> CommandBlock {
        CommandBlock {
            index: 0,
            worktree: "main".to_string(),
            cwd: cwd.map(str::to_string),
            cmd: cmd.to_string(),
            raw: String::new(),
        }
    }

    fn default_policy() -> CommandPolicy {
        CommandPolicy::new(["sudo", "rm -rf /", "curl", "git push"])
    }

    #[test]
    fn cwd_inside_root_is_accepted() {
        let root = Path::new("/work/project");
        let cmd = validate_block(
            &block(Some("/work/project/src"), "create notes.md"),
            root,
            &default_policy(),
            &LexicalResolver,
        )
        .expect("accepted");
        assert_eq!(cmd.cwd, PathBuf::from("/work/project/src"));
    }

    #[test]
    fn missing_cwd_defaults_to_root() {
        let root = Path::new("/work/project");
        let cmd = validate_block(&block(None, "ls"), root, &default_policy(), &LexicalResolver)
            .expect("accepted");
        assert_eq!(cmd.cwd, root);
    }

    #[test]
    fn dotdot_escape_is_policy_rejected() {
        let root = Path::new("/work/project");
        let rejection = validate_block(
            &block(Some("/work/project/../other"), "ls"),
            root,
            &default_policy(),
            &LexicalResolver,
        )
        .expect_err("rejected");
        assert_eq!(rejection.kind, RejectionKind::Policy);
        assert!(rejection.reason.contains("escapes project root"));
    }

    #[test]
    fn sibling_with_shared_prefix_is_rejected() {
        let root = Path::new("/work/project");
        let rejection = validate_block(
            &block(Some("/work/project-evil"), "ls"),
            root,
            &default_policy(),
            &LexicalResolver,
        )
        .expect_err("rejected");
        assert_eq!(rejection.kind, RejectionKind::Policy);
    }

    #[test]
    fn relative_cwd_is_rejected() {
        let rejection = validate_block(
            &block(Some("src"), "ls"),
            Path::new("/work/project"),
            &default_policy(),
            &LexicalResolver,
        )
        .expect_err("rejected");
        assert_eq!(rejection.kind, RejectionKind::Policy);
    }

    #[test]
    fn empty_cmd_is_a_parse_rejection() {
        let rejection = validate_block(
            &block(None, "   "),
            Path::new("/p"),
            &default_policy(),
            &LexicalResolver,
        )
        .expect_err("rejected");
        assert_eq!(rejection.kind, RejectionKind::Parse);
    }

    #[test]
    fn denylist_checks_every_segment_on_word_boundaries() {
        let policy = default_policy();
        assert_eq!(policy.denied_prefix("ls && curl example.com"), Some("curl"));
        assert_eq!(policy.denied_prefix("echo hi\nSUDO make install"), Some("sudo"));
        assert_eq!(policy.denied_prefix("git push origin main"), Some("git push"));
        assert_eq!(policy.denied_prefix("curly-braces --check"), None);
        assert_eq!(policy.denied_prefix("rm -rf /work/project/build"), None);
        assert_eq!(policy.denied_prefix("rm -rf /"), Some("rm -rf /"));
    }

    #[test]
    fn plan_commands_keeps_order_and_separates_kinds() {
        let text = "\
<codex_cmd>
cwd: /work/project
cmd: create notes.md
</codex_cmd>
<codex_cmd>
cwd: /etc
cmd: edit passwd
</codex_cmd>
<codex_cmd>
worktree: x
</codex_cmd>";
        let plan = plan_commands(
            text,
            Path::new("/work/project"),
            &default_policy(),
            &LexicalResolver,
        );
        assert_eq!(plan.commands.len(), 1);
        assert_eq!(plan.commands[0].cmd, "create notes.md");
        assert_eq!(plan.rejections.len(), 2);
        assert_eq!(plan.rejections[0].block_index, 1);
        assert_eq!(plan.rejections[0].kind, RejectionKind::Policy);
        assert_eq!(plan.rejections[1].block_index, 2);
        assert_eq!(plan.rejections[1].kind, RejectionKind::Parse);
        assert!(plan.rejection_detail().contains("block 2: ProtocolParseError"));
    }

    #[test]
    fn normalize_collapses_dot_segments() {
        assert_eq!(
            normalize_lexically(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
        assert_eq!(normalize_lexically(Path::new("/../x")), PathBuf::from("/x"));
    }
}
