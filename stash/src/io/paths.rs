//! Filesystem-backed path resolution for project roots and command directories.

use std::path::{Path, PathBuf};

use crate::core::policy::PathResolver;
use crate::error::{StashError, StashResult};

/// Canonicalize a project root. It must exist and be a directory.
pub fn canonical_root(root: &Path) -> StashResult<PathBuf> {
    if !root.is_absolute() {
        return Err(StashError::invalid(format!(
            "project root must be absolute: {}",
            root.display()
        )));
    }
    let canonical = root.canonicalize().map_err(|err| {
        StashError::invalid(format!("cannot open project root {}: {err}", root.display()))
    })?;
    if !canonical.is_dir() {
        return Err(StashError::invalid(format!(
            "project root is not a directory: {}",
            canonical.display()
        )));
    }
    Ok(canonical)
}

/// Resolves symlinks through the deepest existing ancestor of a path.
///
/// Non-existent tails are appended unchanged, so a `cwd` that does not exist
/// yet is still checked against where it would land.
pub struct FsResolver;

impl PathResolver for FsResolver {
    fn resolve(&self, path: &Path) -> PathBuf {
        let mut existing = path.to_path_buf();
        let mut tail = Vec::new();
        loop {
            if let Ok(canonical) = existing.canonicalize() {
                let mut resolved = canonical;
                for part in tail.iter().rev() {
                    resolved.push(part);
                }
                return resolved;
            }
            match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
                (Some(name), Some(parent)) => {
                    tail.push(name);
                    existing = parent.to_path_buf();
                }
                _ => return path.to_path_buf(),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::policy::{CommandPolicy, RejectionKind, plan_commands};

    #[test]
    fn relative_root_is_invalid() {
        let err = canonical_root(Path::new("relative/dir")).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn resolves_missing_tail_under_existing_ancestor() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = canonical_root(temp.path()).expect("root");
        let resolved = FsResolver.resolve(&root.join("not/yet/here"));
        assert_eq!(resolved, root.join("not/yet/here"));
    }

    #[test]
    fn symlink_escaping_root_is_rejected() {
        let outside = tempfile::tempdir().expect("outside");
        let temp = tempfile::tempdir().expect("tempdir");
        let root = canonical_root(temp.path()).expect("root");
        std::os::unix::fs::symlink(outside.path(), root.join("escape")).expect("symlink");

        let text = format!(
            "<codex_cmd>\ncwd: {}\ncmd: ls\n</codex_cmd>",
            root.join("escape").display()
        );
        let plan = plan_commands(&text, &root, &CommandPolicy::permissive(), &FsResolver);
        assert!(plan.commands.is_empty());
        assert_eq!(plan.rejections.len(), 1);
        assert_eq!(plan.rejections[0].kind, RejectionKind::Policy);
    }
}
