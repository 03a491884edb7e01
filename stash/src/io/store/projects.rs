use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use super::HistoryStore;
use super::rows::{self, PROJECT_COLUMNS};
use crate::core::types::{ConversationStatus, Project};
use crate::error::{StashError, StashResult};
use crate::io::ids::{new_id, now_timestamp};
use crate::io::paths::canonical_root;

impl HistoryStore {
    /// Register a project root, or reopen the project already bound to it.
    ///
    /// `root` is canonicalized first, so two spellings of the same directory
    /// map to one project.
    pub fn open_project(&self, name: Option<&str>, root: &Path) -> StashResult<Project> {
        let root = canonical_root(root)?;
        let root_path = root
            .to_str()
            .ok_or_else(|| StashError::invalid(format!("root is not UTF-8: {}", root.display())))?
            .to_string();
        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => root
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("project")
                .to_string(),
        };

        self.write(|tx, _| {
            let now = now_timestamp();
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM projects WHERE root_path = ?1",
                    params![root_path],
                    |row| row.get(0),
                )
                .optional()?;
            let id = match existing {
                Some(id) => {
                    tx.execute(
                        "UPDATE projects SET last_opened_at = ?2 WHERE id = ?1",
                        params![id, now],
                    )?;
                    id
                }
                None => {
                    let id = new_id("proj");
                    tx.execute(
                        "INSERT INTO projects (id, name, root_path, created_at, last_opened_at) \
                         VALUES (?1, ?2, ?3, ?4, ?4)",
                        params![id, name, root_path, now],
                    )?;
                    info!(project_id = %id, root = %root_path, "registered project");
                    id
                }
            };
            project_tx(tx, &id)
        })
    }

    pub fn get_project(&self, project_id: &str) -> StashResult<Project> {
        self.read(|conn| project_tx(conn, project_id))
    }

    /// Most recently opened first.
    pub fn list_projects(&self) -> StashResult<Vec<Project>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY last_opened_at DESC, id"
            ))?;
            let projects = stmt
                .query_map([], rows::project)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(projects)
        })
    }

    pub fn set_active_conversation(
        &self,
        project_id: &str,
        conversation_id: &str,
    ) -> StashResult<Project> {
        self.write(|tx, _| {
            project_tx(tx, project_id)?;
            let conversation = super::conversations::conversation_tx(tx, conversation_id)?;
            if conversation.project_id != project_id {
                return Err(StashError::not_found("conversation", conversation_id));
            }
            if conversation.status == ConversationStatus::Archived {
                return Err(StashError::conflict(format!(
                    "conversation {conversation_id} is archived"
                )));
            }
            tx.execute(
                "UPDATE projects SET active_conversation_id = ?2 WHERE id = ?1",
                params![project_id, conversation_id],
            )?;
            project_tx(tx, project_id)
        })
    }
}

pub(super) fn project_tx(conn: &Connection, project_id: &str) -> StashResult<Project> {
    conn.query_row(
        &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
        params![project_id],
        rows::project,
    )
    .optional()?
    .ok_or_else(|| StashError::not_found("project", project_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopening_a_root_returns_the_same_project() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::open_in_memory().expect("store");
        let first = store.open_project(Some("notes"), temp.path()).expect("open");
        let again = store
            .open_project(None, &temp.path().join("."))
            .expect("reopen");
        assert_eq!(first.id, again.id);
        assert_eq!(again.name, "notes");
        assert!(again.last_opened_at >= first.last_opened_at);
        assert_eq!(store.list_projects().expect("list").len(), 1);
    }

    #[test]
    fn missing_root_is_invalid_input() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::open_in_memory().expect("store");
        let err = store
            .open_project(None, &temp.path().join("missing"))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn unknown_project_is_not_found() {
        let store = HistoryStore::open_in_memory().expect("store");
        let err = store.get_project("proj_nope").unwrap_err();
        assert!(matches!(err, StashError::NotFound { entity: "project", .. }));
    }
}
