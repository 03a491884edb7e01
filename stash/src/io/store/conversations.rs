use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::HistoryStore;
use super::events::emit;
use super::messages::{insert_message, message_tx, messages_through};
use super::projects::project_tx;
use super::runs::active_run_tx;
use super::rows::{self, CONVERSATION_COLUMNS};
use crate::core::types::{Conversation, ConversationStatus, Event, EventType, NewEvent};
use crate::error::{StashError, StashResult};
use crate::io::ids::{new_id, now_timestamp};

/// Partial update of a conversation's mutable attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub pinned: Option<bool>,
    pub status: Option<ConversationStatus>,
    pub summary: Option<String>,
}

impl ConversationUpdate {
    fn changed_fields(&self) -> Vec<&'static str> {
        [
            ("title", self.title.is_some()),
            ("pinned", self.pinned.is_some()),
            ("status", self.status.is_some()),
            ("summary", self.summary.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect()
    }
}

impl HistoryStore {
    /// Create an empty conversation. It becomes the project's active
    /// conversation when none is set.
    pub fn create_conversation(&self, project_id: &str, title: &str) -> StashResult<Conversation> {
        let title = required_title(title)?;
        self.write(|tx, recorded| {
            let project = project_tx(tx, project_id)?;
            let conversation = insert_conversation(tx, project_id, &title, None, None)?;
            if project.active_conversation_id.is_none() {
                set_active(tx, project_id, Some(&conversation.id))?;
            }
            emit_conversation(tx, recorded, EventType::ConversationCreated, &conversation, &[])?;
            info!(conversation_id = %conversation.id, project_id, "created conversation");
            Ok(conversation)
        })
    }

    pub fn get_conversation(&self, conversation_id: &str) -> StashResult<Conversation> {
        self.read(|conn| conversation_tx(conn, conversation_id))
    }

    /// Pinned first, then most recent activity first.
    pub fn list_conversations(
        &self,
        project_id: &str,
        include_archived: bool,
    ) -> StashResult<Vec<Conversation>> {
        self.read(|conn| {
            project_tx(conn, project_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations \
                 WHERE project_id = ?1 AND (?2 OR status = 'active') \
                 ORDER BY pinned DESC, COALESCE(last_message_at, created_at) DESC, id"
            ))?;
            let conversations = stmt
                .query_map(params![project_id, include_archived], rows::conversation)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(conversations)
        })
    }

    pub fn update_conversation(
        &self,
        conversation_id: &str,
        update: &ConversationUpdate,
    ) -> StashResult<Conversation> {
        let title = update.title.as_deref().map(required_title).transpose()?;
        self.write(|tx, recorded| {
            let before = conversation_tx(tx, conversation_id)?;
            let archiving = before.status == ConversationStatus::Active
                && update.status == Some(ConversationStatus::Archived);
            let blocking_run = if archiving {
                active_run_tx(tx, conversation_id)?
            } else {
                None
            };
            if let Some(run) = blocking_run {
                return Err(StashError::conflict(format!(
                    "conversation {conversation_id} has {} run {}; cancel it before archiving",
                    run.status, run.id
                )));
            }
            tx.execute(
                "UPDATE conversations SET \
                   title = COALESCE(?2, title), \
                   pinned = COALESCE(?3, pinned), \
                   status = COALESCE(?4, status), \
                   summary = COALESCE(?5, summary) \
                 WHERE id = ?1",
                params![
                    conversation_id,
                    title,
                    update.pinned,
                    update.status.map(|s| s.as_str()),
                    update.summary,
                ],
            )?;
            let after = conversation_tx(tx, conversation_id)?;

            if before.status == ConversationStatus::Active
                && after.status == ConversationStatus::Archived
            {
                reassign_active_after_archive(tx, &after)?;
            }
            emit_conversation(
                tx,
                recorded,
                EventType::ConversationUpdated,
                &after,
                &update.changed_fields(),
            )?;
            Ok(after)
        })
    }

    /// Copy the prefix of `source_id` up to and including `from_message_id`
    /// into a new conversation, renumbered from 1. The source is not modified.
    pub fn fork_conversation(
        &self,
        source_id: &str,
        from_message_id: &str,
        title: Option<&str>,
    ) -> StashResult<Conversation> {
        let title = title.map(required_title).transpose()?;
        self.write(|tx, recorded| {
            let source = conversation_tx(tx, source_id)?;
            let from = message_tx(tx, from_message_id)?;
            if from.conversation_id != source.id {
                return Err(StashError::invalid(format!(
                    "message {from_message_id} does not belong to conversation {source_id}"
                )));
            }
            let title = title.unwrap_or_else(|| format!("{} (fork)", source.title));
            let prefix = messages_through(tx, &source.id, from.sequence_no)?;

            let fork = insert_conversation(
                tx,
                &source.project_id,
                &title,
                Some(&source.id),
                Some(&from.id),
            )?;
            emit_conversation(tx, recorded, EventType::ConversationCreated, &fork, &[])?;

            let id_map: HashMap<&str, String> = prefix
                .iter()
                .map(|m| (m.id.as_str(), new_id("msg")))
                .collect();
            let remap = |id: &Option<String>| {
                id.as_deref()
                    .and_then(|old| id_map.get(old))
                    .map(String::clone)
            };

            let mut last_message_at = None;
            for (offset, original) in prefix.iter().enumerate() {
                let mut copy = original.clone();
                copy.id = id_map[original.id.as_str()].clone();
                copy.conversation_id = fork.id.clone();
                copy.sequence_no = offset as i64 + 1;
                copy.parent_message_id = remap(&original.parent_message_id);
                copy.superseded_by = remap(&original.superseded_by);
                insert_message(tx, &copy, None)?;
                emit(
                    tx,
                    recorded,
                    NewEvent::new(EventType::MessageCreated, &copy.project_id)
                        .conversation(&fork.id)
                        .payload(json!({ "message": copy, "forked_from": original.id })),
                )?;
                last_message_at = Some(copy.created_at.clone());
            }
            tx.execute(
                "UPDATE conversations SET last_message_at = ?2 WHERE id = ?1",
                params![fork.id, last_message_at],
            )?;
            info!(
                source_id,
                fork_id = %fork.id,
                copied = prefix.len(),
                "forked conversation"
            );
            conversation_tx(tx, &fork.id)
        })
    }
}

fn required_title(title: &str) -> StashResult<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(StashError::invalid("conversation title must not be empty"));
    }
    Ok(title.to_string())
}

fn insert_conversation(
    conn: &Connection,
    project_id: &str,
    title: &str,
    parent_conversation_id: Option<&str>,
    parent_message_id: Option<&str>,
) -> StashResult<Conversation> {
    let id = new_id("conv");
    conn.execute(
        "INSERT INTO conversations \
         (id, project_id, title, status, pinned, created_at, parent_conversation_id, parent_message_id) \
         VALUES (?1, ?2, ?3, 'active', 0, ?4, ?5, ?6)",
        params![
            id,
            project_id,
            title,
            now_timestamp(),
            parent_conversation_id,
            parent_message_id
        ],
    )?;
    conversation_tx(conn, &id)
}

fn emit_conversation(
    conn: &Connection,
    recorded: &mut Vec<Event>,
    event_type: EventType,
    conversation: &Conversation,
    changed: &[&str],
) -> StashResult<Event> {
    let mut payload = json!({ "conversation": conversation });
    if !changed.is_empty() {
        payload["changed"] = json!(changed);
    }
    emit(
        conn,
        recorded,
        NewEvent::new(event_type, &conversation.project_id)
            .conversation(&conversation.id)
            .payload(payload),
    )
}

fn set_active(conn: &Connection, project_id: &str, conversation_id: Option<&str>) -> StashResult<()> {
    conn.execute(
        "UPDATE projects SET active_conversation_id = ?2 WHERE id = ?1",
        params![project_id, conversation_id],
    )?;
    Ok(())
}

/// Move the project's active pointer off a conversation that was just archived.
fn reassign_active_after_archive(conn: &Connection, archived: &Conversation) -> StashResult<()> {
    let project = project_tx(conn, &archived.project_id)?;
    if project.active_conversation_id.as_deref() != Some(archived.id.as_str()) {
        return Ok(());
    }
    let replacement: Option<String> = conn
        .query_row(
            "SELECT id FROM conversations \
             WHERE project_id = ?1 AND status = 'active' \
             ORDER BY COALESCE(last_message_at, created_at) DESC, id LIMIT 1",
            params![archived.project_id],
            |row| row.get(0),
        )
        .optional()?;
    set_active(conn, &archived.project_id, replacement.as_deref())
}

pub(super) fn conversation_tx(conn: &Connection, conversation_id: &str) -> StashResult<Conversation> {
    conn.query_row(
        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
        params![conversation_id],
        rows::conversation,
    )
    .optional()?
    .ok_or_else(|| StashError::not_found("conversation", conversation_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{NewMessage, Role};

    fn store_with_project() -> (tempfile::TempDir, HistoryStore, String) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::open_in_memory().expect("store");
        let project = store.open_project(None, temp.path()).expect("project");
        (temp, store, project.id)
    }

    #[test]
    fn first_conversation_becomes_active() {
        let (_temp, store, project_id) = store_with_project();
        let first = store.create_conversation(&project_id, "first").expect("first");
        store.create_conversation(&project_id, "second").expect("second");
        let project = store.get_project(&project_id).expect("project");
        assert_eq!(project.active_conversation_id, Some(first.id));
    }

    #[test]
    fn empty_title_is_invalid() {
        let (_temp, store, project_id) = store_with_project();
        let err = store.create_conversation(&project_id, "  ").unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn archiving_active_conversation_moves_pointer() {
        let (_temp, store, project_id) = store_with_project();
        let first = store.create_conversation(&project_id, "first").expect("first");
        let second = store.create_conversation(&project_id, "second").expect("second");

        let archived = store
            .update_conversation(
                &first.id,
                &ConversationUpdate {
                    status: Some(ConversationStatus::Archived),
                    ..ConversationUpdate::default()
                },
            )
            .expect("archive");
        assert_eq!(archived.status, ConversationStatus::Archived);

        let project = store.get_project(&project_id).expect("project");
        assert_eq!(project.active_conversation_id, Some(second.id.clone()));

        let visible = store.list_conversations(&project_id, false).expect("list");
        assert_eq!(visible.iter().map(|c| &c.id).collect::<Vec<_>>(), vec![&second.id]);
        assert_eq!(store.list_conversations(&project_id, true).expect("all").len(), 2);
    }

    #[test]
    fn pinned_conversations_list_first() {
        let (_temp, store, project_id) = store_with_project();
        let older = store.create_conversation(&project_id, "older").expect("older");
        store.create_conversation(&project_id, "newer").expect("newer");
        store
            .update_conversation(
                &older.id,
                &ConversationUpdate {
                    pinned: Some(true),
                    ..ConversationUpdate::default()
                },
            )
            .expect("pin");
        let listed = store.list_conversations(&project_id, false).expect("list");
        assert_eq!(listed[0].id, older.id);
        assert!(listed[0].pinned);
    }

    #[test]
    fn fork_remaps_references_inside_the_prefix() {
        let (_temp, store, project_id) = store_with_project();
        let source = store.create_conversation(&project_id, "source").expect("source");
        let (root, _) = store
            .append_message(&source.id, NewMessage::new(Role::User, "one"))
            .expect("one");
        let (reply, _) = store
            .append_message(
                &source.id,
                NewMessage::new(Role::Assistant, "two").with_parent(&root.id),
            )
            .expect("two");
        store
            .append_message(&source.id, NewMessage::new(Role::User, "three"))
            .expect("three");

        let fork = store
            .fork_conversation(&source.id, &reply.id, None)
            .expect("fork");
        assert_eq!(fork.title, "source (fork)");
        assert_eq!(fork.parent_conversation_id.as_deref(), Some(source.id.as_str()));
        assert_eq!(fork.parent_message_id.as_deref(), Some(reply.id.as_str()));

        let copied = store.list_messages(&fork.id, None, 100).expect("page").messages;
        assert_eq!(copied.len(), 2);
        assert_eq!(copied[1].parent_message_id.as_deref(), Some(copied[0].id.as_str()));
        assert_ne!(copied[0].id, root.id);
        assert_eq!(copied[0].created_at, root.created_at);
    }

    #[test]
    fn fork_rejects_foreign_message() {
        let (_temp, store, project_id) = store_with_project();
        let a = store.create_conversation(&project_id, "a").expect("a");
        let b = store.create_conversation(&project_id, "b").expect("b");
        let (in_b, _) = store
            .append_message(&b.id, NewMessage::new(Role::User, "hello"))
            .expect("append");
        let err = store.fork_conversation(&a.id, &in_b.id, None).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }
}
