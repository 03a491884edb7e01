use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Value, json};
use tracing::debug;

use super::conversations::conversation_tx;
use super::events::emit;
use super::rows::{self, MESSAGE_COLUMNS};
use super::{HistoryStore, MAX_PAGE_LIMIT};
use crate::core::types::{
    ConversationStatus, Event, EventType, Message, MessagePage, NewEvent, NewMessage,
};
use crate::error::{StashError, StashResult};
use crate::io::ids::{new_id, now_timestamp};

impl HistoryStore {
    /// Append a message at the next `sequence_no`.
    ///
    /// Returns `(message, created)`. Repeating an idempotency key with the same
    /// role and content returns the original message with `created == false`;
    /// repeating it with anything else is a conflict.
    pub fn append_message(
        &self,
        conversation_id: &str,
        new: NewMessage,
    ) -> StashResult<(Message, bool)> {
        let key = new
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        self.write(|tx, recorded| {
            let conversation = conversation_tx(tx, conversation_id)?;

            let existing = match key.as_deref() {
                Some(key) => message_by_key(tx, conversation_id, key)?,
                None => None,
            };
            if let Some(existing) = existing {
                if existing.role != new.role() || existing.content != new.content {
                    return Err(StashError::conflict(format!(
                        "idempotency key {:?} was already used for a different message",
                        key.as_deref().unwrap_or_default()
                    )));
                }
                debug!(message_id = %existing.id, "idempotent replay of message");
                return Ok((existing, false));
            }

            if conversation.status == ConversationStatus::Archived {
                return Err(StashError::conflict(format!(
                    "conversation {conversation_id} is archived"
                )));
            }
            if let Some(parent) = new.parent_message_id.as_deref() {
                message_tx(tx, parent)?;
            }

            let message = Message {
                id: new_id("msg"),
                project_id: conversation.project_id.clone(),
                conversation_id: conversation.id.clone(),
                role: new.role(),
                content: new.content,
                parts: new.parts,
                parent_message_id: new.parent_message_id,
                sequence_no: next_sequence_no(tx, conversation_id)?,
                created_at: now_timestamp(),
                superseded_by: None,
                metadata: normalize_metadata(new.metadata)?,
                asset_ids: new.asset_ids,
            };
            insert_message(tx, &message, key.as_deref())?;
            touch_conversation(tx, conversation_id, &message.created_at)?;
            emit_message_created(tx, recorded, &message)?;
            Ok((message, true))
        })
    }

    /// Replace a message's content by appending a successor and marking the
    /// original superseded. The original row is otherwise unchanged.
    pub fn supersede_message(
        &self,
        message_id: &str,
        content: &str,
        parts: Vec<Value>,
    ) -> StashResult<Message> {
        self.write(|tx, recorded| {
            let original = message_tx(tx, message_id)?;
            if let Some(successor) = &original.superseded_by {
                return Err(StashError::conflict(format!(
                    "message {message_id} is already superseded by {successor}"
                )));
            }
            let conversation = conversation_tx(tx, &original.conversation_id)?;
            if conversation.status == ConversationStatus::Archived {
                return Err(StashError::conflict(format!(
                    "conversation {} is archived",
                    conversation.id
                )));
            }

            let replacement = Message {
                id: new_id("msg"),
                project_id: original.project_id.clone(),
                conversation_id: original.conversation_id.clone(),
                role: original.role,
                content: content.to_string(),
                parts,
                parent_message_id: original.parent_message_id.clone(),
                sequence_no: next_sequence_no(tx, &original.conversation_id)?,
                created_at: now_timestamp(),
                superseded_by: None,
                metadata: json!({ "supersedes": original.id }),
                asset_ids: original.asset_ids.clone(),
            };
            insert_message(tx, &replacement, None)?;
            tx.execute(
                "UPDATE messages SET superseded_by = ?2 WHERE id = ?1",
                params![original.id, replacement.id],
            )?;
            touch_conversation(tx, &original.conversation_id, &replacement.created_at)?;
            emit_message_created(tx, recorded, &replacement)?;
            Ok(replacement)
        })
    }

    pub fn get_message(&self, message_id: &str) -> StashResult<Message> {
        self.read(|conn| message_tx(conn, message_id))
    }

    /// Messages with `sequence_no > cursor`, ascending.
    ///
    /// `limit` is clamped to `1..=MAX_PAGE_LIMIT`. `next_cursor` is set when the
    /// page is full and more messages may follow.
    pub fn list_messages(
        &self,
        conversation_id: &str,
        cursor: Option<i64>,
        limit: usize,
    ) -> StashResult<MessagePage> {
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        self.read(|conn| {
            conversation_tx(conn, conversation_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE conversation_id = ?1 AND sequence_no > ?2 \
                 ORDER BY sequence_no LIMIT ?3"
            ))?;
            let messages = stmt
                .query_map(
                    params![conversation_id, cursor.unwrap_or(0), limit as i64],
                    rows::message,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            let next_cursor = if messages.len() == limit {
                messages.last().map(|m| m.sequence_no)
            } else {
                None
            };
            Ok(MessagePage {
                messages,
                next_cursor,
            })
        })
    }

    /// The latest `limit` live (non-superseded) messages before `before_seq`,
    /// oldest first.
    pub fn transcript(
        &self,
        conversation_id: &str,
        before_seq: Option<i64>,
        limit: usize,
    ) -> StashResult<Vec<Message>> {
        self.read(|conn| {
            conversation_tx(conn, conversation_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE conversation_id = ?1 AND sequence_no < ?2 AND superseded_by IS NULL \
                 ORDER BY sequence_no DESC LIMIT ?3"
            ))?;
            let mut messages = stmt
                .query_map(
                    params![conversation_id, before_seq.unwrap_or(i64::MAX), limit as i64],
                    rows::message,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            messages.reverse();
            Ok(messages)
        })
    }
}

pub(super) fn message_tx(conn: &Connection, message_id: &str) -> StashResult<Message> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        params![message_id],
        rows::message,
    )
    .optional()?
    .ok_or_else(|| StashError::not_found("message", message_id))
}

/// Every message with `sequence_no <= through`, ascending.
pub(super) fn messages_through(
    conn: &Connection,
    conversation_id: &str,
    through: i64,
) -> StashResult<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE conversation_id = ?1 AND sequence_no <= ?2 ORDER BY sequence_no"
    ))?;
    let messages = stmt
        .query_map(params![conversation_id, through], rows::message)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

pub(super) fn insert_message(
    conn: &Connection,
    message: &Message,
    idempotency_key: Option<&str>,
) -> StashResult<()> {
    conn.execute(
        "INSERT INTO messages \
         (id, project_id, conversation_id, role, content, parts_json, parent_message_id, \
          sequence_no, created_at, superseded_by, idempotency_key, metadata_json, asset_ids_json) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            message.id,
            message.project_id,
            message.conversation_id,
            message.role.as_str(),
            message.content,
            serde_json::to_string(&message.parts)?,
            message.parent_message_id,
            message.sequence_no,
            message.created_at,
            message.superseded_by,
            idempotency_key,
            serde_json::to_string(&message.metadata)?,
            serde_json::to_string(&message.asset_ids)?,
        ],
    )?;
    Ok(())
}

fn message_by_key(
    conn: &Connection,
    conversation_id: &str,
    key: &str,
) -> StashResult<Option<Message>> {
    let message = conn
        .query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE conversation_id = ?1 AND idempotency_key = ?2"
            ),
            params![conversation_id, key],
            rows::message,
        )
        .optional()?;
    Ok(message)
}

fn next_sequence_no(conn: &Connection, conversation_id: &str) -> StashResult<i64> {
    let next = conn.query_row(
        "SELECT COALESCE(MAX(sequence_no), 0) + 1 FROM messages WHERE conversation_id = ?1",
        params![conversation_id],
        |row| row.get(0),
    )?;
    Ok(next)
}

fn touch_conversation(conn: &Connection, conversation_id: &str, at: &str) -> StashResult<()> {
    conn.execute(
        "UPDATE conversations SET last_message_at = ?2 WHERE id = ?1",
        params![conversation_id, at],
    )?;
    Ok(())
}

fn normalize_metadata(metadata: Option<Value>) -> StashResult<Value> {
    match metadata {
        None | Some(Value::Null) => Ok(json!({})),
        Some(value @ Value::Object(_)) => Ok(value),
        Some(_) => Err(StashError::invalid("message metadata must be a JSON object")),
    }
}

pub(super) fn emit_message_created(
    conn: &Connection,
    recorded: &mut Vec<Event>,
    message: &Message,
) -> StashResult<Event> {
    let mut event = NewEvent::new(EventType::MessageCreated, &message.project_id)
        .conversation(&message.conversation_id)
        .payload(json!({ "message": message }));
    if let Some(run_id) = message.metadata.get("run_id").and_then(Value::as_str) {
        event = event.run(run_id);
    }
    emit(conn, recorded, event)
}
