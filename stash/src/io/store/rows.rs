//! Row mappers between SQLite columns and record types.

use rusqlite::Row;
use rusqlite::types::Type;
use serde::de::DeserializeOwned;

use crate::core::types::{
    Conversation, ConversationStatus, Event, EventType, Message, Project, Role, Run, RunMode,
    RunStatus, RunStep, StepKind, StepStatus,
};

pub(super) const PROJECT_COLUMNS: &str =
    "id, name, root_path, created_at, last_opened_at, active_conversation_id";

pub(super) const CONVERSATION_COLUMNS: &str = "id, project_id, title, status, pinned, created_at, \
     last_message_at, summary, parent_conversation_id, parent_message_id";

pub(super) const MESSAGE_COLUMNS: &str = "id, project_id, conversation_id, role, content, \
     parts_json, parent_message_id, sequence_no, created_at, superseded_by, metadata_json, \
     asset_ids_json";

pub(super) const RUN_COLUMNS: &str = "id, project_id, conversation_id, trigger_message_id, \
     status, mode, output_summary, error, created_at, started_at, finished_at";

pub(super) const STEP_COLUMNS: &str =
    "run_id, step_index, kind, input_json, output_json, status, error, started_at, finished_at";

pub(super) const EVENT_COLUMNS: &str =
    "seq, id, event_type, project_id, conversation_id, run_id, created_at, payload_json";

fn enum_col<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    parse(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unrecognized value {text:?}").into(),
        )
    })
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn opt_json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|text| {
        serde_json::from_str(&text)
            .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
    })
    .transpose()
}

pub(super) fn project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        root_path: row.get(2)?,
        created_at: row.get(3)?,
        last_opened_at: row.get(4)?,
        active_conversation_id: row.get(5)?,
    })
}

pub(super) fn conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        status: enum_col(row, 3, ConversationStatus::parse)?,
        pinned: row.get(4)?,
        created_at: row.get(5)?,
        last_message_at: row.get(6)?,
        summary: row.get(7)?,
        parent_conversation_id: row.get(8)?,
        parent_message_id: row.get(9)?,
    })
}

pub(super) fn message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        project_id: row.get(1)?,
        conversation_id: row.get(2)?,
        role: enum_col(row, 3, Role::parse)?,
        content: row.get(4)?,
        parts: json_col(row, 5)?,
        parent_message_id: row.get(6)?,
        sequence_no: row.get(7)?,
        created_at: row.get(8)?,
        superseded_by: row.get(9)?,
        metadata: json_col(row, 10)?,
        asset_ids: json_col(row, 11)?,
    })
}

pub(super) fn run(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        project_id: row.get(1)?,
        conversation_id: row.get(2)?,
        trigger_message_id: row.get(3)?,
        status: enum_col(row, 4, RunStatus::parse)?,
        mode: enum_col(row, 5, RunMode::parse)?,
        output_summary: row.get(6)?,
        error: row.get(7)?,
        created_at: row.get(8)?,
        started_at: row.get(9)?,
        finished_at: row.get(10)?,
    })
}

pub(super) fn step(row: &Row<'_>) -> rusqlite::Result<RunStep> {
    Ok(RunStep {
        run_id: row.get(0)?,
        step_index: row.get(1)?,
        kind: enum_col(row, 2, StepKind::parse)?,
        input: json_col(row, 3)?,
        output: opt_json_col(row, 4)?,
        status: enum_col(row, 5, StepStatus::parse)?,
        error: row.get(6)?,
        started_at: row.get(7)?,
        finished_at: row.get(8)?,
    })
}

pub(super) fn event(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        seq: row.get(0)?,
        id: row.get(1)?,
        event_type: enum_col(row, 2, EventType::parse)?,
        project_id: row.get(3)?,
        conversation_id: row.get(4)?,
        run_id: row.get(5)?,
        created_at: row.get(6)?,
        payload: json_col(row, 7)?,
    })
}
