//! SQLite schema for the history store.

use rusqlite::Connection;

use crate::error::StashResult;

pub(super) fn install(conn: &Connection) -> StashResult<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        CREATE TABLE IF NOT EXISTS projects (
          id TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          root_path TEXT NOT NULL UNIQUE,
          created_at TEXT NOT NULL,
          last_opened_at TEXT NOT NULL,
          active_conversation_id TEXT
        );

        CREATE TABLE IF NOT EXISTS conversations (
          id TEXT PRIMARY KEY,
          project_id TEXT NOT NULL REFERENCES projects(id),
          title TEXT NOT NULL,
          status TEXT NOT NULL,
          pinned INTEGER NOT NULL DEFAULT 0,
          created_at TEXT NOT NULL,
          last_message_at TEXT,
          summary TEXT,
          parent_conversation_id TEXT REFERENCES conversations(id),
          parent_message_id TEXT
        );
        CREATE INDEX IF NOT EXISTS conversations_project
          ON conversations(project_id, status);

        CREATE TABLE IF NOT EXISTS messages (
          id TEXT PRIMARY KEY,
          project_id TEXT NOT NULL REFERENCES projects(id),
          conversation_id TEXT NOT NULL REFERENCES conversations(id),
          role TEXT NOT NULL,
          content TEXT NOT NULL,
          parts_json TEXT NOT NULL,
          parent_message_id TEXT,
          sequence_no INTEGER NOT NULL,
          created_at TEXT NOT NULL,
          superseded_by TEXT,
          idempotency_key TEXT,
          metadata_json TEXT NOT NULL,
          asset_ids_json TEXT NOT NULL,
          UNIQUE (conversation_id, sequence_no),
          UNIQUE (conversation_id, idempotency_key)
        );

        CREATE TABLE IF NOT EXISTS runs (
          id TEXT PRIMARY KEY,
          project_id TEXT NOT NULL REFERENCES projects(id),
          conversation_id TEXT NOT NULL REFERENCES conversations(id),
          trigger_message_id TEXT NOT NULL REFERENCES messages(id),
          status TEXT NOT NULL,
          mode TEXT NOT NULL,
          output_summary TEXT,
          error TEXT,
          created_at TEXT NOT NULL,
          started_at TEXT,
          finished_at TEXT
        );
        CREATE INDEX IF NOT EXISTS runs_conversation ON runs(conversation_id, created_at);
        CREATE INDEX IF NOT EXISTS runs_trigger ON runs(trigger_message_id, created_at);
        CREATE UNIQUE INDEX IF NOT EXISTS runs_one_active
          ON runs(conversation_id) WHERE status IN ('pending', 'running');

        CREATE TABLE IF NOT EXISTS run_steps (
          run_id TEXT NOT NULL REFERENCES runs(id),
          step_index INTEGER NOT NULL,
          kind TEXT NOT NULL,
          input_json TEXT NOT NULL,
          output_json TEXT,
          status TEXT NOT NULL,
          error TEXT,
          started_at TEXT NOT NULL,
          finished_at TEXT,
          PRIMARY KEY (run_id, step_index)
        );

        CREATE TABLE IF NOT EXISTS events (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          id TEXT NOT NULL UNIQUE,
          event_type TEXT NOT NULL,
          project_id TEXT NOT NULL REFERENCES projects(id),
          conversation_id TEXT,
          run_id TEXT,
          created_at TEXT NOT NULL,
          payload_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS events_project ON events(project_id, seq);
        "#,
    )?;
    Ok(())
}
